//! Column type-change risk analysis.

use std::fmt::Write as _;
use std::sync::Arc;

use tabula_core::{
    AnalyzerConfig, ColumnId, ColumnType, EntityIdType, EntityType, TabulaResult, ValidationError,
};
use tabula_storage::RelationalStore;

use crate::analysis::{ConversionExample, ConversionExamples, Tally, TypeChangeAnalysis};
use crate::rules::{ConversionRules, StandardConversionRules};

/// Forecasts how a column's cells would fare under a new type.
///
/// The analyzer only reads. It inspects a bounded sample of cells, so large
/// columns get extrapolated counts. It has no timeout of its own; wrap calls
/// in `tokio::time::timeout` if one is needed. Whether to go ahead with the
/// change is the caller's decision.
pub struct TypeChangeAnalyzer<S: RelationalStore, R: ConversionRules = StandardConversionRules> {
    store: Arc<S>,
    rules: R,
    config: AnalyzerConfig,
}

impl<S: RelationalStore> TypeChangeAnalyzer<S, StandardConversionRules> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_rules(store, StandardConversionRules)
    }
}

impl<S: RelationalStore, R: ConversionRules> TypeChangeAnalyzer<S, R> {
    pub fn with_rules(store: Arc<S>, rules: R) -> Self {
        Self {
            store,
            rules,
            config: AnalyzerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnalyzerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Forecast converting every cell of `column_id` to `new_type`.
    pub async fn analyze_type_change(
        &self,
        column_id: ColumnId,
        new_type: ColumnType,
    ) -> TabulaResult<TypeChangeAnalysis> {
        let column = self
            .store
            .column_get(column_id)
            .await?
            .ok_or(ValidationError::NotFound {
                entity_type: EntityType::Column,
                id: column_id.as_uuid(),
            })?;
        let old_type = column.column_type;
        let total_cells = self.store.cell_count_by_column(column_id).await?;

        if old_type.is_equivalent(new_type) {
            tracing::debug!(column_id = %column_id, %old_type, %new_type, "Type change is a no-op");
            return Ok(TypeChangeAnalysis {
                column_id,
                old_type,
                new_type,
                total_cells,
                sampled_cells: 0,
                convertible: total_cells,
                lossy_conversion: 0,
                will_fail: 0,
                examples: ConversionExamples::default(),
                safe: true,
                warnings: Vec::new(),
            });
        }

        let sample = self
            .store
            .cell_sample_by_column(column_id, self.config.sample_size, self.config.sampling)
            .await?;
        let sampled_cells = sample.len() as u64;

        let mut tally = Tally::new(self.config.max_examples);
        for cell in sample {
            if cell.value.is_empty() {
                tally.skip();
                continue;
            }
            let outcome = self.rules.attempt_conversion(&cell.value, old_type, new_type);
            if !outcome.success {
                tally.fail(ConversionExample {
                    cell_id: cell.id,
                    original: cell.value,
                    converted: None,
                    message: Some(
                        outcome
                            .error
                            .unwrap_or_else(|| self.rules.conversion_description(old_type, new_type)),
                    ),
                });
            } else if outcome.is_lossy() {
                tally.lossy(ConversionExample {
                    cell_id: cell.id,
                    original: cell.value,
                    converted: outcome.new_value,
                    message: outcome.warning,
                });
            } else {
                tally.success(ConversionExample {
                    cell_id: cell.id,
                    original: cell.value,
                    converted: outcome.new_value,
                    message: None,
                });
            }
        }

        let mut warnings = Vec::new();
        let (mut convertible, mut lossy_conversion, mut will_fail) = (tally.convertible, tally.lossy, tally.fail);
        if sampled_cells > 0 && sampled_cells < total_cells {
            let ratio = total_cells as f64 / sampled_cells as f64;
            let scale = |count: u64| (count as f64 * ratio).round() as u64;
            convertible = scale(convertible);
            lossy_conversion = scale(lossy_conversion);
            will_fail = scale(will_fail);

            if ratio > self.config.extrapolation_warning_ratio {
                warnings.push(format!(
                    "Only {} of {} cells were analyzed; counts are statistical estimates",
                    sampled_cells, total_cells
                ));
            }
        }

        let safe = lossy_conversion == 0 && will_fail == 0;
        if safe {
            tracing::debug!(column_id = %column_id, %old_type, %new_type, total_cells, "Type change forecast is safe");
        } else {
            tracing::warn!(
                column_id = %column_id,
                %old_type,
                %new_type,
                total_cells,
                lossy = lossy_conversion,
                failing = will_fail,
                "Type change would lose or reject data"
            );
        }

        Ok(TypeChangeAnalysis {
            column_id,
            old_type,
            new_type,
            total_cells,
            sampled_cells,
            convertible,
            lossy_conversion,
            will_fail,
            examples: tally.examples,
            safe,
            warnings,
        })
    }

    /// True if changing the type could lose or reject data.
    pub async fn is_type_change_risky(&self, column_id: ColumnId, new_type: ColumnType) -> TabulaResult<bool> {
        Ok(self.analyze_type_change(column_id, new_type).await?.is_risky())
    }

    /// Operator-facing synopsis of an analysis.
    pub fn get_analysis_summary(&self, analysis: &TypeChangeAnalysis) -> String {
        let mut out = String::new();
        if analysis.safe {
            let _ = write!(
                out,
                "Changing {} to {} is fully safe: all {} cells convert without data loss.",
                analysis.old_type, analysis.new_type, analysis.total_cells
            );
        } else {
            let _ = writeln!(
                out,
                "Changing {} to {} affects {} cells ({}):",
                analysis.old_type,
                analysis.new_type,
                analysis.total_cells,
                self.rules.conversion_description(analysis.old_type, analysis.new_type)
            );
            let _ = writeln!(out, "- {} convert cleanly", analysis.convertible);
            let _ = write!(out, "- {} convert with data loss", analysis.lossy_conversion);
            write_examples(&mut out, &analysis.examples.lossy);
            let _ = write!(out, "\n- {} cannot be converted", analysis.will_fail);
            write_examples(&mut out, &analysis.examples.fail);
        }
        for warning in &analysis.warnings {
            let _ = write!(out, "\nWarning: {}", warning);
        }
        out
    }
}

fn write_examples(out: &mut String, examples: &[ConversionExample]) {
    if examples.is_empty() {
        return;
    }
    let rendered: Vec<String> = examples
        .iter()
        .map(|e| match (&e.converted, &e.message) {
            (Some(to), _) => format!("{} -> {}", e.original, to),
            (None, Some(msg)) => format!("{}: {}", e.original, msg),
            (None, None) => e.original.to_string(),
        })
        .collect();
    let _ = write!(out, " (e.g. {})", rendered.join("; "));
}
