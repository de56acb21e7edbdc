//! Type-change forecast results.

use std::collections::HashSet;

use serde::Serialize;
use tabula_core::{CellId, CellValue, ColumnId, ColumnType};

/// One sampled value and what converting it would do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionExample {
    pub cell_id: CellId,
    pub original: CellValue,
    /// Value after conversion, absent for failures.
    pub converted: Option<CellValue>,
    /// Warning for lossy conversions, error for failures.
    pub message: Option<String>,
}

/// Representative examples per outcome bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionExamples {
    pub success: Vec<ConversionExample>,
    pub lossy: Vec<ConversionExample>,
    pub fail: Vec<ConversionExample>,
}

/// Forecast of what changing a column's type would do to its cells.
///
/// `total_cells` is exact. The bucket counts are exact when the whole column
/// was sampled and extrapolated from the sample otherwise; `warnings` then
/// says so.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeChangeAnalysis {
    pub column_id: ColumnId,
    pub old_type: ColumnType,
    pub new_type: ColumnType,
    pub total_cells: u64,
    /// Number of cells actually inspected.
    pub sampled_cells: u64,
    pub convertible: u64,
    pub lossy_conversion: u64,
    pub will_fail: u64,
    pub examples: ConversionExamples,
    pub safe: bool,
    pub warnings: Vec<String>,
}

impl TypeChangeAnalysis {
    /// True when the change could lose or reject data.
    pub fn is_risky(&self) -> bool {
        !self.safe || self.will_fail > 0 || self.lossy_conversion > 0
    }
}

/// Bucket counters for a sample, with deduplicated examples.
#[derive(Debug)]
pub(crate) struct Tally {
    max_examples: usize,
    pub convertible: u64,
    pub lossy: u64,
    pub fail: u64,
    pub examples: ConversionExamples,
    seen_success: HashSet<String>,
    seen_lossy: HashSet<String>,
    seen_fail: HashSet<String>,
}

impl Tally {
    pub fn new(max_examples: usize) -> Self {
        Self {
            max_examples,
            convertible: 0,
            lossy: 0,
            fail: 0,
            examples: ConversionExamples::default(),
            seen_success: HashSet::new(),
            seen_lossy: HashSet::new(),
            seen_fail: HashSet::new(),
        }
    }

    /// Count a value that needs no inspection.
    pub fn skip(&mut self) {
        self.convertible += 1;
    }

    pub fn success(&mut self, example: ConversionExample) {
        self.convertible += 1;
        Self::keep(&mut self.examples.success, &mut self.seen_success, self.max_examples, example);
    }

    pub fn lossy(&mut self, example: ConversionExample) {
        self.lossy += 1;
        Self::keep(&mut self.examples.lossy, &mut self.seen_lossy, self.max_examples, example);
    }

    pub fn fail(&mut self, example: ConversionExample) {
        self.fail += 1;
        Self::keep(&mut self.examples.fail, &mut self.seen_fail, self.max_examples, example);
    }

    fn keep(
        bucket: &mut Vec<ConversionExample>,
        seen: &mut HashSet<String>,
        max: usize,
        example: ConversionExample,
    ) {
        if bucket.len() < max && seen.insert(example.original.stable_key()) {
            bucket.push(example);
        }
    }
}
