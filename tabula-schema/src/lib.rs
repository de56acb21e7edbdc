//! Tabula Schema - Conversion Rules and Type-Change Analysis
//!
//! [`ConversionRules`] converts single cell values between column types.
//! [`TypeChangeAnalyzer`] uses them on a sample of a column's cells to
//! forecast whether a type change is safe before it runs.

pub mod analysis;
pub mod analyzer;
pub mod rules;

pub use analysis::{ConversionExample, ConversionExamples, TypeChangeAnalysis};
pub use analyzer::TypeChangeAnalyzer;
pub use rules::{ConversionOutcome, ConversionRules, StandardConversionRules};
