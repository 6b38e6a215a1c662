//! Description vs. artifact comparison

pub mod calculator;

pub use calculator::{DiffCalculator, DiffResult, FieldClass, FieldDiff};
