pub mod signal;
pub mod stats;
pub mod worker;

pub use worker::{ArbitrageEvaluator, EvaluatorSettings};
