//! Evaluation metrics and the dataset evaluator.

pub mod evaluator;
pub mod metrics;

pub use evaluator::{
    CaseResult, DEFAULT_RESULTS_PATH, DEFAULT_TEST_DATA, EvalCase, EvaluationReport, Evaluator,
    LossProbe,
};
pub use metrics::{BatchScores, TranslationScores};
