pub mod evaluation_service;

pub use evaluation_service::{
    decide, AlertState, EvaluationError, EvaluationReport, EvaluationService, PairOutcome,
    PairReport, Transition,
};
