#![forbid(unsafe_code)]

//! # grouping-grader
//!
//! Ask a language model how commonly a proposed set of numeric groupings is
//! used for a feature ("Age in Years" split 0-12, 13-19, 20-64, 65-100) and
//! get back a typed 1–4 grade per grouping.
//!
//! Several groupings are batched into one prompt. The reply is free text in a
//! fixed `Task N:` record template; [`grading::reply`] parses it with a small
//! line-oriented state machine and [`grading::assemble`] aligns the records
//! back to the input tasks by number. Any structural inconsistency fails the
//! whole batch rather than returning misaligned grades.
//!
//! [`stats`] and [`dataset`] compare model grades against human questionnaire
//! responses (Fleiss' kappa, Krippendorff's alpha, Kendall/Spearman/Pearson).

pub mod dataset;
pub mod gateway;
pub mod grading;
pub mod prompts;
pub mod stats;

pub use dataset::{load_responses, AgreementReport, DatasetError, ResponseTable};
pub use gateway::{
    Attribution, ChatGateway, ChatModel, GatewayConfig, Provider, ProviderError,
    ProviderGateway, UsageSink,
};
pub use grading::{
    grade_batch, grade_batch_with_trace, grade_task, interpret_reply, BatchGrading, Grade,
    GradedTask, GradingError, GradingOptions, GradingResult, GroupingTask, JsonlTraceSink,
    TraceSink, ValueRange,
};
pub use stats::{CorrelationResult, RankingComparison, StatsError};
