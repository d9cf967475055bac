//! Batched grouping evaluation.
//!
//! One batch of [`GroupingTask`]s becomes one prompt, one completion call and
//! one reply. The reply is parsed into records ([`reply`]) which are then
//! aligned back to the tasks by their `Task N` numbers ([`assemble`]).

pub mod assemble;
pub mod error;
pub mod grader;
pub mod reply;
pub mod trace;
pub mod types;

pub use assemble::assemble;
pub use error::GradingError;
pub use grader::{
    build_request, grade_batch, grade_batch_with_trace, grade_task, interpret_reply,
    max_output_tokens, validate_batch, BatchGrading, BatchUsage, GradingOptions,
    GRADING_TEMPERATURE,
};
pub use reply::{parse_reply, ParsedRecord, ParsedReply, RecordDefect, RejectedRecord, ReplyField};
pub use trace::{BatchTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use types::{Bound, Grade, GradedTask, GradingResult, GroupingTask, ValueRange};
