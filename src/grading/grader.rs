//! Batch grading: render, call, parse, assemble.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChatResponse, FinishReason, Provider,
};
use crate::prompts::{render_batch, PromptInstance};

use super::assemble::assemble;
use super::error::GradingError;
use super::reply::{parse_reply, RejectedRecord};
use super::trace::{now_epoch_ms, BatchTrace, TraceSink};
use super::types::{GradedTask, GroupingTask};

// =============================================================================
// Constants
// =============================================================================

pub const GRADING_TEMPERATURE: f32 = 0.2;

/// Output budget floor; enough for a handful of records.
pub const MAX_OUTPUT_TOKENS_BASE: u32 = 1000;
/// Per-task allowance once a batch outgrows the floor.
pub const MAX_OUTPUT_TOKENS_PER_TASK: u32 = 300;

pub fn max_output_tokens(task_count: usize) -> u32 {
    let per_task = MAX_OUTPUT_TOKENS_PER_TASK.saturating_mul(task_count as u32);
    MAX_OUTPUT_TOKENS_BASE.max(per_task)
}

// Search-backed models get a narrower sampling window and recent sources.
const PERPLEXITY_TOP_P: f32 = 0.9;
const PERPLEXITY_FREQUENCY_PENALTY: f32 = 1.0;
const PERPLEXITY_RECENCY: &str = "month";

// =============================================================================
// Options and results
// =============================================================================

#[derive(Debug, Clone)]
pub struct GradingOptions {
    pub model: ChatModel,
    pub temperature: f32,
    /// `None` derives the budget from the batch size.
    pub max_output_tokens: Option<u32>,
    pub caller: &'static str,
    pub job_id: Option<Uuid>,
}

impl Default for GradingOptions {
    fn default() -> Self {
        Self {
            model: ChatModel::default(),
            temperature: GRADING_TEMPERATURE,
            max_output_tokens: None,
            caller: "grading",
            job_id: None,
        }
    }
}

impl GradingOptions {
    pub fn for_model(model: ChatModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    fn attribution(&self) -> Attribution {
        let attribution = Attribution::new(self.caller);
        match self.job_id {
            Some(id) => attribution.with_job(id),
            None => attribution,
        }
    }
}

/// Token, cost and timing for one batch call.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency_ms: u64,
    pub truncated: bool,
}

impl BatchUsage {
    fn from_response(resp: &ChatResponse) -> Self {
        Self {
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
            latency_ms: resp.latency.as_millis() as u64,
            truncated: resp.finish_reason == FinishReason::Length,
        }
    }
}

/// A fully graded batch, aligned to the input tasks.
#[derive(Debug, Clone)]
pub struct BatchGrading {
    pub results: Vec<GradedTask>,
    /// Malformed records dropped while parsing. Non-empty only when the
    /// model emitted extra blocks besides one good record per task.
    pub rejected: Vec<RejectedRecord>,
    pub usage: BatchUsage,
}

// =============================================================================
// Operations
// =============================================================================

/// Reject an empty batch or any task that fails validation.
pub fn validate_batch(tasks: &[GroupingTask]) -> Result<(), GradingError> {
    if tasks.is_empty() {
        return Err(GradingError::InvalidTask("batch contains no tasks".to_string()));
    }
    for (idx, task) in tasks.iter().enumerate() {
        task.validate()
            .map_err(|msg| GradingError::InvalidTask(format!("task {}: {msg}", idx + 1)))?;
    }
    Ok(())
}

/// Build the completion request for a rendered batch.
pub fn build_request(prompt: &PromptInstance, options: &GradingOptions) -> ChatRequest {
    let max_tokens = options
        .max_output_tokens
        .unwrap_or_else(|| max_output_tokens(prompt.task_count));

    let request = ChatRequest::new(
        options.model.clone(),
        prompt.to_messages(),
        options.attribution(),
    )
    .temperature(options.temperature)
    .max_tokens(max_tokens);

    match options.model.provider() {
        Provider::Perplexity => request
            .top_p(PERPLEXITY_TOP_P)
            .frequency_penalty(PERPLEXITY_FREQUENCY_PENALTY)
            .search_recency(PERPLEXITY_RECENCY),
        Provider::OpenAI | Provider::OpenRouter => request,
    }
}

/// Parse and align a raw reply without calling anything.
pub fn interpret_reply(
    tasks: &[GroupingTask],
    raw_reply: &str,
) -> Result<Vec<GradedTask>, GradingError> {
    validate_batch(tasks)?;
    assemble(tasks, parse_reply(raw_reply), raw_reply)
}

/// Grade a batch with one completion call.
///
/// Any failure fails the whole batch; no partial results are returned.
pub async fn grade_batch(
    gateway: &dyn ChatGateway,
    tasks: &[GroupingTask],
    options: &GradingOptions,
) -> Result<BatchGrading, GradingError> {
    validate_batch(tasks)?;

    let prompt = render_batch(tasks);
    let request = build_request(&prompt, options);
    debug!(
        tasks = tasks.len(),
        model = request.model.model_id(),
        input_chars = request.input_chars(),
        max_tokens = ?request.max_tokens,
        "sending grading batch"
    );

    let response = gateway.chat(request).await?;
    let usage = BatchUsage::from_response(&response);
    if usage.truncated {
        warn!(
            tasks = tasks.len(),
            output_tokens = response.output_tokens,
            "reply hit the output token limit; trailing records may be missing"
        );
    }

    let parsed = parse_reply(&response.content);
    let rejected = parsed.rejected.clone();
    let results = assemble(tasks, parsed, &response.content)?;

    Ok(BatchGrading {
        results,
        rejected,
        usage,
    })
}

/// Grade a single task as a batch of one.
pub async fn grade_task(
    gateway: &dyn ChatGateway,
    task: &GroupingTask,
    options: &GradingOptions,
) -> Result<GradedTask, GradingError> {
    let mut graded = grade_batch(gateway, std::slice::from_ref(task), options).await?;
    graded
        .results
        .pop()
        .ok_or_else(|| GradingError::InvalidTask("batch of one produced no result".to_string()))
}

/// [`grade_batch`] plus one [`BatchTrace`] line, success or failure.
pub async fn grade_batch_with_trace(
    gateway: &dyn ChatGateway,
    tasks: &[GroupingTask],
    options: &GradingOptions,
    trace: Option<&dyn TraceSink>,
) -> Result<BatchGrading, GradingError> {
    let started = std::time::Instant::now();
    let outcome = grade_batch(gateway, tasks, options).await;

    if let Some(sink) = trace {
        let event = trace_event(tasks, options, &outcome, started.elapsed());
        if let Err(err) = sink.record(event) {
            warn!(error = %err, "failed to record grading trace");
        }
    }

    outcome
}

fn trace_event(
    tasks: &[GroupingTask],
    options: &GradingOptions,
    outcome: &Result<BatchGrading, GradingError>,
    elapsed: Duration,
) -> BatchTrace {
    let mut event = BatchTrace {
        timestamp_ms: now_epoch_ms(),
        batch_id: options
            .job_id
            .unwrap_or_else(Uuid::new_v4)
            .to_string(),
        template_slug: crate::prompts::TEMPLATE_SLUG.to_string(),
        provider: options.model.provider().as_str().to_string(),
        model: options.model.model_id().to_string(),
        task_count: tasks.len(),
        feature_names: tasks.iter().map(|t| t.feature_name.clone()).collect(),
        parsed_count: 0,
        rejected_count: 0,
        input_tokens: 0,
        output_tokens: 0,
        provider_cost_nanodollars: 0,
        latency_ms: elapsed.as_millis() as u64,
        error_code: None,
        error: None,
    };

    match outcome {
        Ok(batch) => {
            event.parsed_count = batch.results.len();
            event.rejected_count = batch.rejected.len();
            event.input_tokens = batch.usage.input_tokens;
            event.output_tokens = batch.usage.output_tokens;
            event.provider_cost_nanodollars = batch.usage.cost_nanodollars;
            event.latency_ms = batch.usage.latency_ms;
        }
        Err(err) => {
            event.error_code = Some(err.code().to_string());
            event.error = Some(err.to_string());
        }
    }
    event
}
