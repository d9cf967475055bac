//! Completion gateway: provider adapters, retries and usage accounting.

pub mod completions;
pub mod error;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use completions::{ChatProvider, CompletionsAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use pricing::*;
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// The seam grading code talks to. One call in, one reply (or error) out.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Retry policy applied by [`ProviderGateway`] around each call.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl GatewayConfig {
    /// Single attempt, no retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    adapter: CompletionsAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(provider: Provider, usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let adapter = CompletionsAdapter::from_env(provider)?;
        Ok(Self {
            adapter,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        adapter: CompletionsAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapter,
            usage_sink,
            config,
        }
    }

    pub fn provider(&self) -> Provider {
        self.adapter.provider()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        if req.model.provider() != self.adapter.provider() {
            return Err(ProviderError::invalid_request(format!(
                "model {} belongs to {}, gateway is bound to {}",
                req.model.model_id(),
                req.model.provider(),
                self.adapter.provider()
            )));
        }

        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.adapter.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, attempt, None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(&req, &ChatResponse::empty(), attempt, Some(&err))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying completion call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::provider(self.adapter.provider().as_str(), "unknown error", false)
        }))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        attempt: u32,
        error: Option<&ProviderError>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider().as_str(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .attempt(attempt)
        .tokens(resp.input_tokens, resp.output_tokens)
        .cost(resp.cost_nanodollars)
        .job(req.attribution.job_id)
        .latency(resp.latency.as_millis() as u64);

        let record = match error {
            Some(err) => record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string)),
            None => record.request_id(resp.request_id.clone()),
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}
