use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GenerationConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic answers 529 when the service is overloaded; treated like 429.
const STATUS_OVERLOADED: u16 = 529;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("could not reach the generation service: {0}")]
    Network(String),
    #[error("generation service is rate limiting requests: {0}")]
    RateLimit(String),
    #[error("generation service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("generation was cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Authentication(_) => "AuthenticationError",
            GenerationError::Network(_) => "NetworkError",
            GenerationError::RateLimit(_) => "RateLimitError",
            GenerationError::Service { .. } => "ServiceError",
            GenerationError::Cancelled => "Cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Network(_) | GenerationError::RateLimit(_))
    }
}

/// Anything that turns a prompt into raw story text.
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

pub struct AnthropicClient {
    client: Client,
    config: GenerationConfig,
}

impl AnthropicClient {
    pub fn new(config: GenerationConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn perform_api_call(&self, api_key: &str, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        info!("🔗 Making request to: {} (model {})", url, self.config.model);

        let request_body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{ "role": "user", "content": prompt }]
        });

        let response = self.client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GenerationError::Network(describe_transport_error(&e)))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let response_text = response
            .text()
            .await
            .map_err(|e| GenerationError::Network(describe_transport_error(&e)))?;

        if !status.is_success() {
            error!("❌ API Error response: {}", truncate(&response_text, 500));
            return Err(classify_status(status, &response_text));
        }

        let parsed: MessagesResponse = serde_json::from_str(&response_text).map_err(|e| {
            GenerationError::Service { status: status.as_u16(), message: format!("undecodable response: {e}") }
        })?;

        let text = parsed.text();
        if text.trim().is_empty() {
            return Err(GenerationError::Service {
                status: status.as_u16(),
                message: "empty response from the generation service".to_string(),
            });
        }
        info!("✅ Received {} chars (stop reason: {})", text.len(), parsed.stop_reason.as_deref().unwrap_or("unknown"));
        Ok(text)
    }
}

#[async_trait]
impl StoryGenerator for AnthropicClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(GenerationError::Authentication(
                "ANTHROPIC_API_KEY is not configured".to_string(),
            ));
        };
        self.perform_api_call(api_key, prompt).await
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|env| env.error.message)
        .unwrap_or_else(|_| truncate(body, 200));
    match status.as_u16() {
        401 | 403 => GenerationError::Authentication(message),
        429 | STATUS_OVERLOADED => GenerationError::RateLimit(message),
        code => GenerationError::Service { status: code, message },
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self { max_retries: config.max_retries, base_backoff: config.backoff }
    }

    /// `base * 2^attempt` plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_cap = (exp.as_millis() / 4) as u64;
        let jitter = if jitter_cap == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_cap) };
        exp + Duration::from_millis(jitter)
    }
}

/// Wraps a generator, retrying network and rate-limit failures per `policy`.
/// Every other failure surfaces on the first attempt.
pub struct Retrying<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> Retrying<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<G: StoryGenerator> StoryGenerator for Retrying<G> {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(prompt).await {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay(attempt);
                    warn!("🔄 {} (attempt {}), retrying in {:?}", e, attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Runs `generator` until it finishes or `cancel` fires, whichever is first.
/// The provider call is dropped on cancellation.
pub async fn generate_cancellable(
    generator: &dyn StoryGenerator,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<String, GenerationError> {
    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("🛑 Generation abandoned by caller");
            Err(GenerationError::Cancelled)
        }
        result = generator.generate(prompt) => result,
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedGenerator;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};

    #[derive(Clone)]
    struct FakeProvider {
        calls: Arc<AtomicUsize>,
        script: Arc<Mutex<VecDeque<(u16, Value)>>>,
    }

    async fn messages(
        State(provider): State<FakeProvider>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (axum::http::StatusCode, Json<Value>) {
        provider.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert_eq!(headers.get("x-api-key").unwrap(), "test-key");
        assert_eq!(body["messages"][0]["role"], "user");
        let (status, reply) = provider
            .script
            .lock()
            .pop_front()
            .unwrap_or((500, json!({"type": "error", "error": {"type": "api_error", "message": "script exhausted"}})));
        (axum::http::StatusCode::from_u16(status).unwrap(), Json(reply))
    }

    /// Serves `/v1/messages` on an ephemeral port, answering from `script` in order.
    async fn spawn_provider(script: Vec<(u16, Value)>) -> (String, Arc<AtomicUsize>) {
        let provider = FakeProvider {
            calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(Mutex::new(script.into())),
        };
        let calls = provider.calls.clone();
        let app = Router::new().route("/v1/messages", post(messages)).with_state(provider);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), calls)
    }

    fn config(base_url: String, api_key: Option<&str>) -> GenerationConfig {
        GenerationConfig {
            api_key: api_key.map(String::from),
            base_url,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn text_reply(text: &str) -> (u16, Value) {
        (200, json!({"content": [{"type": "text", "text": text}], "stop_reason": "end_turn"}))
    }

    fn error_reply(status: u16, kind: &str, message: &str) -> (u16, Value) {
        (status, json!({"type": "error", "error": {"type": kind, "message": message}}))
    }

    fn retrying(config: GenerationConfig) -> Retrying<AnthropicClient> {
        let policy = RetryPolicy::from_config(&config);
        Retrying::new(AnthropicClient::new(config).unwrap(), policy)
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_network_io() {
        let (base, calls) = spawn_provider(vec![text_reply("never sent")]).await;
        let client = retrying(config(base, None));
        let err = client.generate("prompt").await.unwrap_err();
        assert!(matches!(err, GenerationError::Authentication(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn returns_concatenated_text_blocks() {
        let reply = (200, json!({"content": [
            {"type": "text", "text": "## Title\n"},
            {"type": "tool_use", "id": "x", "name": "n", "input": {}},
            {"type": "text", "text": "### Context\nBody"}
        ]}));
        let (base, calls) = spawn_provider(vec![reply]).await;
        let text = retrying(config(base, Some("test-key"))).generate("prompt").await.unwrap();
        assert_eq!(text, "## Title\n### Context\nBody");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let (base, calls) = spawn_provider(vec![
            error_reply(401, "authentication_error", "invalid x-api-key"),
            text_reply("unreachable"),
        ])
        .await;
        let err = retrying(config(base, Some("test-key"))).generate("prompt").await.unwrap_err();
        assert_eq!(err, GenerationError::Authentication("invalid x-api-key".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_once_then_succeeds() {
        let (base, calls) = spawn_provider(vec![
            error_reply(429, "rate_limit_error", "slow down"),
            text_reply("## Story"),
        ])
        .await;
        let text = retrying(config(base, Some("test-key"))).generate("prompt").await.unwrap();
        assert_eq!(text, "## Story");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_surfaces_after_retry_budget() {
        let (base, calls) = spawn_provider(vec![
            error_reply(429, "rate_limit_error", "slow down"),
            error_reply(529, "overloaded_error", "overloaded"),
            text_reply("unreachable"),
        ])
        .await;
        let err = retrying(config(base, Some("test-key"))).generate("prompt").await.unwrap_err();
        assert_eq!(err, GenerationError::RateLimit("overloaded".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn network_error_is_retried_then_succeeds() {
        let policy = RetryPolicy { max_retries: 1, base_backoff: Duration::from_millis(1) };
        let generator = Retrying::new(
            ScriptedGenerator::new(vec![Err(GenerationError::Network("connection reset".into())), Ok("## Story".into())]),
            policy,
        );
        assert_eq!(generator.generate("prompt").await.unwrap(), "## Story");
        assert_eq!(generator.inner.calls(), 2);
    }

    #[tokio::test]
    async fn server_error_surfaces_immediately() {
        let (base, calls) = spawn_provider(vec![
            error_reply(500, "api_error", "internal"),
            text_reply("unreachable"),
        ])
        .await;
        let err = retrying(config(base, Some("test-key"))).generate("prompt").await.unwrap_err();
        assert_eq!(err, GenerationError::Service { status: 500, message: "internal".into() });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_content_is_a_service_error() {
        let (base, _) = spawn_provider(vec![(200, json!({"content": []}))]).await;
        let err = retrying(config(base, Some("test-key"))).generate("prompt").await.unwrap_err();
        assert!(matches!(err, GenerationError::Service { status: 200, .. }));
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_network_error() {
        // bind then drop so the port is almost certainly closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = retrying(config(format!("http://{addr}"), Some("test-key")))
            .generate("prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn cancellation_abandons_the_call() {
        let generator = ScriptedGenerator::new(vec![Ok("late".into())]).with_delay(Duration::from_secs(30));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = generate_cancellable(&generator, "prompt", &token).await.unwrap_err();
        assert_eq!(err, GenerationError::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_generator() {
        let generator = ScriptedGenerator::new(vec![Ok("unused".into())]);
        let token = CancellationToken::new();
        token.cancel();
        let err = generate_cancellable(&generator, "prompt", &token).await.unwrap_err();
        assert_eq!(err, GenerationError::Cancelled);
        assert_eq!(generator.calls(), 0);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy { max_retries: 3, base_backoff: Duration::from_millis(100) };
        let first = policy.delay(0);
        let second = policy.delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
    }
}
