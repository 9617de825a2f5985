//! Client facade for batch chat-completion runs.
//!
//! An [`LlmClient`] is constructed against one endpoint and API key,
//! fetching the model catalog up front. Inputs accumulate on the client,
//! `run` fans them out across the worker pool, and the results come back
//! in input order.

use crate::error::{PoolError, Result};
use crate::limits::RateLimitLedger;
use crate::processor::{dispatch, JobSnapshot};
use crate::tracker::{ProgressCallback, ProgressTracker};
use crate::transport::{ApiCall, HttpTransport, Transport};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::info;

/// Approximate number of tokens per character by default.
pub const DEFAULT_TOKENS_PER_CHARACTER: f32 = 0.3;

/// Batch client for an OpenAI-style chat-completion API.
///
/// ```rust,no_run
/// use promptpool::LlmClient;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut client =
///         LlmClient::connect("https://api.openai.com/v1/", "sk-...", vec![]).await?;
///
///     client.set_model("gpt-4o-mini")?;
///     client.set_prompt("Answer in one sentence.");
///     client.add_text("What is a monad?");
///     client.run().await?;
///
///     for result in client.results() {
///         println!("{result}");
///     }
///     Ok(())
/// }
/// ```
pub struct LlmClient {
    transport: Arc<dyn Transport>,
    ledger: Arc<RateLimitLedger>,

    endpoint: String,
    api_key: String,
    extra_headers: Vec<String>,

    models: Vec<String>,
    model: String,
    prompt: String,
    max_tokens: u64,
    tokens_per_character: f32,
    max_workers: usize,
    progress_callback: Option<ProgressCallback>,

    inputs: Vec<String>,
    results: Vec<String>,
}

impl LlmClient {
    /// Connect to the API and cache its model catalog.
    ///
    /// `endpoint` is the base URL ending in `/`; `extra_headers` are
    /// literal `Name: value` lines sent with every request.
    pub async fn connect(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        extra_headers: Vec<String>,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new()?);
        Self::with_transport(transport, endpoint, api_key, extra_headers).await
    }

    /// Like [`connect`](Self::connect), over a caller-supplied transport.
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        extra_headers: Vec<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        let api_key = api_key.into();

        let call = ApiCall {
            url: format!("{endpoint}models"),
            api_key: api_key.clone(),
            extra_headers: extra_headers.clone(),
            body: None,
        };

        let reply = transport
            .execute(&call)
            .await
            .map_err(|e| PoolError::Catalog {
                message: e.to_string(),
            })?;
        let models = parse_catalog(&reply.body)?;

        info!(models = models.len(), endpoint = %endpoint, "fetched model catalog");

        Ok(Self {
            transport,
            ledger: Arc::new(RateLimitLedger::new()),
            endpoint,
            api_key,
            extra_headers,
            models,
            model: String::new(),
            prompt: String::new(),
            max_tokens: 0,
            tokens_per_character: DEFAULT_TOKENS_PER_CHARACTER,
            max_workers: 0,
            progress_callback: None,
            inputs: Vec::new(),
            results: Vec::new(),
        })
    }

    /// Select the model to use; it must appear in the cached catalog.
    pub fn set_model(&mut self, model: impl Into<String>) -> Result<()> {
        let model = model.into();

        if model.is_empty() {
            return Err(PoolError::InvalidConfig(
                "model name cannot be empty".to_string(),
            ));
        }
        if !self.models.iter().any(|m| *m == model) {
            return Err(PoolError::UnknownModel(model));
        }

        self.model = model;
        Ok(())
    }

    /// Set the system prompt; empty disables the system message.
    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    /// Set the approximate characters-to-tokens ratio used for admission
    /// estimates. The default is [`DEFAULT_TOKENS_PER_CHARACTER`].
    pub fn set_tokens_per_character(&mut self, ratio: f32) {
        self.tokens_per_character = ratio;
    }

    /// Cap the completion tokens per request; zero disables the cap.
    pub fn set_max_tokens(&mut self, max_tokens: u64) {
        self.max_tokens = max_tokens;
    }

    /// Bound the worker pool; zero means hardware concurrency.
    pub fn set_max_workers(&mut self, max_workers: usize) {
        self.max_workers = max_workers;
    }

    /// Register a progress callback, invoked with a fraction in `[0, 1]`
    /// after each completed text. May be called from several workers at
    /// once; thread safety is the callback's responsibility.
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
    }

    /// The cached model catalog, in the API's order.
    pub fn list_models(&self) -> &[String] {
        &self.models
    }

    /// Append one input text.
    pub fn add_text(&mut self, text: impl Into<String>) {
        self.inputs.push(text.into());
    }

    /// Append several input texts.
    pub fn add_texts<I>(&mut self, texts: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.inputs.extend(texts.into_iter().map(Into::into));
    }

    /// Process every input, blocking until all results are in or the first
    /// error surfaces.
    pub async fn run(&mut self) -> Result<()> {
        if self.model.is_empty() {
            return Err(PoolError::NoModelSelected);
        }

        let workers = resolve_workers(self.max_workers);
        info!(
            inputs = self.inputs.len(),
            workers,
            model = %self.model,
            "starting batch run"
        );

        let tracker = Arc::new(ProgressTracker::new(
            self.inputs.len(),
            self.progress_callback.clone(),
        ));

        let jobs: Vec<JobSnapshot> = self
            .inputs
            .iter()
            .map(|text| JobSnapshot {
                endpoint: self.endpoint.clone(),
                api_key: self.api_key.clone(),
                extra_headers: self.extra_headers.clone(),
                model: self.model.clone(),
                prompt: self.prompt.clone(),
                max_tokens: self.max_tokens,
                tokens_per_character: self.tokens_per_character,
                text: text.clone(),
            })
            .collect();

        self.results = dispatch(
            Arc::clone(&self.transport),
            Arc::clone(&self.ledger),
            jobs,
            workers,
            tracker,
        )
        .await?;

        Ok(())
    }

    /// The results of the last `run`, paired with the inputs by index.
    pub fn results(&self) -> &[String] {
        &self.results
    }

    /// Release per-run storage; the next `run` re-allocates it.
    pub fn free(&mut self) {
        self.results = Vec::new();
    }
}

/// Resolve the worker cap: explicit value, or hardware concurrency with a
/// floor of one.
fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

/// Parse the `GET {endpoint}models` reply into a list of model IDs.
fn parse_catalog(body: &Value) -> Result<Vec<String>> {
    let catalog = |message: &str| PoolError::Catalog {
        message: message.to_string(),
    };

    let object = body
        .as_object()
        .ok_or_else(|| catalog("top-level value is not an object"))?;
    if !object.contains_key("object") {
        return Err(catalog("missing 'object' member"));
    }

    let data = object
        .get("data")
        .ok_or_else(|| catalog("missing 'data' member"))?;
    let entries = data
        .as_array()
        .ok_or_else(|| catalog("'data' is not an array"))?;

    entries
        .iter()
        .map(|entry| {
            entry
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| catalog("model entry lacks a string 'id'"))
        })
        .collect()
}
