//! Batch dispatch across a bounded worker pool.
//!
//! Inputs are fanned out in input order onto at most `workers` concurrent
//! jobs. Each job snapshots the run settings, waits for rate-limit
//! admission, performs its request, stores the extracted content at its
//! input index, and feeds the response headers back into the ledger.
//! The first job error aborts the run: no new requests start, in-flight
//! requests are awaited, and the error surfaces from the dispatcher.

use crate::error::{PoolError, Result};
use crate::limits::{estimate_tokens, RateLimitLedger, RateLimitUpdate};
use crate::request::{build_chat_body, extract_content};
use crate::tracker::ProgressTracker;
use crate::transport::{ApiCall, Transport};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Immutable per-job copy of the run settings.
///
/// Taken when the job starts so in-flight work is decoupled from the
/// facade's mutable state.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Base URL of the API, ending in `/`.
    pub endpoint: String,
    /// Bearer token.
    pub api_key: String,
    /// Literal extra header lines.
    pub extra_headers: Vec<String>,
    /// Selected model ID.
    pub model: String,
    /// System prompt; empty disables the system message.
    pub prompt: String,
    /// Completion-token cap; zero disables the field.
    pub max_tokens: u64,
    /// Characters-to-tokens estimate ratio.
    pub tokens_per_character: f32,
    /// The text this job processes.
    pub text: String,
}

/// Dispatch `jobs` with at most `workers` in flight and return the results
/// in input order.
pub async fn dispatch(
    transport: Arc<dyn Transport>,
    ledger: Arc<RateLimitLedger>,
    jobs: Vec<JobSnapshot>,
    workers: usize,
    tracker: Arc<ProgressTracker>,
) -> Result<Vec<String>> {
    let total = jobs.len();
    let results = Arc::new(Mutex::new(vec![String::new(); total]));
    let abort = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<PoolError>>> = Arc::new(Mutex::new(None));

    stream::iter(jobs.into_iter().enumerate())
        .map(|(index, job)| {
            let transport = Arc::clone(&transport);
            let ledger = Arc::clone(&ledger);
            let results = Arc::clone(&results);
            let abort = Arc::clone(&abort);
            let first_error = Arc::clone(&first_error);
            let tracker = Arc::clone(&tracker);

            async move {
                if abort.load(Ordering::Relaxed) {
                    return;
                }

                match run_job(transport.as_ref(), &ledger, &job, &abort).await {
                    Ok(Some(content)) => {
                        results.lock()[index] = content;
                        tracker.complete_one();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(index, error = %e, "job failed, aborting run");
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        abort.store(true, Ordering::Relaxed);
                    }
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<()>>()
        .await;

    if let Some(e) = first_error.lock().take() {
        return Err(e);
    }

    let results = Arc::try_unwrap(results)
        .map(Mutex::into_inner)
        .unwrap_or_else(|shared| shared.lock().clone());

    Ok(results)
}

/// Run one job to completion.
///
/// Returns `Ok(None)` when the run was aborted before this job was
/// admitted; no request is issued in that case.
async fn run_job(
    transport: &dyn Transport,
    ledger: &RateLimitLedger,
    job: &JobSnapshot,
    abort: &AtomicBool,
) -> Result<Option<String>> {
    let est_tokens = estimate_tokens(&job.text, job.tokens_per_character);
    if !ledger.admit(est_tokens, abort).await {
        return Ok(None);
    }

    let call = ApiCall {
        url: format!("{}chat/completions", job.endpoint),
        api_key: job.api_key.clone(),
        extra_headers: job.extra_headers.clone(),
        body: build_chat_body(&job.model, &job.prompt, &job.text, job.max_tokens),
    };

    let reply = transport.execute(&call).await?;
    let content = extract_content(&reply.body)?;

    match RateLimitUpdate::from_headers(&reply.headers) {
        Some(update) => ledger.ingest(update),
        None => debug!("response carried no complete rate-limit header set"),
    }

    Ok(Some(content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ApiReply;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn snapshot(text: &str) -> JobSnapshot {
        JobSnapshot {
            endpoint: "https://api.test/v1/".to_string(),
            api_key: "sk-test".to_string(),
            extra_headers: vec![],
            model: "gpt-x".to_string(),
            prompt: String::new(),
            max_tokens: 0,
            tokens_per_character: 0.3,
            text: text.to_string(),
        }
    }

    fn rate_limit_headers(remaining_requests: u64, reset: &str) -> Vec<(String, String)> {
        [
            ("x-ratelimit-limit-requests", "100".to_string()),
            ("x-ratelimit-limit-tokens", "100000".to_string()),
            (
                "x-ratelimit-remaining-requests",
                remaining_requests.to_string(),
            ),
            ("x-ratelimit-remaining-tokens", "99000".to_string()),
            ("x-ratelimit-reset-requests", reset.to_string()),
            ("x-ratelimit-reset-tokens", "1m".to_string()),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }

    /// Echoes the user message back, tracking peak concurrency.
    struct EchoTransport {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl EchoTransport {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn execute(&self, call: &ApiCall) -> Result<ApiReply> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let body = call.body.as_ref().expect("chat call carries a body");
            let text = body["messages"]
                .as_array()
                .unwrap()
                .last()
                .unwrap()["content"]
                .as_str()
                .unwrap();

            Ok(ApiReply {
                body: json!({
                    "choices": [{"message": {"role": "assistant", "content": format!("echo:{text}")}}],
                }),
                headers: vec![],
            })
        }
    }

    /// Fails every request whose user message matches `poison`.
    struct PoisonTransport {
        poison: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for PoisonTransport {
        async fn execute(&self, call: &ApiCall) -> Result<ApiReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = call.body.as_ref().unwrap();
            let text = body["messages"].as_array().unwrap().last().unwrap()["content"]
                .as_str()
                .unwrap()
                .to_string();

            tokio::time::sleep(Duration::from_millis(10)).await;

            if text == self.poison {
                Ok(ApiReply {
                    body: json!({
                        "error": {"type": "invalid_request_error", "message": "bad"},
                    }),
                    headers: vec![],
                })
            } else {
                Ok(ApiReply {
                    body: json!({"choices": [{"message": {"content": "fine"}}]}),
                    headers: vec![],
                })
            }
        }
    }

    /// First response exhausts the request budget with a short reset.
    struct ThrottleTransport {
        first: AtomicBool,
        reset: String,
    }

    #[async_trait]
    impl Transport for ThrottleTransport {
        async fn execute(&self, _call: &ApiCall) -> Result<ApiReply> {
            let headers = if self.first.swap(false, Ordering::SeqCst) {
                rate_limit_headers(0, &self.reset)
            } else {
                vec![]
            };

            Ok(ApiReply {
                body: json!({"choices": [{"message": {"content": "ok"}}]}),
                headers,
            })
        }
    }

    async fn run(
        transport: Arc<dyn Transport>,
        texts: &[&str],
        workers: usize,
        tracker: Arc<ProgressTracker>,
    ) -> Result<Vec<String>> {
        let jobs = texts.iter().map(|t| snapshot(t)).collect();
        dispatch(
            transport,
            Arc::new(RateLimitLedger::new()),
            jobs,
            workers,
            tracker,
        )
        .await
    }

    #[tokio::test]
    async fn test_results_pair_with_inputs() {
        let transport = Arc::new(EchoTransport::new(Duration::from_millis(5)));
        let tracker = Arc::new(ProgressTracker::new(3, None));

        let results = run(transport, &["a", "b", "c"], 2, tracker).await.unwrap();

        assert_eq!(results, vec!["echo:a", "echo:b", "echo:c"]);
    }

    #[tokio::test]
    async fn test_concurrency_stays_bounded() {
        let transport = Arc::new(EchoTransport::new(Duration::from_millis(30)));
        let tracker = Arc::new(ProgressTracker::new(6, None));

        let results = run(
            Arc::clone(&transport) as Arc<dyn Transport>,
            &["a", "b", "c", "d", "e", "f"],
            2,
            tracker,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 6);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_progress_reaches_one() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = Arc::new(ProgressTracker::new(
            1,
            Some(Arc::new(move |f: f32| sink.lock().push(f))),
        ));
        let transport = Arc::new(EchoTransport::new(Duration::from_millis(1)));

        run(transport, &["hello"], 1, tracker).await.unwrap();

        assert_eq!(*seen.lock(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_aborts() {
        let transport = Arc::new(PoisonTransport {
            poison: "b".to_string(),
            calls: AtomicUsize::new(0),
        });
        let tracker = Arc::new(ProgressTracker::new(8, None));

        let err = run(
            Arc::clone(&transport) as Arc<dyn Transport>,
            &["a", "b", "c", "d", "e", "f", "g", "h"],
            1,
            tracker,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("[invalid_request_error] bad"));
        // With one worker the failure lands on the second call; jobs after it
        // see the abort flag and never reach the transport.
        assert!(transport.calls.load(Ordering::SeqCst) < 8);
    }

    #[tokio::test]
    async fn test_rate_limit_stall_delays_next_request() {
        let transport = Arc::new(ThrottleTransport {
            first: AtomicBool::new(true),
            reset: "300ms".to_string(),
        });
        let tracker = Arc::new(ProgressTracker::new(2, None));

        let start = Instant::now();
        let results = run(transport, &["a", "b"], 1, tracker).await.unwrap();

        assert_eq!(results, vec!["ok", "ok"]);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_empty_input_list() {
        let transport = Arc::new(EchoTransport::new(Duration::ZERO));
        let tracker = Arc::new(ProgressTracker::new(0, None));

        let results = run(transport, &[], 4, tracker).await.unwrap();
        assert!(results.is_empty());
    }
}
