//! Provider calls with gating, timeout, retry and abort.
//!
//! Every external call in the pipeline goes through [`RoleClient::call`]:
//!
//! 1. wait for the role's [`ProviderGate`] permit (in-flight cap + spacing);
//! 2. run the request under the role's per-call timeout;
//! 3. validate the answer with the caller's parser; a parse failure is a
//!    [`ProviderError::MalformedResponse`];
//! 4. on a retryable failure back off `retry_backoff_ms * 2^(attempt-1)`
//!    (or the provider's retry-after hint when larger) and try again.
//!
//! With 500 ms base and 3 retries the waits are 500 ms → 1 s → 2 s.
//!
//! Authentication failures are never retried: the client cancels the run's
//! [`CancellationToken`] and returns [`CallError::Fatal`]. Calls waiting in
//! backoff or in the gate observe the cancellation and return
//! [`CallError::Cancelled`].

use crate::config::{ProviderRole, ProviderSettings};
use crate::error::ProviderError;
use crate::limiter::ProviderGate;
use crate::provider::{CompletionProvider, Request};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A successful call.
#[derive(Debug, Clone)]
pub struct Called<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl<T> Called<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Why a call produced no value.
#[derive(Debug, Clone)]
pub enum CallError {
    /// Retries exhausted, or a non-retryable rejection.
    Failed { error: ProviderError, attempts: u32 },
    /// Credentials rejected; the run is being aborted.
    Fatal(ProviderError),
    /// The run was aborted while this call was pending.
    Cancelled,
}

impl CallError {
    /// Failure kind for the run report.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Failed { error, .. } | CallError::Fatal(error) => error.kind(),
            CallError::Cancelled => "aborted",
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            CallError::Failed { attempts, .. } => *attempts,
            CallError::Fatal(_) => 1,
            CallError::Cancelled => 0,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Failed { error, attempts } => {
                write!(f, "{error} (after {attempts} attempt(s))")
            }
            CallError::Fatal(error) => write!(f, "{error}"),
            CallError::Cancelled => f.write_str("run aborted"),
        }
    }
}

/// Everything needed to call one provider role.
#[derive(Clone)]
pub struct RoleClient {
    role: ProviderRole,
    provider: Arc<dyn CompletionProvider>,
    gate: Arc<ProviderGate>,
    settings: ProviderSettings,
    cancel: CancellationToken,
}

impl RoleClient {
    pub fn new(
        role: ProviderRole,
        provider: Arc<dyn CompletionProvider>,
        gate: Arc<ProviderGate>,
        settings: ProviderSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            role,
            provider,
            gate,
            settings,
            cancel,
        }
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Run `request` until `parse` accepts an answer or the policy gives up.
    ///
    /// `what` names the unit in logs (e.g. "a.pdf p3").
    pub async fn call<T, F>(&self, request: Request, what: &str, parse: F) -> Result<Called<T>, CallError>
    where
        F: Fn(&str) -> Result<T, String>,
    {
        let limits = self.settings.limits;
        let request = request.with_settings(&self.settings);
        let timeout = Duration::from_secs(limits.timeout_secs);
        let provider_name = self.provider.name().to_string();
        let start = Instant::now();
        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=limits.max_attempts() {
            if attempt > 1 {
                let backoff = backoff_for(limits.retry_backoff_ms, attempt, last_err.as_ref());
                warn!(
                    role = %self.role,
                    unit = what,
                    "retry {}/{} after {}ms",
                    attempt - 1,
                    limits.max_retries,
                    backoff.as_millis()
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(CallError::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }

            let _permit = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CallError::Cancelled),
                p = self.gate.acquire() => p,
            };
            if self.cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }

            let outcome = match tokio::time::timeout(timeout, self.provider.complete(&request)).await {
                Ok(Ok(completion)) => match parse(&completion.content) {
                    Ok(value) => {
                        debug!(
                            role = %self.role,
                            unit = what,
                            attempts = attempt,
                            input_tokens = completion.input_tokens,
                            output_tokens = completion.output_tokens,
                            "call succeeded in {:?}",
                            start.elapsed()
                        );
                        return Ok(Called {
                            value,
                            attempts: attempt,
                            input_tokens: completion.input_tokens,
                            output_tokens: completion.output_tokens,
                        });
                    }
                    Err(detail) => ProviderError::MalformedResponse {
                        provider: provider_name.clone(),
                        detail,
                    },
                },
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout {
                    provider: provider_name.clone(),
                    secs: limits.timeout_secs,
                },
            };

            if outcome.is_fatal() {
                warn!(role = %self.role, unit = what, "fatal provider error: {outcome}");
                self.cancel.cancel();
                return Err(CallError::Fatal(outcome));
            }

            warn!(
                role = %self.role,
                unit = what,
                "attempt {} failed: {}",
                attempt,
                outcome
            );

            if !outcome.is_retryable() {
                return Err(CallError::Failed {
                    error: outcome,
                    attempts: attempt,
                });
            }
            last_err = Some(outcome);
        }

        Err(CallError::Failed {
            error: last_err.unwrap_or_else(|| ProviderError::Transient {
                provider: provider_name,
                detail: "no attempt was made".into(),
            }),
            attempts: limits.max_attempts(),
        })
    }
}

/// Wait before `attempt` (2-based): exponential backoff, raised to the
/// provider's retry-after hint when one was given.
fn backoff_for(base_ms: u64, attempt: u32, last: Option<&ProviderError>) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(2)));
    let hinted = match last {
        Some(ProviderError::RateLimited {
            retry_after_secs: Some(secs),
            ..
        }) => secs.saturating_mul(1000),
        _ => 0,
    };
    Duration::from_millis(exp.max(hinted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, ProviderLimits};
    use crate::provider::Completion;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script of results, then repeats the last one.
    struct Scripted {
        script: Mutex<VecDeque<Result<&'static str, ProviderError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<&'static str, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: &Request) -> Result<Completion, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            };
            next.map(|s| Completion {
                content: s.to_string(),
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    fn transient() -> ProviderError {
        ProviderError::Transient {
            provider: "scripted".into(),
            detail: "503".into(),
        }
    }

    fn client(provider: Arc<Scripted>, max_retries: u32) -> (RoleClient, CancellationToken) {
        let mut settings = PipelineConfig::default().ocr;
        settings.limits = ProviderLimits {
            max_in_flight: 2,
            min_interval_ms: 0,
            max_retries,
            retry_backoff_ms: 1,
            timeout_secs: 5,
        };
        let gate = Arc::new(ProviderGate::new(ProviderRole::Ocr, &settings.limits));
        let cancel = CancellationToken::new();
        (
            RoleClient::new(ProviderRole::Ocr, provider, gate, settings, cancel.clone()),
            cancel,
        )
    }

    fn accept(s: &str) -> Result<String, String> {
        Ok(s.to_string())
    }

    #[tokio::test]
    async fn transient_errors_below_ceiling_succeed() {
        let p = Scripted::new(vec![Err(transient()), Err(transient()), Ok("text")]);
        let (c, _) = client(Arc::clone(&p), 3);
        let called = c.call(Request::text("s", "u"), "t", accept).await.unwrap();
        assert_eq!(called.value, "text");
        assert_eq!(called.attempts, 3);
        assert_eq!(called.retries(), 2);
        assert_eq!(p.calls(), 3);
    }

    #[tokio::test]
    async fn transient_errors_above_ceiling_fail() {
        let p = Scripted::new(vec![Err(transient())]);
        let (c, _) = client(Arc::clone(&p), 2);
        let err = c.call(Request::text("s", "u"), "t", accept).await.unwrap_err();
        assert!(matches!(err, CallError::Failed { attempts: 3, .. }), "{err}");
        assert_eq!(err.kind(), "transient");
        assert_eq!(p.calls(), 3);
    }

    #[tokio::test]
    async fn authentication_is_not_retried_and_cancels() {
        let p = Scripted::new(vec![Err(ProviderError::Authentication {
            provider: "scripted".into(),
            detail: "401".into(),
        })]);
        let (c, cancel) = client(Arc::clone(&p), 5);
        let err = c.call(Request::text("s", "u"), "t", accept).await.unwrap_err();
        assert!(matches!(err, CallError::Fatal(_)));
        assert_eq!(p.calls(), 1);
        assert!(cancel.is_cancelled());

        // Later calls see the abort without touching the provider.
        let err = c.call(Request::text("s", "u"), "t", accept).await.unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_is_not_retried() {
        let p = Scripted::new(vec![Err(ProviderError::Rejected {
            provider: "scripted".into(),
            detail: "context length".into(),
        })]);
        let (c, _) = client(Arc::clone(&p), 3);
        let err = c.call(Request::text("s", "u"), "t", accept).await.unwrap_err();
        assert!(matches!(err, CallError::Failed { attempts: 1, .. }));
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn parse_failures_are_retried_as_malformed() {
        let p = Scripted::new(vec![Ok("not json"), Ok("42")]);
        let (c, _) = client(Arc::clone(&p), 3);
        let called = c
            .call(Request::text("s", "u"), "t", |s| {
                s.trim().parse::<u32>().map_err(|e| e.to_string())
            })
            .await
            .unwrap();
        assert_eq!(called.value, 42);
        assert_eq!(called.attempts, 2);
    }

    #[test]
    fn backoff_doubles_and_honours_retry_after() {
        assert_eq!(backoff_for(500, 2, None), Duration::from_millis(500));
        assert_eq!(backoff_for(500, 3, None), Duration::from_millis(1000));
        assert_eq!(backoff_for(500, 4, None), Duration::from_millis(2000));
        let limited = ProviderError::RateLimited {
            provider: "p".into(),
            retry_after_secs: Some(3),
        };
        assert_eq!(backoff_for(500, 2, Some(&limited)), Duration::from_millis(3000));
    }
}
