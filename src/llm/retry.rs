//! Bounded retry with escalating prompt variants, gated by a validity check.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::client::ModelError;
use super::validation::CandidateValidation;

/// What to do when every attempt was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExhaustion {
    /// Return the last candidate the backend produced
    ReturnBestEffort,
    /// Fail with [`RetryError::Rejected`]
    Raise,
}

/// Configuration for one retried model step
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts (N)
    pub max_attempts: usize,
    /// Deadline for a single attempt; `None` leaves it to the client
    pub attempt_timeout: Option<Duration>,
    pub on_exhaustion: OnExhaustion,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Some(Duration::from_secs(120)),
            on_exhaustion: OnExhaustion::ReturnBestEffort,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, attempt_timeout: Option<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            ..Default::default()
        }
    }

    pub fn raising(mut self) -> Self {
        self.on_exhaustion = OnExhaustion::Raise;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.on_exhaustion = OnExhaustion::ReturnBestEffort;
        self
    }
}

/// A candidate that came out of the retry loop
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    /// Passed validation on `attempt` (1-based)
    Accepted { value: T, attempt: usize },
    /// Every attempt was rejected; this is the last candidate produced
    BestEffort {
        value: T,
        attempts: usize,
        reasons: Vec<String>,
    },
}

impl<T> RetryOutcome<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RetryOutcome::Accepted { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            RetryOutcome::Accepted { value, .. } | RetryOutcome::BestEffort { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            RetryOutcome::Accepted { value, .. } | RetryOutcome::BestEffort { value, .. } => value,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    /// The backend never produced a candidate
    #[error("{label}: model backend failed on all {attempts} attempts: {last}")]
    BackendFailed {
        label: String,
        attempts: usize,
        #[source]
        last: ModelError,
    },

    /// Candidates were produced but all rejected, under [`OnExhaustion::Raise`]
    #[error("{label}: no valid output after {attempts} attempts: {}", .reasons.join("; "))]
    Rejected {
        label: String,
        attempts: usize,
        reasons: Vec<String>,
    },
}

/// Run `call` up to `policy.max_attempts` times.
///
/// Attempt `k` (0-based) is handed prompt variant `min(k, variant_count - 1)`.
/// Backend errors and timeouts count as failed attempts. There is no delay
/// between attempts.
pub async fn retry_with_variants<T, F, Fut, V>(
    policy: &RetryPolicy,
    label: &str,
    variant_count: usize,
    mut call: F,
    validate: V,
) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
    V: Fn(&T) -> CandidateValidation,
{
    let attempts = policy.max_attempts.max(1);
    let last_variant = variant_count.saturating_sub(1);
    let mut last_candidate: Option<(T, Vec<String>)> = None;
    let mut last_error: Option<ModelError> = None;

    for attempt in 0..attempts {
        let variant = attempt.min(last_variant);
        debug!("{}: attempt {}/{} (variant {})", label, attempt + 1, attempts, variant);

        let result = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, call(variant)).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout(limit.as_secs())),
            },
            None => call(variant).await,
        };

        match result {
            Ok(candidate) => {
                let validation = validate(&candidate);
                if validation.is_valid {
                    return Ok(RetryOutcome::Accepted {
                        value: candidate,
                        attempt: attempt + 1,
                    });
                }
                warn!(
                    "{}: attempt {} rejected: {:?}",
                    label,
                    attempt + 1,
                    validation.reasons
                );
                last_candidate = Some((candidate, validation.reasons));
            }
            Err(e) => {
                warn!("{}: attempt {} failed: {}", label, attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    match (last_candidate, policy.on_exhaustion) {
        (Some((value, reasons)), OnExhaustion::ReturnBestEffort) => Ok(RetryOutcome::BestEffort {
            value,
            attempts,
            reasons,
        }),
        (Some((_, reasons)), OnExhaustion::Raise) => Err(RetryError::Rejected {
            label: label.to_string(),
            attempts,
            reasons,
        }),
        (None, _) => Err(RetryError::BackendFailed {
            label: label.to_string(),
            attempts,
            last: last_error.unwrap_or(ModelError::EmptyResponse),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn accept_long(s: &String) -> CandidateValidation {
        if s.len() > 3 {
            CandidateValidation::valid()
        } else {
            CandidateValidation::invalid(vec!["too short".to_string()])
        }
    }

    #[tokio::test]
    async fn test_accepts_first_valid_and_escalates_variants() {
        let seen = Mutex::new(Vec::new());
        let outcome = retry_with_variants(
            &RetryPolicy::new(3, None),
            "test",
            2,
            |variant| {
                seen.lock().unwrap().push(variant);
                let n = seen.lock().unwrap().len();
                async move { Ok(if n < 3 { "no".to_string() } else { "yes!".to_string() }) }
            },
            accept_long,
        )
        .await
        .unwrap();

        assert_eq!(outcome, RetryOutcome::Accepted { value: "yes!".to_string(), attempt: 3 });
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn test_best_effort_returns_last_candidate() {
        let calls = Mutex::new(0);
        let outcome = retry_with_variants(
            &RetryPolicy::new(3, None),
            "test",
            3,
            |_| {
                *calls.lock().unwrap() += 1;
                let n = *calls.lock().unwrap();
                async move { Ok(format!("{n}")) }
            },
            accept_long,
        )
        .await
        .unwrap();

        assert!(!outcome.is_accepted());
        assert_eq!(outcome.into_value(), "3");
    }

    #[tokio::test]
    async fn test_raise_on_rejection() {
        let err = retry_with_variants(
            &RetryPolicy::new(2, None).raising(),
            "enrich",
            1,
            |_| async { Ok("x".to_string()) },
            accept_long,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Rejected { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_backend_failure_on_every_attempt() {
        let err = retry_with_variants(
            &RetryPolicy::new(3, None),
            "anonymize",
            3,
            |_| async { Err::<String, _>(ModelError::Api { status: 500, body: "boom".into() }) },
            accept_long,
        )
        .await
        .unwrap_err();
        match err {
            RetryError::BackendFailed { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, ModelError::Api { status: 500, .. }));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_backend_error_then_candidate() {
        let calls = Mutex::new(0);
        let outcome = retry_with_variants(
            &RetryPolicy::new(3, None),
            "test",
            3,
            |_| {
                *calls.lock().unwrap() += 1;
                let n = *calls.lock().unwrap();
                async move {
                    if n == 1 {
                        Err(ModelError::EmptyResponse)
                    } else {
                        Ok("valid".to_string())
                    }
                }
            },
            accept_long,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RetryOutcome::Accepted { value: "valid".to_string(), attempt: 2 });
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let err = retry_with_variants(
            &RetryPolicy::new(2, Some(Duration::from_millis(10))),
            "slow",
            1,
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            },
            accept_long,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            RetryError::BackendFailed { last: ModelError::Timeout(_), .. }
        ));
    }
}
