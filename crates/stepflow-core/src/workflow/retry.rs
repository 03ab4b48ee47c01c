//! Retry policy engine.
//!
//! Stateless: decides whether a failed task gets another attempt and how long
//! to wait before it. A task runs at most `max_attempts` times in total, so
//! with `retry_count` retries already performed another attempt is allowed
//! while `retry_count + 1 < max_attempts`.
//!
//! Delays, indexed by the retry count before the retry is performed:
//! - `Fixed`: `initial`
//! - `Linear`: `initial * (retry_count + 1)`
//! - `Exponential`: `initial * 2^retry_count`
//!
//! all capped at `max_delay`.

use std::time::Duration;

use stepflow_types::execution::TaskExecution;
use stepflow_types::workflow::{BackoffKind, RetryPolicy};

/// Outcome of a retry consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the task after the given delay.
    Retry(Duration),
    /// Attempts are exhausted; hand over to the error coordinator.
    GiveUp,
}

pub struct RetryPolicyEngine;

impl RetryPolicyEngine {
    /// Decide what happens after a failed attempt of `task`.
    pub fn should_retry(task: &TaskExecution, policy: Option<&RetryPolicy>) -> RetryDecision {
        Self::decide(task.retry_count, policy)
    }

    /// `retry_count` is the number of retries already performed (0 after the
    /// first attempt fails). No policy means no retries.
    pub fn decide(retry_count: u32, policy: Option<&RetryPolicy>) -> RetryDecision {
        match policy {
            Some(policy) if retry_count.saturating_add(1) < policy.max_attempts => {
                RetryDecision::Retry(Self::delay_for(policy, retry_count))
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Backoff delay before retry number `retry_count + 1`.
    pub fn delay_for(policy: &RetryPolicy, retry_count: u32) -> Duration {
        let initial = policy.initial_delay_ms;
        let raw = match policy.backoff {
            BackoffKind::Fixed => initial,
            BackoffKind::Linear => initial.saturating_mul(u64::from(retry_count) + 1),
            BackoffKind::Exponential => {
                let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
                initial.saturating_mul(factor)
            }
        };
        Duration::from_millis(raw.min(policy.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffKind, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    fn delays(policy: &RetryPolicy, n: u32) -> Vec<u64> {
        (0..n)
            .map(|i| RetryPolicyEngine::delay_for(policy, i).as_millis() as u64)
            .collect()
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let p = policy(BackoffKind::Exponential, 10);
        assert_eq!(delays(&p, 7), vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_exponential_never_overflows() {
        let p = policy(BackoffKind::Exponential, u32::MAX);
        assert_eq!(RetryPolicyEngine::delay_for(&p, 200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        assert_eq!(
            delays(&policy(BackoffKind::Linear, 10), 5),
            vec![100, 200, 300, 400, 500]
        );
        assert_eq!(delays(&policy(BackoffKind::Fixed, 10), 3), vec![100, 100, 100]);
    }

    #[test]
    fn test_total_attempts_bounded_by_max_attempts() {
        let p = policy(BackoffKind::Fixed, 3);
        assert_eq!(
            RetryPolicyEngine::decide(0, Some(&p)),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert!(matches!(
            RetryPolicyEngine::decide(1, Some(&p)),
            RetryDecision::Retry(_)
        ));
        assert_eq!(RetryPolicyEngine::decide(2, Some(&p)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_should_retry_reads_task_retry_count() {
        let p = policy(BackoffKind::Exponential, 5);
        let task: TaskExecution = serde_json::from_value(serde_json::json!({
            "execution_id": uuid::Uuid::now_v7(),
            "task_id": "charge",
            "step_id": "charge",
            "kind": "service",
            "status": "running",
            "retry_count": 3,
        }))
        .unwrap();
        assert_eq!(
            RetryPolicyEngine::should_retry(&task, Some(&p)),
            RetryDecision::Retry(Duration::from_millis(800))
        );
    }

    #[test]
    fn test_single_attempt_and_no_policy_give_up() {
        let p = policy(BackoffKind::Fixed, 1);
        assert_eq!(RetryPolicyEngine::decide(0, Some(&p)), RetryDecision::GiveUp);
        assert_eq!(RetryPolicyEngine::decide(0, None), RetryDecision::GiveUp);
    }
}
