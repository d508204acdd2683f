//! # Retry Ledger
//!
//! Bounds how often a handler may reject the same message.
//!
//! The broker does not count redeliveries for us, so each consumer loop keeps
//! a side table keyed by the broker message id (or a SHA-256 fingerprint of
//! the body when the producer set no id). Once a message has been rejected
//! more than `max_redeliveries` times it leaves the queue: it is republished
//! to the dead-letter exchange when one is configured, dropped otherwise.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::ports::Delivery;
use crate::DEFAULT_MAX_REDELIVERIES;

/// Upper bound on tracked keys. Beyond it the ledger forgets everything,
/// which at worst grants a message a fresh budget.
pub const LEDGER_CAPACITY: usize = 10_000;

/// How a consumer treats handler rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` requeues forever.
    pub max_redeliveries: Option<u32>,
    /// Destination for messages over the bound.
    pub dead_letter_exchange: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_REDELIVERIES)
    }
}

impl RetryPolicy {
    /// Requeue at most `max_redeliveries` times, then drop.
    #[must_use]
    pub fn bounded(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries: Some(max_redeliveries),
            dead_letter_exchange: None,
        }
    }

    /// Requeue immediately and without limit.
    ///
    /// A handler that always rejects will spin on the same message.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_redeliveries: None,
            dead_letter_exchange: None,
        }
    }

    /// Route messages over the bound to `exchange` instead of dropping them.
    #[must_use]
    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// What to do with a rejected delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hand it back to the queue. `attempt` counts rejections so far.
    Requeue { attempt: u32 },
    /// Republish to the dead-letter exchange, then ack.
    DeadLetter { attempts: u32, exchange: String },
    /// Reject without requeue.
    Drop { attempts: u32 },
}

/// Per-loop rejection counters.
#[derive(Debug)]
pub struct RetryLedger {
    policy: RetryPolicy,
    rejections: HashMap<String, u32>,
}

impl RetryLedger {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rejections: HashMap::new(),
        }
    }

    /// Ledger key of a delivery.
    #[must_use]
    pub fn key_for(delivery: &Delivery) -> String {
        match &delivery.message_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("sha256:{:x}", Sha256::digest(&delivery.body)),
        }
    }

    /// Count a rejection of `key` and decide its fate.
    pub fn record_rejection(&mut self, key: &str) -> RetryDecision {
        let Some(max) = self.policy.max_redeliveries else {
            return RetryDecision::Requeue { attempt: 0 };
        };

        if self.rejections.len() >= LEDGER_CAPACITY && !self.rejections.contains_key(key) {
            self.rejections.clear();
        }

        let count = self.rejections.entry(key.to_string()).or_insert(0);
        *count += 1;
        let attempts = *count;

        if attempts <= max {
            return RetryDecision::Requeue { attempt: attempts };
        }

        self.rejections.remove(key);
        match &self.policy.dead_letter_exchange {
            Some(exchange) => RetryDecision::DeadLetter {
                attempts,
                exchange: exchange.clone(),
            },
            None => RetryDecision::Drop { attempts },
        }
    }

    /// The message left the queue; forget it.
    pub fn settle(&mut self, key: &str) {
        self.rejections.remove(key);
    }

    /// Rejections recorded for `key`.
    #[must_use]
    pub fn attempts(&self, key: &str) -> u32 {
        self.rejections.get(key).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rejections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rejections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::ports::Acknowledger;
    use async_trait::async_trait;

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn reject(&self, _requeue: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[test]
    fn test_bound_then_dead_letter() {
        let mut ledger = RetryLedger::new(RetryPolicy::bounded(2).with_dead_letter("dlx"));

        assert_eq!(ledger.record_rejection("m1"), RetryDecision::Requeue { attempt: 1 });
        assert_eq!(ledger.record_rejection("m1"), RetryDecision::Requeue { attempt: 2 });
        assert_eq!(
            ledger.record_rejection("m1"),
            RetryDecision::DeadLetter {
                attempts: 3,
                exchange: "dlx".into()
            }
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_bound_without_dead_letter_drops() {
        let mut ledger = RetryLedger::new(RetryPolicy::bounded(0));
        assert_eq!(ledger.record_rejection("m1"), RetryDecision::Drop { attempts: 1 });
    }

    #[test]
    fn test_unbounded_always_requeues() {
        let mut ledger = RetryLedger::new(RetryPolicy::unbounded());
        for _ in 0..100 {
            assert_eq!(ledger.record_rejection("m1"), RetryDecision::Requeue { attempt: 0 });
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_keys_are_independent_and_settle_forgets() {
        let mut ledger = RetryLedger::new(RetryPolicy::bounded(5));
        ledger.record_rejection("a");
        ledger.record_rejection("a");
        ledger.record_rejection("b");
        assert_eq!(ledger.attempts("a"), 2);
        assert_eq!(ledger.attempts("b"), 1);

        ledger.settle("a");
        assert_eq!(ledger.attempts("a"), 0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_key_prefers_message_id() {
        let with_id =
            Delivery::new(b"payload".to_vec(), Box::new(NoopAcker)).with_message_id(Some("id-1".into()));
        assert_eq!(RetryLedger::key_for(&with_id), "id-1");

        let a = Delivery::new(b"payload".to_vec(), Box::new(NoopAcker));
        let b = Delivery::new(b"payload".to_vec(), Box::new(NoopAcker));
        let c = Delivery::new(b"other".to_vec(), Box::new(NoopAcker));
        assert!(RetryLedger::key_for(&a).starts_with("sha256:"));
        assert_eq!(RetryLedger::key_for(&a), RetryLedger::key_for(&b));
        assert_ne!(RetryLedger::key_for(&a), RetryLedger::key_for(&c));
    }
}
