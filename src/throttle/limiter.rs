//! Core throttle engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use super::clock::{Clock, SystemClock};
use super::counter::{seconds_until_reset, WindowKey};
use super::registry::{RuleSet, ThrottleRule};
use super::request::RequestDescriptor;
use super::store::{CounterStore, MemoryStore};
use crate::error::{FloodgateError, Result};

/// What to do when a rule cannot be evaluated (a resolver failed, a dynamic
/// value was zero, or the counter store errored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Skip the failing rule and keep evaluating the others
    #[default]
    Allow,
    /// Abort the evaluation with the error
    Reject,
}

/// Outcome of one rule for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Name of the rule
    pub rule: String,
    /// Resolved discriminator value
    pub discriminator: String,
    /// Whether the request is within the limit
    pub allowed: bool,
    /// Resolved limit
    pub limit: u64,
    /// Resolved period in seconds
    pub period: u64,
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Seconds until the current window ends
    pub retry_after: u64,
}

impl Verdict {
    /// Requests left in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// The verdicts of every applicable rule, in rule registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    verdicts: Vec<Verdict>,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.denied().is_none()
    }

    /// The first denying verdict, if any.
    pub fn denied(&self) -> Option<&Verdict> {
        self.verdicts.iter().find(|verdict| !verdict.allowed)
    }

    /// Seconds the client should wait, taken from the first denying rule.
    pub fn retry_after(&self) -> Option<u64> {
        self.denied().map(|verdict| verdict.retry_after)
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn get(&self, rule: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|verdict| verdict.rule == rule)
    }
}

/// Evaluates registered rules against requests using fixed, epoch-aligned
/// windows.
///
/// Thread-safe; share one instance behind an `Arc` across all requests.
pub struct Throttler {
    rules: RuleSet,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
}

impl Throttler {
    pub fn new(rules: RuleSet, store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules,
            store,
            clock,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// A throttler over a fresh in-memory store and the system clock.
    pub fn in_memory(rules: RuleSet) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self::new(rules, store, clock)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Count the request against every rule and decide whether it may pass.
    ///
    /// Every applicable rule is evaluated, even after one denies, so all
    /// counters see the request. Evaluation failures follow the configured
    /// [`FailurePolicy`].
    pub async fn check(&self, request: &RequestDescriptor) -> Result<Decision> {
        let now = self.clock.unix_secs();
        let mut verdicts = Vec::with_capacity(self.rules.len());

        for rule in self.rules.iter() {
            match self.evaluate_rule(rule, request, now).await {
                Ok(Some(verdict)) => {
                    if !verdict.allowed {
                        debug!(
                            rule = %verdict.rule,
                            discriminator = %verdict.discriminator,
                            count = verdict.count,
                            limit = verdict.limit,
                            retry_after = verdict.retry_after,
                            "Throttle limit exceeded"
                        );
                    }
                    verdicts.push(verdict);
                }
                Ok(None) => {}
                Err(err) => match self.failure_policy {
                    FailurePolicy::Allow => {
                        error!(rule = %rule.name(), error = %err, "Throttle evaluation failed; skipping rule");
                    }
                    FailurePolicy::Reject => {
                        error!(rule = %rule.name(), error = %err, "Throttle evaluation failed; rejecting request");
                        return Err(err);
                    }
                },
            }
        }

        Ok(Decision { verdicts })
    }

    /// Evaluate a single rule at `now` (unix seconds), incrementing its counter.
    ///
    /// Returns `None` when the rule does not apply to the request.
    pub async fn evaluate_rule(
        &self,
        rule: &ThrottleRule,
        request: &RequestDescriptor,
        now: u64,
    ) -> Result<Option<Verdict>> {
        let Some(discriminator) = resolve_discriminator(rule, request)? else {
            trace!(rule = %rule.name(), "Rule does not apply to request");
            return Ok(None);
        };

        let period = resolve_period(rule, request)?;
        let key = WindowKey::at(rule.name(), &discriminator, period, now);
        let retry_after = seconds_until_reset(now, period);

        // The counter lives exactly until the window boundary.
        let count = self.store.increment(&key.to_store_key(), retry_after).await?;
        let limit = resolve_limit(rule, request)?;

        trace!(key = %key, count, limit, period, "Evaluated throttle rule");

        Ok(Some(Verdict {
            rule: rule.name().to_string(),
            discriminator,
            allowed: count <= limit,
            limit,
            period,
            count,
            retry_after,
        }))
    }

    /// Inspect a rule's current window without counting the request.
    ///
    /// `allowed` reports whether one more request would pass. Returns `None`
    /// for unknown rules or when the rule does not apply.
    pub async fn peek(&self, rule: &str, request: &RequestDescriptor) -> Result<Option<Verdict>> {
        let Some(rule) = self.rules.get(rule) else {
            return Ok(None);
        };
        let Some(discriminator) = resolve_discriminator(rule, request)? else {
            return Ok(None);
        };

        let now = self.clock.unix_secs();
        let period = resolve_period(rule, request)?;
        let limit = resolve_limit(rule, request)?;
        let key = WindowKey::at(rule.name(), &discriminator, period, now);
        let count = self.store.get(&key.to_store_key()).await?.unwrap_or(0);

        Ok(Some(Verdict {
            rule: rule.name().to_string(),
            discriminator,
            allowed: count < limit,
            limit,
            period,
            count,
            retry_after: seconds_until_reset(now, period),
        }))
    }

    /// Drop all counters.
    pub async fn reset(&self) -> Result<()> {
        self.store.clear().await?;
        Ok(())
    }
}

fn resolve_discriminator(rule: &ThrottleRule, request: &RequestDescriptor) -> Result<Option<String>> {
    rule.discriminator()
        .resolve(request)
        .map_err(|source| FloodgateError::Resolve {
            rule: rule.name().to_string(),
            field: "discriminator",
            source,
        })
}

fn resolve_period(rule: &ThrottleRule, request: &RequestDescriptor) -> Result<u64> {
    let period = rule
        .period()
        .resolve(request)
        .map_err(|source| FloodgateError::Resolve {
            rule: rule.name().to_string(),
            field: "period",
            source,
        })?;
    if period == 0 {
        return Err(FloodgateError::InvalidPeriod {
            rule: rule.name().to_string(),
        });
    }
    Ok(period)
}

fn resolve_limit(rule: &ThrottleRule, request: &RequestDescriptor) -> Result<u64> {
    let limit = rule
        .limit()
        .resolve(request)
        .map_err(|source| FloodgateError::Resolve {
            rule: rule.name().to_string(),
            field: "limit",
            source,
        })?;
    if limit == 0 {
        return Err(FloodgateError::InvalidLimit {
            rule: rule.name().to_string(),
        });
    }
    Ok(limit)
}
