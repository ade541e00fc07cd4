//! Throttle rules and the rule registry.

use std::collections::HashSet;

use tracing::info;

use super::resolver::{Discriminator, Resolver};
use crate::error::{FloodgateError, Result};

/// A named throttle: at most `limit` requests per `period` seconds for each
/// discriminator value.
#[derive(Debug, Clone)]
pub struct ThrottleRule {
    name: String,
    discriminator: Discriminator,
    limit: Resolver<u64>,
    period: Resolver<u64>,
}

impl ThrottleRule {
    /// Create and validate a rule.
    ///
    /// Fixed limits and periods must be positive. Dynamic ones are checked
    /// each time they are resolved.
    pub fn new(
        name: impl Into<String>,
        limit: impl Into<Resolver<u64>>,
        period: impl Into<Resolver<u64>>,
        discriminator: Discriminator,
    ) -> Result<Self> {
        let rule = Self {
            name: name.into(),
            discriminator,
            limit: limit.into(),
            period: period.into(),
        };
        rule.validate()?;
        Ok(rule)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name must not be empty"));
        }
        if self.limit.fixed() == Some(&0) {
            return Err(self.invalid("limit must be positive"));
        }
        if self.period.fixed() == Some(&0) {
            return Err(self.invalid("period must be positive"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> FloodgateError {
        FloodgateError::InvalidRule {
            rule: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn limit(&self) -> &Resolver<u64> {
        &self.limit
    }

    pub fn period(&self) -> &Resolver<u64> {
        &self.period
    }
}

/// The registered rules, in registration order.
///
/// Built once at startup and read-only afterwards; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ThrottleRule>,
}

impl RuleSet {
    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&ThrottleRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThrottleRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Collects rules, rejecting invalid or duplicate ones as they are added.
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    rules: Vec<ThrottleRule>,
    names: HashSet<String>,
}

impl RuleSetBuilder {
    /// Register a throttle rule.
    pub fn throttle(
        self,
        name: impl Into<String>,
        limit: impl Into<Resolver<u64>>,
        period: impl Into<Resolver<u64>>,
        discriminator: Discriminator,
    ) -> Result<Self> {
        self.rule(ThrottleRule::new(name, limit, period, discriminator)?)
    }

    /// Register an already-built rule.
    pub fn rule(mut self, rule: ThrottleRule) -> Result<Self> {
        if !self.names.insert(rule.name.clone()) {
            return Err(FloodgateError::DuplicateRule(rule.name));
        }
        info!(
            rule = %rule.name,
            limit = ?rule.limit,
            period = ?rule.period,
            "Registered throttle rule"
        );
        self.rules.push(rule);
        Ok(self)
    }

    pub fn build(self) -> RuleSet {
        RuleSet { rules: self.rules }
    }
}
