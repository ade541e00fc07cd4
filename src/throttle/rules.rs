//! Declarative throttle rules.
//!
//! Rules can be written in YAML instead of code. Discriminators and dynamic
//! values are limited to what a request exposes without custom logic: the
//! source address and header values.
//!
//! ```yaml
//! rules:
//!   - name: by ip
//!     discriminator:
//!       source: remote_addr
//!     limit:
//!       header: x-apikey
//!       default: 1
//!       values:
//!         private-secret: 2
//!     period: 60
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::registry::{RuleSet, ThrottleRule};
use super::request::RequestDescriptor;
use super::resolver::{Discriminator, Resolver};
use crate::error::{FloodgateError, Result};

/// A list of declarative rules, in evaluation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One declarative throttle rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name
    pub name: String,
    /// Where the discriminator comes from
    pub discriminator: DiscriminatorConfig,
    /// Maximum requests per window
    pub limit: ValueConfig,
    /// Window length in seconds
    pub period: ValueConfig,
}

/// Source of a declarative discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DiscriminatorConfig {
    /// The request's source IP address
    RemoteAddr,
    /// The value of a request header
    Header { name: String },
}

/// A limit or period: either a constant or looked up from a header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueConfig {
    Fixed(u64),
    ByHeader {
        /// Header to read
        header: String,
        /// Value used when the header is absent or not listed
        default: u64,
        /// Header value -> resolved value
        #[serde(default)]
        values: HashMap<String, u64>,
    },
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse throttle rules: {}", e)))
    }

    /// Validate the rules and build the registry.
    pub fn into_rule_set(self) -> Result<RuleSet> {
        self.rules
            .into_iter()
            .try_fold(RuleSet::builder(), |builder, rule| builder.rule(rule.into_rule()?))
            .map(|builder| builder.build())
    }
}

impl RuleConfig {
    pub fn into_rule(self) -> Result<ThrottleRule> {
        let limit = self.limit.into_resolver(&self.name, "limit")?;
        let period = self.period.into_resolver(&self.name, "period")?;
        let discriminator = match self.discriminator {
            DiscriminatorConfig::RemoteAddr => Discriminator::by_ip(),
            DiscriminatorConfig::Header { name } => Discriminator::by_header(name),
        };
        ThrottleRule::new(self.name, limit, period, discriminator)
    }
}

impl ValueConfig {
    fn into_resolver(self, rule: &str, field: &str) -> Result<Resolver<u64>> {
        match self {
            ValueConfig::Fixed(value) => Ok(Resolver::Fixed(value)),
            ValueConfig::ByHeader {
                header,
                default,
                values,
            } => {
                if default == 0 || values.values().any(|v| *v == 0) {
                    return Err(FloodgateError::InvalidRule {
                        rule: rule.to_string(),
                        reason: format!("{} values must be positive", field),
                    });
                }
                Ok(Resolver::from_fn(move |request: &RequestDescriptor| {
                    request
                        .header(&header)
                        .and_then(|value| values.get(value))
                        .copied()
                        .unwrap_or(default)
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIERED: &str = r#"
rules:
  - name: by ip
    discriminator:
      source: remote_addr
    limit:
      header: x-apikey
      default: 1
      values:
        private-secret: 2
    period:
      header: x-apikey
      default: 30
      values:
        private-secret: 10
  - name: by key
    discriminator:
      source: header
      name: x-apikey
    limit: 1000
    period: 3600
"#;

    #[test]
    fn test_parse_rules() {
        let config = RulesConfig::from_yaml(TIERED).unwrap();

        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].discriminator, DiscriminatorConfig::RemoteAddr);
        assert_eq!(
            config.rules[1].discriminator,
            DiscriminatorConfig::Header {
                name: "x-apikey".to_string()
            }
        );
        assert_eq!(config.rules[1].limit, ValueConfig::Fixed(1000));
        assert!(matches!(config.rules[0].limit, ValueConfig::ByHeader { default: 1, .. }));
    }

    #[test]
    fn test_build_rule_set_preserves_order() {
        let rules = RulesConfig::from_yaml(TIERED).unwrap().into_rule_set().unwrap();

        let names: Vec<_> = rules.iter().map(ThrottleRule::name).collect();
        assert_eq!(names, vec!["by ip", "by key"]);
    }

    #[test]
    fn test_header_lookup_values() {
        let rules = RulesConfig::from_yaml(TIERED).unwrap().into_rule_set().unwrap();
        let rule = rules.get("by ip").unwrap();

        let anonymous = RequestDescriptor::new();
        let keyed = RequestDescriptor::new().with_header("X-APIKey", "private-secret");
        let unknown = RequestDescriptor::new().with_header("X-APIKey", "other");

        assert_eq!(rule.limit().resolve(&anonymous).unwrap(), 1);
        assert_eq!(rule.limit().resolve(&keyed).unwrap(), 2);
        assert_eq!(rule.limit().resolve(&unknown).unwrap(), 1);
        assert_eq!(rule.period().resolve(&anonymous).unwrap(), 30);
        assert_eq!(rule.period().resolve(&keyed).unwrap(), 10);
    }

    #[test]
    fn test_header_discriminator() {
        let rules = RulesConfig::from_yaml(TIERED).unwrap().into_rule_set().unwrap();
        let rule = rules.get("by key").unwrap();

        let keyed = RequestDescriptor::new().with_header("x-apikey", "abc");
        assert_eq!(rule.discriminator().resolve(&keyed).unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let yaml = r#"
rules:
  - name: broken
    discriminator:
      source: remote_addr
    limit:
      header: x-tier
      default: 5
      values:
        free: 0
    period: 60
"#;
        let result = RulesConfig::from_yaml(yaml).unwrap().into_rule_set();
        assert!(matches!(result, Err(FloodgateError::InvalidRule { .. })));

        let yaml = r#"
rules:
  - name: broken
    discriminator:
      source: remote_addr
    limit: 5
    period: 0
"#;
        let result = RulesConfig::from_yaml(yaml).unwrap().into_rule_set();
        assert!(matches!(result, Err(FloodgateError::InvalidRule { .. })));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
rules:
  - name: same
    discriminator:
      source: remote_addr
    limit: 1
    period: 60
  - name: same
    discriminator:
      source: remote_addr
    limit: 2
    period: 60
"#;
        let result = RulesConfig::from_yaml(yaml).unwrap().into_rule_set();
        assert!(matches!(result, Err(FloodgateError::DuplicateRule(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = RulesConfig::from_yaml("rules: [ { name: x } ]");
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }
}
