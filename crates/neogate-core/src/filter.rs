//! Device allow/deny policy.
//!
//! Rules are keyed by connector name, with `"*"` applying to every connector. Patterns
//! are full-match regular expressions on the device name. A deny match always rejects.
//! When allow rules exist for a connector, devices matching none of them are rejected;
//! otherwise every device is permitted.

use std::collections::HashMap;

use regex::Regex;

use crate::config::DeviceFilterConfig;
use crate::error::Result;

const ANY_CONNECTOR: &str = "*";

#[derive(Debug, Clone, Default)]
struct RuleSet {
    rules: HashMap<String, Vec<Regex>>,
}

impl RuleSet {
    fn compile(source: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut rules = HashMap::with_capacity(source.len());
        for (connector, patterns) in source {
            let compiled = patterns
                .iter()
                .map(|p| Regex::new(&format!("^(?:{})$", p)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rules.insert(connector.clone(), compiled);
        }
        Ok(Self { rules })
    }

    fn patterns_for<'a>(&'a self, connector: &str) -> impl Iterator<Item = &'a Regex> + 'a {
        let specific = self.rules.get(connector).into_iter().flatten();
        let any = self.rules.get(ANY_CONNECTOR).into_iter().flatten();
        specific.chain(any)
    }

    fn has_rules_for(&self, connector: &str) -> bool {
        self.patterns_for(connector).next().is_some()
    }

    fn matches(&self, connector: &str, device: &str) -> bool {
        self.patterns_for(connector).any(|re| re.is_match(device))
    }
}

/// Compiled device policy.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    enabled: bool,
    allow: RuleSet,
    deny: RuleSet,
}

impl DeviceFilter {
    pub fn from_config(config: &DeviceFilterConfig) -> Result<Self> {
        Ok(Self {
            enabled: config.enabled,
            allow: RuleSet::compile(&config.allow)?,
            deny: RuleSet::compile(&config.deny)?,
        })
    }

    /// A filter that permits everything.
    pub fn permit_all() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `device` coming from `connector` may be ingested.
    pub fn is_allowed(&self, connector: &str, device: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.deny.matches(connector, device) {
            return false;
        }
        if self.allow.has_rules_for(connector) {
            return self.allow.matches(connector, device);
        }
        true
    }
}
