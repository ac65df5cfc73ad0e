// src/sys/validate.rs

use std::collections::HashMap;

use regex::Regex;

use crate::config::ValidationConfig;
use crate::error::AgentError;

/// Entity kinds with a configured constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Username,
    Password,
    Groupname,
    Sitename,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Username => "username",
            RuleKind::Password => "password",
            RuleKind::Groupname => "groupname",
            RuleKind::Sitename => "sitename",
        }
    }
}

struct CompiledRule {
    pattern: Regex,
    message: String,
}

/// The compiled per-kind constraints declared in configuration. Pure: a
/// function of configuration and input only, no side effects.
pub struct ValidationRules {
    rules: HashMap<RuleKind, CompiledRule>,
}

/// Inputs longer than this are rejected before any pattern runs.
const MAX_INPUT_LEN: usize = 256;

impl ValidationRules {
    /// Compiles the configured patterns. Configuration::load has already
    /// verified they compile, so a failure here is an internal error.
    pub fn compile(config: &ValidationConfig) -> Result<Self, AgentError> {
        let mut rules = HashMap::new();
        for (kind, spec) in [
            (RuleKind::Username, &config.username),
            (RuleKind::Password, &config.password),
            (RuleKind::Groupname, &config.groupname),
            (RuleKind::Sitename, &config.sitename),
        ] {
            let pattern = Regex::new(&spec.pattern).map_err(|e| {
                AgentError::Internal(format!("{} pattern does not compile: {}", kind.as_str(), e))
            })?;
            rules.insert(kind, CompiledRule { pattern, message: spec.message.clone() });
        }
        Ok(Self { rules })
    }

    /// Applies the rule for `kind`. On mismatch the configured message is
    /// returned verbatim, never a synthesized one.
    pub fn validate(&self, kind: RuleKind, value: &str) -> Result<(), AgentError> {
        let rule = self
            .rules
            .get(&kind)
            .ok_or_else(|| AgentError::Internal(format!("no rule for kind {}", kind.as_str())))?;

        // Bounded-length pre-checks run before the pattern.
        if value.is_empty() || value.chars().count() > MAX_INPUT_LEN {
            return Err(AgentError::Validation(rule.message.clone()));
        }
        if !rule.pattern.is_match(value) {
            return Err(AgentError::Validation(rule.message.clone()));
        }
        Ok(())
    }
}
