use std::fmt;

use serde::{Deserialize, Serialize};

use super::expr::{ExprError, Expression};

/// Ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_severity() -> Severity {
    Severity::Error
}

/// User-defined alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub id: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Expression over the latest sample, e.g.
    /// `threads_connected > 0.8 * max_connections`.
    pub condition: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    /// How long the condition must hold before it fires.
    #[serde(default)]
    pub alert_delay_minutes: u32,
    /// Notify on every firing tick instead of once per episode.
    #[serde(default)]
    pub repetitive_alert: bool,
}

impl AlertCondition {
    pub fn compile(&self) -> Result<Expression, ExprError> {
        Expression::parse(&self.condition)
    }

    pub fn delay_seconds(&self) -> i64 {
        i64::from(self.alert_delay_minutes) * 60
    }

    /// Description, or the expression itself when none was given.
    pub fn label(&self) -> &str {
        if self.description.is_empty() {
            &self.condition
        } else {
            &self.description
        }
    }
}
