//! The scaling policy document and its validation rules.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::check::{CheckErrorMode, PolicyCheck};
use crate::error::{PolicyError, Result};

/// Default evaluation cadence applied when a document omits it.
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(10);

/// Default post-scaling quiescent interval.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Stable, opaque identifier of a scaling policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(String);

impl PolicyId {
    /// Creates a new policy ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PolicyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The kind of workload a policy drives.
///
/// The vertical variants are reserved wire values; documents carrying them
/// parse but fail validation until vertical scaling lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyType {
    /// Scale the task count of a job group.
    #[default]
    Horizontal,
    /// Scale the node count of a cluster pool.
    Cluster,
    /// Reserved.
    VerticalMem,
    /// Reserved.
    VerticalCpu,
}

impl PolicyType {
    /// Whether the core control loop can evaluate this policy type.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Horizontal | Self::Cluster)
    }
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Horizontal => "horizontal",
            Self::Cluster => "cluster",
            Self::VerticalMem => "vertical-mem",
            Self::VerticalCpu => "vertical-cpu",
        };
        write!(f, "{s}")
    }
}

/// The target workload a policy scales: an adapter name plus its opaque
/// configuration (job/group coordinates, node class, drain settings, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetSpec {
    /// Name of the target adapter plugin.
    pub name: String,
    /// Adapter-specific configuration.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl TargetSpec {
    /// Creates a target spec for the named adapter.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HashMap::new(),
        }
    }

    /// Adds a config entry, builder style.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// A complete scaling policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Stable identifier, assigned by the source when the document itself
    /// does not carry one.
    #[serde(default)]
    pub id: PolicyId,
    /// Kind of workload being scaled.
    #[serde(rename = "type", default)]
    pub policy_type: PolicyType,
    /// Never scale below this count.
    pub min: i64,
    /// Never scale above this count.
    pub max: i64,
    /// Disabled policies are skipped by sources entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Quiescent interval after a scale-down or directionless action.
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
    /// Quiescent interval after a scale-up; inherits `cooldown` when unset.
    #[serde(with = "humantime_serde::option", default)]
    pub cooldown_on_scale_up: Option<Duration>,
    /// How often the handler evaluates this policy.
    #[serde(with = "humantime_serde", default = "default_evaluation_interval")]
    pub evaluation_interval: Duration,
    /// Error mode for checks that do not set their own.
    #[serde(default)]
    pub on_check_error: CheckErrorMode,
    /// Relative weight under contention; not consumed by the core loop.
    #[serde(default)]
    pub priority: i32,
    /// The workload this policy drives.
    pub target: TargetSpec,
    /// The measurements that produce candidate actions.
    #[serde(default)]
    pub checks: Vec<PolicyCheck>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> Duration {
    DEFAULT_COOLDOWN
}

fn default_evaluation_interval() -> Duration {
    DEFAULT_EVALUATION_INTERVAL
}

impl ScalingPolicy {
    /// Resolved scale-up cooldown: the dedicated value when present,
    /// otherwise the general cooldown.
    #[must_use]
    pub fn scale_up_cooldown(&self) -> Duration {
        self.cooldown_on_scale_up.unwrap_or(self.cooldown)
    }

    /// Validates the document, collecting every violation found.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] listing all violated rules.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();

        if !self.policy_type.is_supported() {
            violations.push(format!("unsupported policy type {}", self.policy_type));
        }
        if self.min < 0 {
            violations.push(format!("min ({}) must be >= 0", self.min));
        }
        if self.max < 0 {
            violations.push(format!("max ({}) must be >= 0", self.max));
        }
        if self.min > self.max {
            violations.push(format!(
                "min ({}) cannot exceed max ({})",
                self.min, self.max
            ));
        }
        if self.evaluation_interval.is_zero() {
            violations.push("evaluation_interval must be positive".to_string());
        }
        if self.target.name.is_empty() {
            violations.push("target name is required".to_string());
        }
        if self.checks.is_empty() {
            violations.push("at least one check is required".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for check in &self.checks {
            if !seen.insert(check.name.as_str()) {
                violations.push(format!("duplicate check name {:?}", check.name));
            }
            check.collect_violations(&mut violations);
        }

        PolicyError::from_violations(violations)
    }

    /// Fills in derived fields so downstream consumers never see an
    /// unresolved document: the scale-up cooldown inherits the general
    /// cooldown when unset.
    pub fn canonicalize(&mut self) {
        if self.cooldown_on_scale_up.is_none() {
            self.cooldown_on_scale_up = Some(self.cooldown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{PolicyCheck, StrategySpec};

    fn base_policy() -> ScalingPolicy {
        ScalingPolicy {
            id: PolicyId::new("web-app"),
            policy_type: PolicyType::Horizontal,
            min: 1,
            max: 10,
            enabled: true,
            cooldown: Duration::from_secs(120),
            cooldown_on_scale_up: None,
            evaluation_interval: Duration::from_secs(10),
            on_check_error: CheckErrorMode::Ignore,
            priority: 0,
            target: TargetSpec::new("nomad-target")
                .with_config("Job", "web")
                .with_config("Group", "app"),
            checks: vec![PolicyCheck {
                name: "avg-cpu".into(),
                group: String::new(),
                source: "prometheus".into(),
                query: "avg(cpu_percent)".into(),
                query_window: Duration::from_secs(60),
                query_window_offset: Duration::ZERO,
                on_error: None,
                strategy: StrategySpec::new("target-value"),
            }],
        }
    }

    #[test]
    fn valid_policy_passes() {
        assert!(base_policy().validate().is_ok());
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut policy = base_policy();
        policy.min = 20;
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("cannot exceed max"));
    }

    #[test]
    fn negative_bounds_are_rejected() {
        let mut policy = base_policy();
        policy.min = -1;
        policy.max = -1;
        let err = policy.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("min (-1)"));
        assert!(msg.contains("max (-1)"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut policy = base_policy();
        policy.evaluation_interval = Duration::ZERO;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn missing_checks_are_rejected() {
        let mut policy = base_policy();
        policy.checks.clear();
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("at least one check"));
    }

    #[test]
    fn duplicate_check_names_are_rejected() {
        let mut policy = base_policy();
        let dup = policy.checks[0].clone();
        policy.checks.push(dup);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate check name"));
    }

    #[test]
    fn vertical_types_parse_but_fail_validation() {
        let mut policy = base_policy();
        policy.policy_type = PolicyType::VerticalMem;
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported policy type"));
    }

    #[test]
    fn violations_aggregate() {
        let mut policy = base_policy();
        policy.min = 5;
        policy.max = 2;
        policy.checks.clear();
        policy.evaluation_interval = Duration::ZERO;
        match policy.validate() {
            Err(PolicyError::Invalid { violations }) => assert_eq!(violations.len(), 3),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn scale_up_cooldown_inherits() {
        let mut policy = base_policy();
        assert_eq!(policy.scale_up_cooldown(), Duration::from_secs(120));

        policy.cooldown_on_scale_up = Some(Duration::from_secs(30));
        assert_eq!(policy.scale_up_cooldown(), Duration::from_secs(30));
    }

    #[test]
    fn canonicalize_resolves_scale_up_cooldown() {
        let mut policy = base_policy();
        policy.canonicalize();
        assert_eq!(policy.cooldown_on_scale_up, Some(Duration::from_secs(120)));
    }

    #[test]
    fn document_parses_from_toml() {
        let doc = r#"
            id = "batch-workers"
            type = "horizontal"
            min = 2
            max = 50
            cooldown = "2m"
            cooldown_on_scale_up = "30s"
            evaluation_interval = "10s"
            on_check_error = "fail"

            [target]
            name = "nomad-target"
            config = { Job = "batch", Group = "workers" }

            [[checks]]
            name = "queue-depth"
            source = "prometheus"
            query = "sum(queue_depth)"
            query_window = "1m"

            [checks.strategy]
            name = "pass-through"
        "#;
        let policy: ScalingPolicy = toml::from_str(doc).unwrap();
        assert_eq!(policy.id.as_str(), "batch-workers");
        assert_eq!(policy.cooldown, Duration::from_secs(120));
        assert_eq!(policy.cooldown_on_scale_up, Some(Duration::from_secs(30)));
        assert_eq!(policy.on_check_error, CheckErrorMode::Fail);
        assert_eq!(policy.checks.len(), 1);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn policy_serialization_roundtrip() {
        let policy = base_policy();
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: ScalingPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
