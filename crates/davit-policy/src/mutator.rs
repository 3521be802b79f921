//! Static pre-evaluation fixups of policy documents.
//!
//! Mutators run once whenever the manager receives a policy, before the
//! handler ever sees it. They patch documents that are valid but would
//! misbehave at evaluation time.

use tracing::warn;

use crate::policy::{PolicyType, ScalingPolicy};

/// Metric sources that query workload allocations and therefore cannot
/// observe a pool that has been scaled to zero.
const ALLOCATION_BACKED_SOURCES: &[&str] = &["nomad-apm"];

/// A single change a mutator made to a policy, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// The mutator that made the change.
    pub mutator: &'static str,
    /// Which field changed and why.
    pub note: String,
}

/// A static fixup applied to every incoming policy document.
pub trait PolicyMutator: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Patches `policy` in place, returning one entry per change made.
    fn mutate(&self, policy: &mut ScalingPolicy) -> Vec<Mutation>;
}

/// Runs every mutator over `policy`, logging each change.
pub fn apply_mutators(mutators: &[Box<dyn PolicyMutator>], policy: &mut ScalingPolicy) {
    for mutator in mutators {
        for mutation in mutator.mutate(policy) {
            warn!(
                policy = %policy.id,
                mutator = mutation.mutator,
                note = %mutation.note,
                "mutated incoming policy"
            );
        }
    }
}

/// Raises `min` to 1 on cluster policies whose checks query an
/// allocation-backed metric source. Such a source returns nothing for an
/// empty pool, so a policy allowed to reach zero nodes could never scale
/// back up.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroCountGuard;

impl PolicyMutator for ZeroCountGuard {
    fn name(&self) -> &'static str {
        "zero-count-guard"
    }

    fn mutate(&self, policy: &mut ScalingPolicy) -> Vec<Mutation> {
        if policy.policy_type != PolicyType::Cluster || policy.min > 0 {
            return Vec::new();
        }

        let affected = policy
            .checks
            .iter()
            .any(|c| ALLOCATION_BACKED_SOURCES.contains(&c.source.as_str()));
        if !affected {
            return Vec::new();
        }

        policy.min = 1;
        vec![Mutation {
            mutator: self.name(),
            note: "min raised from 0 to 1: an allocation-backed metric source cannot query an empty pool".to_string(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{PolicyCheck, StrategySpec};
    use crate::policy::{PolicyId, TargetSpec};
    use std::time::Duration;

    fn cluster_policy(min: i64, source: &str) -> ScalingPolicy {
        ScalingPolicy {
            id: PolicyId::new("asg-pool"),
            policy_type: PolicyType::Cluster,
            min,
            max: 10,
            enabled: true,
            cooldown: Duration::from_secs(60),
            cooldown_on_scale_up: None,
            evaluation_interval: Duration::from_secs(10),
            on_check_error: Default::default(),
            priority: 0,
            target: TargetSpec::new("aws-asg"),
            checks: vec![PolicyCheck {
                name: "load".into(),
                group: String::new(),
                source: source.into(),
                query: "allocated_cpu".into(),
                query_window: Duration::from_secs(60),
                query_window_offset: Duration::ZERO,
                on_error: None,
                strategy: StrategySpec::new("target-value"),
            }],
        }
    }

    #[test]
    fn zero_min_cluster_policy_is_raised() {
        let mut policy = cluster_policy(0, "nomad-apm");
        let mutations = ZeroCountGuard.mutate(&mut policy);
        assert_eq!(policy.min, 1);
        assert_eq!(mutations.len(), 1);
        assert!(mutations[0].note.contains("min raised"));
    }

    #[test]
    fn horizontal_policy_is_untouched() {
        let mut policy = cluster_policy(0, "nomad-apm");
        policy.policy_type = PolicyType::Horizontal;
        let mutations = ZeroCountGuard.mutate(&mut policy);
        assert_eq!(policy.min, 0);
        assert!(mutations.is_empty());
    }

    #[test]
    fn nonzero_min_is_untouched() {
        let mut policy = cluster_policy(1, "nomad-apm");
        let mutations = ZeroCountGuard.mutate(&mut policy);
        assert_eq!(policy.min, 1);
        assert!(mutations.is_empty());
    }

    #[test]
    fn other_sources_are_untouched() {
        let mut policy = cluster_policy(0, "prometheus");
        let mutations = ZeroCountGuard.mutate(&mut policy);
        assert_eq!(policy.min, 0);
        assert!(mutations.is_empty());
    }

    #[test]
    fn apply_mutators_runs_all() {
        let mutators: Vec<Box<dyn PolicyMutator>> = vec![Box::new(ZeroCountGuard)];
        let mut policy = cluster_policy(0, "nomad-apm");
        apply_mutators(&mutators, &mut policy);
        assert_eq!(policy.min, 1);
    }
}
