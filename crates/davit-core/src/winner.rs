//! Winner selection across a tick's check outcomes.

use davit_policy::ScalingAction;
use tracing::trace;

use crate::eval::CheckOutcome;

/// Reduces a tick's check outcomes to the single action the handler acts
/// on, or `None` when there were no outcomes at all.
///
/// Outcomes are grouped by their group key. Within a group, directionless
/// results are ignored unless the whole group is directionless; the
/// survivors reduce pairwise through [`ScalingAction::preempt`]. The group
/// candidates then reduce the same way.
#[must_use]
pub fn select_winner(outcomes: &[CheckOutcome]) -> Option<ScalingAction> {
    let mut groups: Vec<(&str, Vec<&CheckOutcome>)> = Vec::new();
    for outcome in outcomes {
        match groups.iter_mut().find(|(key, _)| *key == outcome.group) {
            Some((_, members)) => members.push(outcome),
            None => groups.push((&outcome.group, vec![outcome])),
        }
    }

    let mut winner: Option<&ScalingAction> = None;
    for (key, members) in &groups {
        let Some(candidate) = group_candidate(members) else {
            continue;
        };
        trace!(
            group = key,
            count = candidate.count,
            direction = %candidate.direction,
            "group candidate"
        );
        winner = Some(match winner {
            Some(current) => ScalingAction::preempt(current, candidate),
            None => candidate,
        });
    }

    winner.cloned()
}

/// Picks one group's candidate: any member when every direction is `none`,
/// otherwise the preempt reduction of the directional members.
fn group_candidate<'a>(members: &[&'a CheckOutcome]) -> Option<&'a ScalingAction> {
    if members.iter().all(|m| m.action.is_no_op()) {
        return members.first().map(|m| &m.action);
    }

    members
        .iter()
        .map(|m| &m.action)
        .filter(|action| !action.is_no_op())
        .reduce(|a, b| ScalingAction::preempt(a, b))
}
