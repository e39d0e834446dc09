//! Scheduling policies
//!
//! A policy is a pure function from the ready set plus a [`SystemSnapshot`] to
//! a dispatch ordering. Policies hold no state between ticks and must return
//! the same ordering for the same inputs; every comparison ends on the
//! submission sequence number so no two candidates ever compare equal.

use crate::ledger::LedgerSnapshot;
use crate::models::{Flow, FlowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Ready flow as seen by a policy
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCandidate {
    pub flow_id: FlowId,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub seq: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub resource_requirements: u32,
    pub agent_class: String,
}

impl ScheduleCandidate {
    pub fn from_flow(flow: &Flow) -> Self {
        Self {
            flow_id: flow.id,
            priority: flow.priority,
            submitted_at: flow.submitted_at,
            seq: flow.seq,
            deadline: flow.deadline,
            resource_requirements: flow.resource_requirements,
            agent_class: flow.agent_class(),
        }
    }
}

/// Consistent system view taken once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub now: DateTime<Utc>,
    pub ledger: LedgerSnapshot,
    pub dispatched: usize,
    pub max_concurrent: usize,
}

/// One ranked position in a dispatch ordering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub flow_id: FlowId,
    pub rank: usize,
    /// Policy-specific score; only Deadline-Aware produces a meaningful value
    pub score: f64,
}

/// Strategy interface: order the ready set for dispatch
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self, ready: &[ScheduleCandidate], system: &SystemSnapshot) -> Vec<ScheduleEntry>;
}

/// Policy selector used in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Fifo,
    #[default]
    Priority,
    ResourceAware,
    LoadBalanced,
    DeadlineAware,
}

impl PolicyKind {
    pub fn build(self) -> Arc<dyn SchedulingPolicy> {
        match self {
            PolicyKind::Fifo => Arc::new(FifoPolicy),
            PolicyKind::Priority => Arc::new(PriorityPolicy),
            PolicyKind::ResourceAware => Arc::new(ResourceAwarePolicy),
            PolicyKind::LoadBalanced => Arc::new(LoadBalancedPolicy),
            PolicyKind::DeadlineAware => Arc::new(DeadlineAwarePolicy),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Fifo => "fifo",
            PolicyKind::Priority => "priority",
            PolicyKind::ResourceAware => "resource_aware",
            PolicyKind::LoadBalanced => "load_balanced",
            PolicyKind::DeadlineAware => "deadline_aware",
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(PolicyKind::Fifo),
            "priority" => Ok(PolicyKind::Priority),
            "resource_aware" => Ok(PolicyKind::ResourceAware),
            "load_balanced" => Ok(PolicyKind::LoadBalanced),
            "deadline_aware" => Ok(PolicyKind::DeadlineAware),
            other => Err(format!("unknown scheduling policy '{other}'")),
        }
    }
}

fn by_submission(a: &ScheduleCandidate, b: &ScheduleCandidate) -> Ordering {
    a.submitted_at
        .cmp(&b.submitted_at)
        .then_with(|| a.seq.cmp(&b.seq))
}

fn by_priority(a: &ScheduleCandidate, b: &ScheduleCandidate) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| by_submission(a, b))
}

fn ranked<'a>(order: impl IntoIterator<Item = (&'a ScheduleCandidate, f64)>) -> Vec<ScheduleEntry> {
    order
        .into_iter()
        .enumerate()
        .map(|(rank, (candidate, score))| ScheduleEntry {
            flow_id: candidate.flow_id,
            rank,
            score,
        })
        .collect()
}

fn sorted_by(
    ready: &[ScheduleCandidate],
    cmp: impl Fn(&ScheduleCandidate, &ScheduleCandidate) -> Ordering,
) -> Vec<ScheduleEntry> {
    let mut order: Vec<&ScheduleCandidate> = ready.iter().collect();
    order.sort_by(|a, b| cmp(a, b));
    ranked(order.into_iter().map(|c| (c, 0.0)))
}

/// Submission order
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn order(&self, ready: &[ScheduleCandidate], _system: &SystemSnapshot) -> Vec<ScheduleEntry> {
        sorted_by(ready, by_submission)
    }
}

/// Lower priority number first, then submission order
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityPolicy;

impl SchedulingPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn order(&self, ready: &[ScheduleCandidate], _system: &SystemSnapshot) -> Vec<ScheduleEntry> {
        sorted_by(ready, by_priority)
    }
}

/// Best fit against free ledger capacity.
///
/// Flows that fit right now come first, tightest fit (smallest leftover)
/// first. Flows that do not fit follow in priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceAwarePolicy;

impl SchedulingPolicy for ResourceAwarePolicy {
    fn name(&self) -> &'static str {
        "resource_aware"
    }

    fn order(&self, ready: &[ScheduleCandidate], system: &SystemSnapshot) -> Vec<ScheduleEntry> {
        let free = system.ledger.free();
        let leftover = |c: &ScheduleCandidate| free.checked_sub(c.resource_requirements);
        sorted_by(ready, |a, b| match (leftover(a), leftover(b)) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| by_priority(a, b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => by_priority(a, b),
        })
    }
}

/// Round-robin across agent classes, priority order inside each class
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBalancedPolicy;

impl SchedulingPolicy for LoadBalancedPolicy {
    fn name(&self) -> &'static str {
        "load_balanced"
    }

    fn order(&self, ready: &[ScheduleCandidate], _system: &SystemSnapshot) -> Vec<ScheduleEntry> {
        let mut buckets: BTreeMap<&str, Vec<&ScheduleCandidate>> = BTreeMap::new();
        for candidate in ready {
            buckets
                .entry(candidate.agent_class.as_str())
                .or_default()
                .push(candidate);
        }

        let mut queues: Vec<VecDeque<&ScheduleCandidate>> = buckets
            .into_values()
            .map(|mut bucket| {
                bucket.sort_by(|a, b| by_priority(a, b));
                VecDeque::from(bucket)
            })
            .collect();
        // The bucket holding the most urgent flow leads each round
        queues.sort_by(|a, b| match (a.front(), b.front()) {
            (Some(x), Some(y)) => by_priority(x, y),
            _ => Ordering::Equal,
        });

        let mut order = Vec::with_capacity(ready.len());
        while order.len() < ready.len() {
            for queue in queues.iter_mut() {
                if let Some(candidate) = queue.pop_front() {
                    order.push(candidate);
                }
            }
        }
        ranked(order.into_iter().map(|c| (c, 0.0)))
    }
}

/// Urgency score `priority_weight / max(1, seconds_to_deadline)`.
///
/// The weight maps priority 0 to 100 and decays as the priority number grows.
/// Overdue flows count as one second away. Flows without a deadline follow
/// every deadline-bearing flow, in priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineAwarePolicy;

impl DeadlineAwarePolicy {
    pub fn priority_weight(priority: i32) -> f64 {
        100.0 / (1.0 + f64::from(priority.max(0)))
    }

    pub fn urgency(candidate: &ScheduleCandidate, now: DateTime<Utc>) -> Option<f64> {
        let deadline = candidate.deadline?;
        let seconds_left = deadline.signed_duration_since(now).num_milliseconds() as f64 / 1000.0;
        Some(Self::priority_weight(candidate.priority) / seconds_left.max(1.0))
    }
}

impl SchedulingPolicy for DeadlineAwarePolicy {
    fn name(&self) -> &'static str {
        "deadline_aware"
    }

    fn order(&self, ready: &[ScheduleCandidate], system: &SystemSnapshot) -> Vec<ScheduleEntry> {
        let mut scored: Vec<(&ScheduleCandidate, Option<f64>)> = ready
            .iter()
            .map(|c| (c, Self::urgency(c, system.now)))
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| match (sa, sb) {
            (Some(x), Some(y)) => y.total_cmp(x).then_with(|| by_priority(a, b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => by_priority(a, b),
        });
        ranked(
            scored
                .into_iter()
                .map(|(c, score)| (c, score.unwrap_or(0.0))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AgentSnapshot;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use uuid::Uuid;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn candidate(seq: u64, priority: i32) -> ScheduleCandidate {
        ScheduleCandidate {
            flow_id: Uuid::from_u128(seq as u128 + 1),
            priority,
            submitted_at: epoch() + ChronoDuration::seconds(seq as i64),
            seq,
            deadline: None,
            resource_requirements: 1,
            agent_class: "default".into(),
        }
    }

    fn system(total: u32, reserved: u32) -> SystemSnapshot {
        SystemSnapshot {
            now: epoch() + ChronoDuration::seconds(100),
            ledger: LedgerSnapshot {
                total_capacity: total,
                reserved,
                agents: vec![AgentSnapshot {
                    id: "a1".into(),
                    capabilities: Default::default(),
                    capacity: total,
                    current_load: 0,
                }],
            },
            dispatched: 0,
            max_concurrent: 4,
        }
    }

    fn ids(entries: &[ScheduleEntry]) -> Vec<u64> {
        entries
            .iter()
            .map(|e| e.flow_id.as_u128() as u64 - 1)
            .collect()
    }

    #[test]
    fn test_fifo() {
        let ready = vec![candidate(2, 1), candidate(0, 9), candidate(1, 5)];
        assert_eq!(ids(&FifoPolicy.order(&ready, &system(4, 0))), vec![0, 1, 2]);
    }

    #[test]
    fn test_priority_ties_by_submission() {
        let ready = vec![candidate(0, 5), candidate(1, 1), candidate(2, 7), candidate(3, 1)];
        let order = PriorityPolicy.order(&ready, &system(4, 0));
        assert_eq!(ids(&order), vec![1, 3, 0, 2]);
        assert_eq!(order.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_identical_timestamps_break_on_seq() {
        let mut a = candidate(1, 5);
        let mut b = candidate(0, 5);
        a.submitted_at = epoch();
        b.submitted_at = epoch();
        assert_eq!(ids(&PriorityPolicy.order(&[a, b], &system(4, 0))), vec![0, 1]);
    }

    #[test]
    fn test_resource_aware_best_fit() {
        let mut big = candidate(0, 1);
        big.resource_requirements = 5;
        let mut exact = candidate(1, 9);
        exact.resource_requirements = 3;
        let mut small = candidate(2, 5);
        small.resource_requirements = 1;

        // 3 units free: exact fit first, then the loose fit, then what does not fit
        let order = ResourceAwarePolicy.order(&[big, exact, small], &system(4, 1));
        assert_eq!(ids(&order), vec![1, 2, 0]);
    }

    #[test]
    fn test_load_balanced_round_robin() {
        let mut ready = Vec::new();
        for (seq, class, priority) in [
            (0, "gpu", 3),
            (1, "gpu", 1),
            (2, "gpu", 2),
            (3, "cpu", 4),
            (4, "cpu", 5),
            (5, "io", 9),
        ] {
            let mut c = candidate(seq, priority);
            c.agent_class = class.into();
            ready.push(c);
        }
        let order = LoadBalancedPolicy.order(&ready, &system(4, 0));
        // gpu leads (priority 1), then cpu (4), then io (9)
        assert_eq!(ids(&order), vec![1, 3, 5, 2, 4, 0]);
    }

    #[test]
    fn test_deadline_boosts_urgent_flow() {
        let now = system(4, 0).now;
        let relaxed = candidate(0, 1);
        let mut urgent = candidate(1, 8);
        urgent.deadline = Some(now + ChronoDuration::seconds(2));
        let mut later = candidate(2, 1);
        later.deadline = Some(now + ChronoDuration::hours(10));

        let order = DeadlineAwarePolicy.order(&[relaxed, urgent, later], &system(4, 0));
        assert_eq!(ids(&order), vec![1, 2, 0]);
        assert!(order[0].score > order[1].score);
        assert_eq!(order[2].score, 0.0);
    }

    #[test]
    fn test_overdue_flow_counts_as_one_second() {
        let now = system(4, 0).now;
        let mut overdue = candidate(0, 0);
        overdue.deadline = Some(now - ChronoDuration::seconds(30));
        assert_eq!(DeadlineAwarePolicy::urgency(&overdue, now), Some(100.0));
    }

    #[test]
    fn test_policies_are_deterministic() {
        let mut ready: Vec<_> = (0..20).map(|i| candidate(i, (i % 4) as i32)).collect();
        for (i, c) in ready.iter_mut().enumerate() {
            c.agent_class = format!("class-{}", i % 3);
            c.resource_requirements = (i % 5) as u32 + 1;
            if i % 2 == 0 {
                c.deadline = Some(epoch() + ChronoDuration::seconds(100 + i as i64 * 7));
            }
        }
        let snapshot = system(6, 2);
        for kind in [
            PolicyKind::Fifo,
            PolicyKind::Priority,
            PolicyKind::ResourceAware,
            PolicyKind::LoadBalanced,
            PolicyKind::DeadlineAware,
        ] {
            let policy = kind.build();
            let first = policy.order(&ready, &snapshot);
            let second = policy.order(&ready, &snapshot);
            assert_eq!(first, second, "{kind} is not deterministic");
            assert_eq!(first.len(), ready.len());
        }
    }

    #[test]
    fn test_policy_kind_parse() {
        assert_eq!("deadline-aware".parse::<PolicyKind>(), Ok(PolicyKind::DeadlineAware));
        assert_eq!("FIFO".parse::<PolicyKind>(), Ok(PolicyKind::Fifo));
        assert!("random".parse::<PolicyKind>().is_err());
        assert_eq!(PolicyKind::default().build().name(), "priority");
    }
}
