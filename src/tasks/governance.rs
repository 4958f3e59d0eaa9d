//! 审批治理：按权重投票决定需要审批的任务能否激活
//!
//! A = 赞成权重，W = 已投权重，R = 尚未投票的选民权重（开票时登记的 stakeholder 快照）。
//! - `W > 0 && A / W >= threshold` → Approved
//! - 否则若 `W + R == 0` 或 `(A + R) / (W + R) < threshold`（剩余票全投赞成也达不到）→ Rejected
//! - 否则 Pending
//!
//! 每次 resolve 都重新计算，不锁存结果，也不设超时（过期由 TaskManager 的 deadline 处理）。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AgentError;
use crate::tasks::{Task, TaskId};

pub type TicketId = Uuid;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Pending,
}

/// 某张票当前的计票结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Tally {
    pub approve: f64,
    pub cast: f64,
    pub remaining: f64,
}

#[derive(Debug, Clone, Copy)]
struct Vote {
    weight: f64,
    approve: bool,
}

#[derive(Debug)]
struct Ticket {
    task_id: TaskId,
    electorate: HashMap<String, f64>,
    votes: HashMap<String, Vote>,
    opened_at: DateTime<Utc>,
}

impl Ticket {
    fn tally(&self) -> Tally {
        let approve = self
            .votes
            .values()
            .filter(|v| v.approve)
            .map(|v| v.weight)
            .sum();
        let cast = self.votes.values().map(|v| v.weight).sum();
        let remaining = self
            .electorate
            .iter()
            .filter(|(id, _)| !self.votes.contains_key(*id))
            .map(|(_, w)| *w)
            .sum();
        Tally {
            approve,
            cast,
            remaining,
        }
    }
}

/// 纯函数：按计票结果与阈值给出决定
pub fn decide(tally: Tally, threshold: f64) -> ApprovalDecision {
    let Tally {
        approve,
        cast,
        remaining,
    } = tally;
    if cast > 0.0 && approve / cast + EPSILON >= threshold {
        return ApprovalDecision::Approved;
    }
    let reachable = cast + remaining;
    if reachable <= 0.0 || (approve + remaining) / reachable + EPSILON < threshold {
        return ApprovalDecision::Rejected;
    }
    ApprovalDecision::Pending
}

fn check_weight(weight: f64) -> Result<(), AgentError> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(AgentError::Validation(format!(
            "vote weight must be finite and > 0, got {weight}"
        )));
    }
    Ok(())
}

pub struct Governance {
    threshold: f64,
    stakeholders: RwLock<BTreeMap<String, f64>>,
    tickets: Mutex<HashMap<TicketId, Ticket>>,
}

impl Governance {
    /// threshold 限制在 [0, 1]
    pub fn new(threshold: f64) -> Self {
        let threshold = if threshold.is_nan() { 0.5 } else { threshold.clamp(0.0, 1.0) };
        Self {
            threshold,
            stakeholders: RwLock::new(BTreeMap::new()),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 登记或更新 stakeholder 权重；只影响之后开出的票
    pub fn register_stakeholder(&self, id: impl Into<String>, weight: f64) -> Result<(), AgentError> {
        check_weight(weight)?;
        self.stakeholders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), weight);
        Ok(())
    }

    pub fn stakeholders(&self) -> BTreeMap<String, f64> {
        self.stakeholders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_approval(&self, task: &Task) -> TicketId {
        let electorate: HashMap<String, f64> = self.stakeholders().into_iter().collect();
        let id = Uuid::new_v4();
        let electorate_weight: f64 = electorate.values().sum();
        self.tickets().insert(
            id,
            Ticket {
                task_id: task.id.clone(),
                electorate,
                votes: HashMap::new(),
                opened_at: Utc::now(),
            },
        );
        tracing::info!(ticket = %id, task = %task.id, electorate_weight, "approval requested");
        id
    }

    pub fn record_vote(
        &self,
        ticket: TicketId,
        stakeholder: &str,
        weight: f64,
        approve: bool,
    ) -> Result<(), AgentError> {
        check_weight(weight)?;
        let mut tickets = self.tickets();
        let t = tickets
            .get_mut(&ticket)
            .ok_or_else(|| AgentError::NotFound(format!("approval ticket {ticket}")))?;
        if t.votes.contains_key(stakeholder) {
            return Err(AgentError::DuplicateVote(stakeholder.to_string()));
        }
        t.votes.insert(stakeholder.to_string(), Vote { weight, approve });
        tracing::info!(ticket = %ticket, task = %t.task_id, stakeholder, weight, approve, "vote recorded");
        Ok(())
    }

    pub fn tally(&self, ticket: TicketId) -> Result<Tally, AgentError> {
        self.tickets()
            .get(&ticket)
            .map(Ticket::tally)
            .ok_or_else(|| AgentError::NotFound(format!("approval ticket {ticket}")))
    }

    pub fn resolve(&self, ticket: TicketId) -> Result<ApprovalDecision, AgentError> {
        Ok(decide(self.tally(ticket)?, self.threshold))
    }

    /// 任务已终结时关闭其票据
    pub fn withdraw(&self, ticket: TicketId) -> bool {
        match self.tickets().remove(&ticket) {
            Some(t) => {
                let age = Utc::now() - t.opened_at;
                tracing::debug!(ticket = %ticket, task = %t.task_id, age_secs = age.num_seconds(), "approval ticket closed");
                true
            }
            None => false,
        }
    }

    pub fn open_tickets(&self) -> usize {
        self.tickets().len()
    }

    fn tickets(&self) -> std::sync::MutexGuard<'_, HashMap<TicketId, Ticket>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governance(threshold: f64, weights: &[(&str, f64)]) -> Governance {
        let g = Governance::new(threshold);
        for (id, w) in weights {
            g.register_stakeholder(*id, *w).unwrap();
        }
        g
    }

    fn task() -> Task {
        Task::new("send", "send tokens").with_steps(["send"]).with_approval(true)
    }

    #[test]
    fn test_decide_formula() {
        let t = |approve, cast, remaining| Tally { approve, cast, remaining };
        assert_eq!(decide(t(0.0, 0.0, 3.0), 0.6), ApprovalDecision::Pending);
        assert_eq!(decide(t(2.0, 3.0, 0.0), 0.6), ApprovalDecision::Approved);
        assert_eq!(decide(t(1.0, 3.0, 0.0), 0.6), ApprovalDecision::Rejected);
        // 1 赞成 2 反对，剩余 1：最好情况 2/4 < 0.6
        assert_eq!(decide(t(1.0, 3.0, 1.0), 0.6), ApprovalDecision::Rejected);
        // 1 赞成 1 反对，剩余 2：最好情况 3/4 >= 0.6
        assert_eq!(decide(t(1.0, 2.0, 2.0), 0.6), ApprovalDecision::Pending);
        assert_eq!(decide(t(0.0, 0.0, 0.0), 0.6), ApprovalDecision::Rejected);
    }

    #[test]
    fn test_weighted_approval_reaches_threshold() {
        let g = governance(0.6, &[("alice", 3.0), ("bob", 1.0), ("carol", 1.0)]);
        let ticket = g.request_approval(&task());
        assert_eq!(g.resolve(ticket).unwrap(), ApprovalDecision::Pending);

        g.record_vote(ticket, "bob", 1.0, false).unwrap();
        assert_eq!(g.resolve(ticket).unwrap(), ApprovalDecision::Pending);

        g.record_vote(ticket, "alice", 3.0, true).unwrap();
        // 3 / 4 = 0.75 >= 0.6
        assert_eq!(g.resolve(ticket).unwrap(), ApprovalDecision::Approved);
    }

    #[test]
    fn test_rejected_once_threshold_unreachable() {
        let g = governance(0.6, &[("alice", 1.0), ("bob", 1.0), ("carol", 1.0)]);
        let ticket = g.request_approval(&task());
        g.record_vote(ticket, "alice", 1.0, false).unwrap();
        assert_eq!(g.resolve(ticket).unwrap(), ApprovalDecision::Pending);
        g.record_vote(ticket, "bob", 1.0, false).unwrap();
        // 最好情况 1/3 < 0.6
        assert_eq!(g.resolve(ticket).unwrap(), ApprovalDecision::Rejected);
    }

    #[test]
    fn test_vote_errors() {
        let g = governance(0.5, &[("alice", 1.0)]);
        let ticket = g.request_approval(&task());
        assert!(matches!(
            g.record_vote(ticket, "alice", 0.0, true),
            Err(AgentError::Validation(_))
        ));
        assert!(matches!(
            g.record_vote(ticket, "alice", f64::NAN, true),
            Err(AgentError::Validation(_))
        ));
        g.record_vote(ticket, "alice", 1.0, true).unwrap();
        assert!(matches!(
            g.record_vote(ticket, "alice", 1.0, true),
            Err(AgentError::DuplicateVote(_))
        ));
        assert!(matches!(
            g.resolve(Uuid::new_v4()),
            Err(AgentError::NotFound(_))
        ));
    }

    #[test]
    fn test_electorate_is_snapshotted_at_request() {
        let g = governance(0.5, &[("alice", 1.0)]);
        let ticket = g.request_approval(&task());
        g.register_stakeholder("bob", 10.0).unwrap();
        assert_eq!(g.tally(ticket).unwrap().remaining, 1.0);
        assert!(g.withdraw(ticket));
        assert_eq!(g.open_tickets(), 0);
    }

    #[test]
    fn test_threshold_is_clamped() {
        assert_eq!(Governance::new(1.7).threshold(), 1.0);
        assert_eq!(Governance::new(-0.2).threshold(), 0.0);
    }
}
