//! Claiming strategies: which claimable task a worker gets next.
//!
//! | Strategy       | Order                                   | Starvation risk            |
//! |----------------|-----------------------------------------|----------------------------|
//! | Fifo           | oldest first                            | low                        |
//! | Lifo           | newest first                            | high for old tasks         |
//! | Priority       | highest priority, then oldest           | high for low priorities    |
//! | WeightedRandom | sampled, weight grows with priority     | low (every weight is >= 1) |
//!
//! A worker picks one strategy at construction and keeps it for its
//! lifetime. Workers with different strategies can share one queue; no
//! global order holds across them.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::domain::TaskId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStrategy {
    #[default]
    Fifo,
    Lifo,
    Priority,
    WeightedRandom,
}

/// The slice of a claimable task a strategy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: TaskId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ClaimStrategy {
    pub const ALL: [ClaimStrategy; 4] = [
        ClaimStrategy::Fifo,
        ClaimStrategy::Lifo,
        ClaimStrategy::Priority,
        ClaimStrategy::WeightedRandom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStrategy::Fifo => "fifo",
            ClaimStrategy::Lifo => "lifo",
            ClaimStrategy::Priority => "priority",
            ClaimStrategy::WeightedRandom => "weighted_random",
        }
    }

    /// `ORDER BY` body for the claim query. Row id breaks timestamp ties so
    /// the order is total. For `WeightedRandom` this only fixes the scan
    /// order of the candidate set.
    pub fn order_clause(self) -> &'static str {
        match self {
            ClaimStrategy::Fifo | ClaimStrategy::WeightedRandom => "created_at ASC, id ASC",
            ClaimStrategy::Lifo => "created_at DESC, id DESC",
            ClaimStrategy::Priority => "priority DESC, created_at ASC, id ASC",
        }
    }

    /// Sampled strategies need the whole candidate set, not just the head.
    pub fn is_sampled(self) -> bool {
        matches!(self, ClaimStrategy::WeightedRandom)
    }

    /// Same order as [`order_clause`](Self::order_clause), for stores
    /// without SQL. `Less` means "claim first".
    pub fn compare(self, a: &Candidate, b: &Candidate) -> Ordering {
        let fifo = a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
        match self {
            ClaimStrategy::Fifo | ClaimStrategy::WeightedRandom => fifo,
            ClaimStrategy::Lifo => fifo.reverse(),
            ClaimStrategy::Priority => b.priority.cmp(&a.priority).then(fifo),
        }
    }

    /// Selection weight under `WeightedRandom`: monotone in priority and
    /// never below 1, so no candidate is ever unreachable.
    pub fn weight(priority: i32) -> f64 {
        f64::from(priority.max(0)) + 1.0
    }

    /// Pick one task out of `candidates`.
    pub fn select<R: Rng + ?Sized>(self, candidates: &[Candidate], rng: &mut R) -> Option<TaskId> {
        if candidates.is_empty() {
            return None;
        }
        if !self.is_sampled() {
            return candidates
                .iter()
                .min_by(|a, b| self.compare(a, b))
                .map(|c| c.id);
        }
        match WeightedIndex::new(candidates.iter().map(|c| Self::weight(c.priority))) {
            Ok(dist) => Some(candidates[dist.sample(rng)].id),
            // unreachable with weights >= 1; fall back to the oldest
            Err(_) => candidates
                .iter()
                .min_by(|a, b| ClaimStrategy::Fifo.compare(a, b))
                .map(|c| c.id),
        }
    }
}

impl fmt::Display for ClaimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown claim strategy {0:?} (expected fifo, lifo, priority or weighted_random)")]
pub struct UnknownStrategy(pub String);

impl FromStr for ClaimStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(ClaimStrategy::Fifo),
            "lifo" => Ok(ClaimStrategy::Lifo),
            "priority" => Ok(ClaimStrategy::Priority),
            "weighted_random" | "weighted" => Ok(ClaimStrategy::WeightedRandom),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}
