//! Subscription plans and the per-plan quota table.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Subscription tier of a user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Plan {
    Free,
    Starter,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "FREE",
            Plan::Starter => "STARTER",
            Plan::Pro => "PRO",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FREE" => Ok(Plan::Free),
            "STARTER" => Ok(Plan::Starter),
            "PRO" => Ok(Plan::Pro),
            _ => Err(DomainError::unknown("plan", s)),
        }
    }
}

/// Resource type a quota is counted against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Article,
    Note,
    Summary,
    Feed,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Article,
        ResourceType::Note,
        ResourceType::Summary,
        ResourceType::Feed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Article => "article",
            ResourceType::Note => "note",
            ResourceType::Summary => "summary",
            ResourceType::Feed => "feed",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::unknown("resource type", s))
    }
}

/// Quota ceiling for one `(plan, resource)` pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "max")]
pub enum Limit {
    Capped(u64),
    Unlimited,
}

impl Limit {
    /// Whether `current` usage leaves room for one more unit.
    pub fn admits(&self, current: u64) -> bool {
        match self {
            Limit::Capped(max) => current < *max,
            Limit::Unlimited => true,
        }
    }
}

/// Per-plan limit table.
///
/// `Pro` is the unlimited tier. The table is plain data so deployments can
/// override individual cells (see [`PlanLimits::with_limit`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLimits {
    free: [u64; 4],
    starter: [u64; 4],
}

impl Default for PlanLimits {
    fn default() -> Self {
        // Order follows ResourceType::ALL: article, note, summary, feed.
        Self {
            free: [10, 50, 5, 3],
            starter: [100, 1_000, 100, 25],
        }
    }
}

impl PlanLimits {
    pub fn limit(&self, plan: Plan, resource: ResourceType) -> Limit {
        let idx = Self::index(resource);
        match plan {
            Plan::Free => Limit::Capped(self.free[idx]),
            Plan::Starter => Limit::Capped(self.starter[idx]),
            Plan::Pro => Limit::Unlimited,
        }
    }

    /// Override a capped cell. Setting a limit on `Pro` is ignored: it stays unlimited.
    pub fn with_limit(mut self, plan: Plan, resource: ResourceType, max: u64) -> Self {
        let idx = Self::index(resource);
        match plan {
            Plan::Free => self.free[idx] = max,
            Plan::Starter => self.starter[idx] = max,
            Plan::Pro => {}
        }
        self
    }

    fn index(resource: ResourceType) -> usize {
        match resource {
            ResourceType::Article => 0,
            ResourceType::Note => 1,
            ResourceType::Summary => 2,
            ResourceType::Feed => 3,
        }
    }
}
