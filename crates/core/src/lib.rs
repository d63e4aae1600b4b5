//! `scribe-core`: shared domain primitives for the job pipeline.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the plan/quota table, and the domain error.

pub mod error;
pub mod id;
pub mod plan;

pub use error::{DomainError, DomainResult};
pub use id::{ArticleId, ResultId, UserId};
pub use plan::{Limit, Plan, PlanLimits, ResourceType};
