//! External interface: checkpoint and plan persistence.
//!
//! Out of scope for this crate to implement (`spec.md` §1 names the
//! backing datastore as an external interface) — this module defines the
//! trait boundary [`crate::orchestrator::Orchestrator`] calls through to
//! durably store and retrieve checkpoints, so it can resume a plan across
//! a process restart without this crate depending on any particular
//! storage engine.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::PlanId;

/// Abstraction over durable checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the integrity-wrapped bytes of a checkpoint for a plan,
    /// overwriting any previous checkpoint for the same plan.
    async fn save(&self, plan_id: PlanId, wrapped_bytes: Vec<u8>) -> Result<()>;

    /// Load the most recent integrity-wrapped checkpoint bytes for a plan,
    /// if one exists.
    async fn load(&self, plan_id: PlanId) -> Result<Option<Vec<u8>>>;
}
