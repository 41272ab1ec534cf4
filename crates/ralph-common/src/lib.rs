//! Shared domain types for the Ralph orchestration engine.
//!
//! These types are owned by no single subsystem: the PRD store reads and
//! writes them, the orchestration engine mutates them in memory between
//! store round-trips, and the event fabric serializes them onto an
//! outbound stream. Keeping them in their own crate (mirroring the
//! runtime/domain split the rest of the workspace uses) means a future
//! daemon crate can depend on the shapes without pulling in the engine.

pub mod error;
pub mod event;
pub mod prd;
pub mod swarm;

pub use error::RalphError;
pub use event::{Event, EventKind};
pub use prd::{
    LastRun, LastRunReason, Metrics, Prd, PrdStatus, Story, StoryStatus, STORY_PREFIX_FIX,
    STORY_PREFIX_USER,
};
pub use swarm::{RunEntry, RunStatus, SwarmState};
