//! Logical-turn machinery for the Agent Conversation Fabric.
//!
//! A logical turn is one conversational beat: possibly several raw
//! messages that arrived in quick succession and should be answered as
//! one request.  This crate owns the turn state machine, the adaptive
//! accumulation timing, commit-point tracking, and supersede
//! coordination.  It is runtime-free: everything here is synchronous
//! and deterministic, which is what makes the workflow steps in
//! `acf-fabric` replayable.

pub mod accumulate;
pub mod commit;
pub mod supersede;
pub mod turn;

pub use accumulate::{AccumulationHint, MessageShape, TurnManager, UserCadenceStats};
pub use commit::CommitPointTracker;
pub use supersede::{
    build_tool_idempotency_key, SupersedeAction, SupersedeCoordinator, SupersedeDecision,
};
pub use turn::{LogicalTurn, LogicalTurnStatus, PhaseArtifact};
