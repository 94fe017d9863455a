//! HTTP ingress for the Agent Conversation Fabric.
//!
//! Channel connectors post normalized envelopes to `POST /v1/inbound`;
//! the server admits them through the fabric and returns the turn
//! outcome.  Everything conversational lives in `acf-fabric` — this
//! crate is wiring: CLI, config loading, state assembly, and routes.

pub mod api;
pub mod brain;
pub mod cli;
pub mod state;
