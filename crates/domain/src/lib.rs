//! Shared leaf types for the Agent Conversation Fabric.
//!
//! Everything here is plain data: the error taxonomy, the configuration
//! tree, session keys, raw messages, lifecycle events, and side-effect
//! records.  Higher crates (`acf-turn`, `acf-fabric`) build the runtime
//! behavior on top of these types.

pub mod config;
pub mod effect;
pub mod error;
pub mod event;
pub mod message;
pub mod session;

pub use effect::{SideEffect, SideEffectPolicy};
pub use error::{Error, Result};
pub use event::{FabricEvent, FabricEventType};
pub use message::RawMessage;
pub use session::SessionKey;
