//! The conversation fabric runtime — admission, locking, accumulation,
//! supersession, durable turn orchestration, and event fan-out.
//!
//! The flow: an inbound message enters through the [`gateway`], which
//! admits it, then the [`worker`] drives a [`workflow`] for the
//! session.  The workflow holds the [`mutex`] across its durable steps,
//! accumulates messages into a logical turn, hands the turn to a
//! [`brain::Brain`] behind a rebuilt [`brain::FabricTurnContext`], and
//! commits through the [`audit`] sink.  Lifecycle events fan out via
//! the [`router`].

pub mod audit;
pub mod brain;
pub mod cadence;
pub mod gateway;
pub mod index;
pub mod mailbox;
pub mod mutex;
pub mod ratelimit;
pub mod router;
pub mod worker;
pub mod workflow;

pub use audit::{AuditSink, JsonlAuditSink, MemoryAuditSink, TurnRecord};
pub use brain::{Brain, BrainResult, FabricTurnContext, ResponseSegment};
pub use cadence::UserCadenceTracker;
pub use gateway::{TurnAction, TurnDecision, TurnGateway};
pub use index::{ActiveTurn, ActiveTurnIndex};
pub use mailbox::TurnMailbox;
pub use mutex::{InMemoryLockStore, LockStore, LockToken, SessionMutex};
pub use ratelimit::{AdmissionRateLimiter, RateLimited};
pub use router::{EventListener, EventRouter};
pub use worker::{ConversationFabric, DeliveryOutcome};
pub use workflow::{LogicalTurnWorkflow, WorkflowInput, WorkflowOutput};
