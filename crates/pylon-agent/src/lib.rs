//! Agent session engine.
//!
//! Turns the raw streaming agent API into a stable outward event model:
//! - `AgentEvent` - typed tagged-union of upstream stream events
//! - `SessionEvent` - the smaller outward vocabulary dispatched to desks
//! - `Arbitrator` - auto-policy plus pending permission/question requests
//! - `SessionEngine` - per-desk state machine driving it all

pub mod arbitrator;
pub mod backend;
pub mod engine;
pub mod events;

pub use arbitrator::{Arbitrator, AutoDenyRule, PermissionDecision, PolicyConfig, Resolution};
pub use backend::{AgentBackend, AgentReply, AgentRequest, AgentStream, EchoBackend};
pub use engine::{DeskEvent, SessionEngine, SessionError};
pub use events::{AgentEvent, DeskState, SessionEvent, Usage};
