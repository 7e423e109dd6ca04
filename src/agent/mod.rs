//! The agent execution core: compiled agents, the event-driven turn loop,
//! and the tool set they drive.

pub mod events;
pub mod factory;
pub mod message;
pub mod middleware;
pub mod tools;
pub mod turn;

pub use events::{ContentNode, ToolCallStatus, TurnEvent};
pub use factory::{AgentFactory, AgentKey, CompiledAgent};
pub use message::{AgentState, ThreadMessage, ToolCallRecord};
pub use turn::{TurnDeps, spawn_turn};
