//! Shared services: concurrency primitives, contract validation, the A2A
//! bus, the incident state machine, and the tool registry.

pub mod bus;
pub mod concurrency;
pub mod contracts;
pub mod state_machine;
pub mod tools;

pub use bus::{AgentBus, AgentHandler, FnHandler};
pub use state_machine::{
    GuardVerdict, IncidentStateMachine, StateMachineConfig, TerminalEvent,
};
pub use tools::{ToolOutput, ToolRegistry, ToolRegistryConfig};
