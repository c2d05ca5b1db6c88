//! Coding-agent driver implementations.

pub mod http_driver;
pub mod scripted;

pub use http_driver::HttpAgentDriver;
pub use scripted::{ScriptedAgentDriver, ScriptedTurn};
