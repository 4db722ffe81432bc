//! Agent runtime for a desktop coding assistant.
//!
//! An `Agent` drives a tool-calling loop against a streaming model provider,
//! offering built-in tools plus tools discovered from MCP servers, with user
//! approval and rate limiting in front of every call.

pub mod client;
pub mod config;
pub mod core;
pub mod error_hints;
pub mod llm_client;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod pricing;
pub mod profile;
pub mod sse;
pub mod tools;

pub use crate::config::Config;
pub use crate::core::{Agent, RunOutcome, StopReason};
pub use crate::profile::AgentProfile;
