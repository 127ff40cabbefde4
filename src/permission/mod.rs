//! Permission plumbing between the agent subprocess and Slack.
//!
//! The agent's permission prompts arrive through an out-of-process MCP tool
//! that talks to this service over a pair of named pipes in a per-run
//! runtime workspace ([`channel`]). Saved approvals live in the task's
//! claude config document and are matched by a small rule interpreter
//! ([`rules`]).

pub mod channel;
pub mod rules;

pub use channel::{PermissionBehavior, PermissionChannel, PermissionRequest, PermissionResponse};
