//! Common infrastructure for the l2pop agent daemon.
//!
//! This crate provides the pieces shared by the agent's components:
//!
//! - [`error`]: the agent-wide error type and result alias
//! - [`config`]: agent identity and bridge configuration
//! - [`shell`]: safe OVS command execution with proper quoting
//!
//! # Architecture
//!
//! The agent programs Open vSwitch through `ovs-vsctl`/`ovs-ofctl` commands
//! built by per-component command builders and executed through [`shell`].
//! All fallible operations return [`L2PopResult`].

pub mod config;
pub mod error;
pub mod shell;

pub use config::AgentConfig;
pub use error::{L2PopError, L2PopResult};
