//! Error types for l2pop agent operations.
//!
//! All errors implement `std::error::Error` via `thiserror`.
//!
//! Two of these are part of the dispatch contract rather than runtime
//! conditions: `UnsupportedAction` signals a protocol/version mismatch in an
//! FDB update message, and `UnknownArpCacheKey` signals caller misuse of the
//! ARP cache. Both always propagate. Per-remote-agent conditions (tunnel
//! unavailable, bad address) are handled as skips at the call site and never
//! surface as errors from a batch.

use std::io;
use thiserror::Error;

/// Result type alias for l2pop agent operations.
pub type L2PopResult<T> = Result<T, L2PopError>;

/// Errors that can occur during l2pop agent operations.
#[derive(Debug, Error)]
pub enum L2PopError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// An FDB update message carried an action this agent has no handler for.
    #[error("Unsupported FDB update action '{action}'")]
    UnsupportedAction {
        /// The unrecognized action tag.
        action: String,
    },

    /// Deletion of an ARP cache entry that does not exist.
    #[error("No ARP cache entry for network {network}, ip {ip}")]
    UnknownArpCacheKey {
        /// The network (local VLAN) key.
        network: String,
        /// The IP address.
        ip: String,
    },

    /// A remote agent address could not be used for tunnel naming.
    #[error("Invalid remote agent address: {addr}")]
    InvalidRemoteAddress {
        /// The offending address.
        addr: String,
    },

    /// An FDB message payload could not be decoded.
    #[error("Malformed FDB message: {reason}")]
    MalformedMessage {
        /// What was wrong with the payload.
        reason: String,
    },
}

impl L2PopError {
    /// Creates an unsupported-action error.
    pub fn unsupported_action(action: impl Into<String>) -> Self {
        Self::UnsupportedAction {
            action: action.into(),
        }
    }

    /// Creates an unknown ARP cache key error.
    pub fn unknown_arp_cache_key(network: impl Into<String>, ip: impl Into<String>) -> Self {
        Self::UnknownArpCacheKey {
            network: network.into(),
            ip: ip.into(),
        }
    }

    /// Creates an invalid remote address error.
    pub fn invalid_remote_address(addr: impl Into<String>) -> Self {
        Self::InvalidRemoteAddress { addr: addr.into() }
    }

    /// Creates a malformed-message error.
    pub fn malformed_message(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }
}
