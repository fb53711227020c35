//! Shell command execution utilities for OVS programming.
//!
//! This module provides safe shell command execution with proper quoting
//! to prevent command injection. All switch programming in the agent goes
//! through `ovs-vsctl`/`ovs-ofctl` commands built by component-level
//! command builders and executed here.
//!
//! # Example
//!
//! ```ignore
//! use l2pop_common::shell::{self, OVS_VSCTL_CMD, shellquote};
//!
//! let cmd = format!("{} --timeout=10 get Interface {} ofport",
//!     OVS_VSCTL_CMD, shellquote("gre-0a010001"));
//! let ofport = shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{L2PopError, L2PopResult};

/// Path to the `ovs-vsctl` command for bridge/port configuration.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to the `ovs-ofctl` command for flow programming.
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes any characters that have
/// special meaning inside double quotes.
///
/// # Example
///
/// ```
/// use l2pop_common::shell::shellquote;
///
/// assert_eq!(shellquote("gre-0a010001"), "\"gre-0a010001\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The combined stdout output.
    pub stdout: String,
    /// The combined stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously.
///
/// Runs the command through `/bin/sh -c` to support heredoc-style flow
/// bundles and command chaining.
pub async fn exec(cmd: &str) -> L2PopResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| L2PopError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> L2PopResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(L2PopError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
