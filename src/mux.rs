//! Minimal tmux command layer.
//!
//! The gateway drives an external tmux server over a dedicated socket. Only
//! the small dialect the session and PTY layers need is issued here:
//! list, existence check, detached create, kill, and the attach command the
//! PTY layer spawns inside a pseudo-terminal. No control-mode protocol is
//! used anywhere.

use std::path::{Path, PathBuf};

use portable_pty::CommandBuilder;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("tmux rejected command: {0}")]
    Command(String),

    #[error("invalid session name: {0}")]
    InvalidName(String),
}

pub type MuxResult<T> = Result<T, MuxError>;

/// Handle to the tmux server behind a socket path.
#[derive(Debug, Clone)]
pub struct MuxClient {
    socket: PathBuf,
}

/// Session names reach a command line, so they are restricted to the shape
/// the registry mints: alphanumerics and dashes, bounded length.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl MuxClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        cmd.arg("-S").arg(&self.socket);
        cmd
    }

    /// Probe that the tmux binary is runnable. A missing server is fine
    /// (sessions simply do not exist yet); a missing binary is fatal at
    /// startup.
    pub async fn probe(&self) -> MuxResult<()> {
        let output = Command::new("tmux").arg("-V").output().await?;
        if !output.status.success() {
            return Err(MuxError::Command(stderr_text(&output.stderr)));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        tracing::info!(version = %version.trim(), socket = %self.socket.display(), "multiplexer available");
        Ok(())
    }

    /// List all session names known to the server. A server that is not
    /// running reports an error on stderr; that is an empty list here, not
    /// a failure.
    pub async fn list_sessions(&self) -> MuxResult<Vec<String>> {
        let output = self
            .command()
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .await?;

        if !output.status.success() {
            let err = stderr_text(&output.stderr);
            if is_no_server(&err) {
                return Ok(Vec::new());
            }
            return Err(MuxError::Command(err));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Check whether a session exists by exact name.
    pub async fn session_exists(&self, name: &str) -> MuxResult<bool> {
        if !is_valid_session_name(name) {
            return Err(MuxError::InvalidName(name.to_string()));
        }
        // `=` forces exact match instead of prefix match.
        let output = self
            .command()
            .args(["has-session", "-t", &format!("={name}")])
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// Create a detached session and pin its window-size policy to `latest`
    /// so the most recently resizing client drives the dimensions.
    pub async fn create_session(
        &self,
        name: &str,
        window_name: &str,
        working_dir: Option<&Path>,
    ) -> MuxResult<()> {
        if !is_valid_session_name(name) {
            return Err(MuxError::InvalidName(name.to_string()));
        }

        let mut cmd = self.command();
        cmd.args(["new-session", "-d", "-s", name, "-n", window_name]);
        if let Some(dir) = working_dir {
            cmd.arg("-c").arg(dir);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(MuxError::Command(stderr_text(&output.stderr)));
        }

        let output = self
            .command()
            .args(["set-option", "-t", name, "window-size", "latest"])
            .output()
            .await?;
        if !output.status.success() {
            tracing::warn!(
                session = name,
                error = %stderr_text(&output.stderr),
                "failed to set window-size policy"
            );
        }

        Ok(())
    }

    /// Kill a session. Idempotent: a session that is already gone is Ok.
    pub async fn kill_session(&self, name: &str) -> MuxResult<()> {
        if !is_valid_session_name(name) {
            return Err(MuxError::InvalidName(name.to_string()));
        }
        let output = self
            .command()
            .args(["kill-session", "-t", &format!("={name}")])
            .output()
            .await?;
        if !output.status.success() {
            let err = stderr_text(&output.stderr);
            if is_no_server(&err) || err.contains("can't find session") {
                return Ok(());
            }
            return Err(MuxError::Command(err));
        }
        Ok(())
    }

    /// Build the attach command the PTY layer runs inside a pseudo-terminal.
    pub fn attach_command(&self, name: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new("tmux");
        cmd.arg("-S");
        cmd.arg(&self.socket);
        cmd.arg("attach-session");
        cmd.arg("-t");
        cmd.arg(format!("={name}"));
        cmd.env("TERM", "xterm-256color");
        cmd
    }
}

fn stderr_text(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr).trim().to_string()
}

fn is_no_server(err: &str) -> bool {
    err.contains("no server running") || err.contains("No such file or directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_session_name("winterm-abc123"));
        assert!(is_valid_session_name("a"));
        assert!(is_valid_session_name(&"x".repeat(64)));
    }

    #[test]
    fn invalid_names() {
        assert!(!is_valid_session_name(""));
        assert!(!is_valid_session_name("has space"));
        assert!(!is_valid_session_name("semi;colon"));
        assert!(!is_valid_session_name("../escape"));
        assert!(!is_valid_session_name(&"x".repeat(65)));
    }

    #[test]
    fn no_server_errors_recognized() {
        assert!(is_no_server("no server running on /tmp/tmux-0/default"));
        assert!(is_no_server(
            "error connecting to /tmp/x (No such file or directory)"
        ));
        assert!(!is_no_server("duplicate session: winterm-x"));
    }

    #[test]
    fn attach_command_targets_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let mux = MuxClient::new(dir.path().join("sock"));
        let cmd = mux.attach_command("winterm-abc");
        let argv: Vec<String> = cmd
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(argv[0], "tmux");
        assert!(argv.contains(&"=winterm-abc".to_string()));
        assert!(argv.contains(&"attach-session".to_string()));
    }
}
