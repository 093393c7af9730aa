//! Gateway configuration.
//!
//! All settings come from environment variables with sensible defaults, so
//! the binary runs with zero configuration on a developer machine. The PIN
//! and JWT secret are generated at startup when unset (the PIN is logged
//! once so the operator can hand it to users).

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// Prefix identifying multiplexer sessions owned by this gateway.
pub const OWNED_PREFIX: &str = "winterm-";

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// When true, REST auth is bypassed entirely.
    pub dev_mode: bool,
    /// Login PIN. Generated when unset.
    pub pin: String,
    /// Whether the PIN was generated this run (and should be logged).
    pub pin_generated: bool,
    /// HS256 secret for bearer tokens. Generated when unset.
    pub jwt_secret: String,
    /// Bearer token lifetime in days.
    pub jwt_ttl_days: i64,

    /// tmux server socket path.
    pub mux_socket: PathBuf,
    /// Registry reconciliation sweep period.
    pub cleanup_period: Duration,

    /// Attachment token lifetime.
    pub token_ttl: Duration,
    /// Expired-token sweep period.
    pub token_sweep_period: Duration,

    /// Grace before an unreferenced PTY instance is torn down.
    pub idle_grace: Duration,
    /// Grace between SIGTERM and SIGKILL on the attach child.
    pub kill_grace: Duration,
    /// PTY read chunk size.
    pub read_chunk: usize,
    /// Bound on the per-instance PTY input queue.
    pub write_queue_capacity: usize,

    /// Bound on each subscriber's outbound frame queue.
    pub send_queue_capacity: usize,
    /// Maximum inbound WebSocket frame size.
    pub read_limit: usize,
    /// Idle budget for the socket read loop; refreshed by any inbound frame.
    pub pong_wait: Duration,
    /// Interval between server pings.
    pub ping_period: Duration,
    /// Deadline for a single outbound socket write.
    pub write_wait: Duration,
}

impl Config {
    /// Build the configuration from the environment.
    pub fn from_env() -> Self {
        let (pin, pin_generated) = match read_var("WINTERM_PIN") {
            Some(p) => (p, false),
            None => (generate_pin(), true),
        };
        let jwt_secret =
            read_var("WINTERM_JWT_SECRET").unwrap_or_else(|| hex_bytes(32));

        Self {
            host: read_var("WINTERM_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_var("WINTERM_PORT", 8077),
            dev_mode: read_var("WINTERM_DEV_MODE").as_deref() == Some("true"),
            pin,
            pin_generated,
            jwt_secret,
            jwt_ttl_days: parse_var("WINTERM_JWT_TTL_DAYS", 30),
            mux_socket: read_var("WINTERM_TMUX_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(default_mux_socket),
            cleanup_period: Duration::from_secs(parse_var("WINTERM_CLEANUP_PERIOD_SECS", 600)),
            token_ttl: Duration::from_secs(parse_var("WINTERM_TOKEN_TTL_SECS", 30)),
            token_sweep_period: Duration::from_secs(parse_var("WINTERM_TOKEN_SWEEP_SECS", 60)),
            idle_grace: Duration::from_secs(parse_var("WINTERM_IDLE_GRACE_SECS", 30)),
            kill_grace: Duration::from_secs(parse_var("WINTERM_KILL_GRACE_SECS", 5)),
            read_chunk: parse_var("WINTERM_READ_CHUNK", 32 * 1024),
            write_queue_capacity: parse_var("WINTERM_WRITE_QUEUE_CAPACITY", 256),
            send_queue_capacity: parse_var("WINTERM_SEND_QUEUE_CAPACITY", 256),
            read_limit: parse_var("WINTERM_READ_LIMIT", 1024 * 1024),
            pong_wait: Duration::from_secs(parse_var("WINTERM_PONG_WAIT_SECS", 120)),
            ping_period: Duration::from_secs(parse_var("WINTERM_PING_PERIOD_SECS", 30)),
            write_wait: Duration::from_secs(parse_var("WINTERM_WRITE_WAIT_SECS", 10)),
        }
    }
}

fn read_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match read_var(name) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Invalid value for {name}: {raw:?}, using default");
                default
            }
        },
        None => default,
    }
}

/// Default tmux socket for the current user, matching tmux's own layout.
fn default_mux_socket() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/tmux-{uid}/default"))
}

fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(0..1_000_000u32))
}

fn hex_bytes(n: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..n).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pin_is_six_digits() {
        for _ in 0..32 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn hex_bytes_length() {
        assert_eq!(hex_bytes(32).len(), 64);
        assert!(hex_bytes(16).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn default_socket_under_tmp() {
        let path = default_mux_socket();
        assert!(path.starts_with("/tmp"));
        assert!(path.to_string_lossy().contains("tmux-"));
    }
}
