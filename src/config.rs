use std::time::Duration;

/// Process-wide configuration, collected once at startup from the environment.
///
/// Mirrors the env-var-defaulted struct pattern used throughout the codebase
/// (compare `persistence::sqlx_store`'s pool configuration) but gathers every
/// hub-relevant knob in one place instead of scattering `env::var` calls.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub enable_metrics: bool,

    /// Capacity of a session's outbound queue. Overflow evicts the session.
    pub session_queue_capacity: usize,
    /// Capacity of the hub's internal command channels.
    pub hub_channel_capacity: usize,
    /// Read deadline; reset on every inbound frame.
    pub pong_wait: Duration,
    /// Ping interval, conventionally 9/10 of `pong_wait`.
    pub ping_period: Duration,
    /// Write deadline for a single outbound flush.
    pub write_wait: Duration,
    /// Maximum accepted inbound frame size.
    pub max_frame_bytes: usize,
    /// Number of messages replayed to a session on `subscribe_chat`.
    pub replay_window: i64,
    /// Idle duration after which a typing indicator auto-expires.
    pub typing_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let pong_wait = Duration::from_secs(env_u64("PONG_WAIT_SECONDS", 60));

        Self {
            server_port: env_var("SERVER_PORT", "8080").parse().unwrap_or(8080),
            database_url: env_var("DATABASE_URL", "postgres://localhost/chat_hub"),
            jwt_secret: env_var("JWT_SECRET", "dev-secret-change-me"),
            enable_metrics: matches!(
                std::env::var("ENABLE_METRICS").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
            ),
            session_queue_capacity: env_u64("SESSION_QUEUE_CAPACITY", 256) as usize,
            hub_channel_capacity: env_u64("HUB_CHANNEL_CAPACITY", 256) as usize,
            ping_period: pong_wait.mul_f64(0.9),
            pong_wait,
            write_wait: Duration::from_secs(env_u64("WRITE_WAIT_SECONDS", 10)),
            max_frame_bytes: env_u64("MAX_FRAME_BYTES", 512 * 1024) as usize,
            replay_window: env_u64("REPLAY_WINDOW", 50) as i64,
            typing_timeout: Duration::from_secs(env_u64("TYPING_TIMEOUT_SECONDS", 3)),
        }
    }

    pub fn log_level() -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| {
            #[cfg(debug_assertions)]
            {
                "debug".to_string()
            }
            #[cfg(not(debug_assertions))]
            {
                "warn".to_string()
            }
        })
    }
}

fn env_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        let cfg = Config {
            server_port: 0,
            database_url: String::new(),
            jwt_secret: String::new(),
            enable_metrics: false,
            session_queue_capacity: 1,
            hub_channel_capacity: 1,
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(60).mul_f64(0.9),
            write_wait: Duration::from_secs(1),
            max_frame_bytes: 1,
            replay_window: 1,
            typing_timeout: Duration::from_secs(1),
        };
        assert_eq!(cfg.ping_period, Duration::from_millis(54_000));
    }
}
