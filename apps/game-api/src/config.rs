/// Game node configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// App ids this node serves (comma-separated `WSNET2_APPS`).
    pub app_ids: Vec<String>,
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Hostname advertised in room URLs.
    pub public_name: String,
    /// This node's id in the room table.
    pub host_id: u32,
    /// Upper bound for short room numbers.
    pub max_room_num: u32,
    /// Attempts at a unique room id/number before giving up.
    pub retry_count: u32,
    /// Idle grace in seconds for rooms that don't set their own.
    pub default_deadline_secs: u64,
    /// Events retained per session for replay.
    pub evbuf_size: usize,
    /// Room queue capacity; a full queue backpressures peer readers.
    pub room_queue_size: usize,
}

impl Config {
    /// Load configuration from environment variables. Every value has a
    /// development default.
    pub fn from_env() -> Self {
        Self {
            app_ids: std::env::var("WSNET2_APPS")
                .unwrap_or_else(|_| "testapp".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            port: env_or("PORT", 8000),
            public_name: std::env::var("PUBLIC_NAME").unwrap_or_else(|_| "localhost".to_string()),
            host_id: env_or("HOST_ID", 1),
            max_room_num: env_or("MAX_ROOM_NUM", 999_999),
            retry_count: env_or("RETRY_COUNT", 5),
            default_deadline_secs: env_or("DEFAULT_DEADLINE", 30),
            evbuf_size: env_or("EVBUF_SIZE", 1024),
            room_queue_size: env_or("ROOM_QUEUE_SIZE", 64),
        }
    }

    /// Data-plane URL for a room on this node.
    pub fn ws_url(&self, room_id: &str) -> String {
        format!("ws://{}:{}/room/{}", self.public_name, self.port, room_id)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_format() {
        let mut config = Config::from_env();
        config.public_name = "game1.example.com".to_string();
        config.port = 8000;
        assert_eq!(
            config.ws_url("abcd1234"),
            "ws://game1.example.com:8000/room/abcd1234"
        );
    }
}
