use std::env;

use url::Url;
use uuid::Uuid;

/// Agent configuration, loaded from the environment the way the
/// provisioning flow writes it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control server base URL (`PATHFINDER_SERVER_URL`). `http(s)`
    /// schemes are accepted and rewritten to `ws(s)`.
    pub server_url: String,
    /// Stable robot identity (`PATHFINDER_ROBOT_ID`); generated fresh
    /// when unset.
    pub robot_id: String,
    /// Operator-facing display name (`PATHFINDER_ROBOT_NAME`).
    pub robot_name: String,
    /// Whether a hardware driver is expected (`PATHFINDER_HARDWARE`).
    pub hardware_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let server_url = env::var("PATHFINDER_SERVER_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
        let robot_id =
            env::var("PATHFINDER_ROBOT_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let robot_name =
            env::var("PATHFINDER_ROBOT_NAME").unwrap_or_else(|_| "pathfinder".to_string());
        let hardware_enabled = env::var("PATHFINDER_HARDWARE")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false);
        Self {
            server_url,
            robot_id,
            robot_name,
            hardware_enabled,
        }
    }

    /// Websocket endpoint of the control channel. Accepts `http(s)`
    /// URLs for convenience and maps the scheme over.
    pub fn control_url(&self) -> String {
        match Url::parse(&self.server_url) {
            Ok(mut url) => {
                let mapped = match url.scheme() {
                    "http" => Some("ws"),
                    "https" => Some("wss"),
                    _ => None,
                };
                if let Some(scheme) = mapped {
                    let _ = url.set_scheme(scheme);
                }
                url.to_string()
            }
            Err(_) => self.server_url.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            robot_id: Uuid::new_v4().to_string(),
            robot_name: "pathfinder".to_string(),
            hardware_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment-variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::remove_var("PATHFINDER_SERVER_URL");
        env::remove_var("PATHFINDER_ROBOT_NAME");
        env::remove_var("PATHFINDER_HARDWARE");
        let config = Config::from_env();
        assert_eq!(config.server_url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.robot_name, "pathfinder");
        assert!(!config.hardware_enabled);
    }

    #[test]
    fn http_scheme_is_rewritten_for_the_control_url() {
        let config = Config {
            server_url: "https://pathfinder-kit.example.org/ws".into(),
            ..Config::default()
        };
        assert_eq!(config.control_url(), "wss://pathfinder-kit.example.org/ws");

        let config = Config {
            server_url: "ws://10.0.0.2:8080/ws".into(),
            ..Config::default()
        };
        assert_eq!(config.control_url(), "ws://10.0.0.2:8080/ws");
    }

    #[test]
    fn explicit_env_values_win() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("PATHFINDER_ROBOT_ID", "rov-42");
        env::set_var("PATHFINDER_HARDWARE", "1");
        let config = Config::from_env();
        assert_eq!(config.robot_id, "rov-42");
        assert!(config.hardware_enabled);
        env::remove_var("PATHFINDER_ROBOT_ID");
        env::remove_var("PATHFINDER_HARDWARE");
    }
}
