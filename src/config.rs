//! Environment-style runtime settings.
//!
//! Everything is read once at startup; CLI flags override the
//! environment, the environment overrides compiled-in defaults.

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_DB_PATH: &str = "data/wattbench.db";

/// Process-level wiring: where to listen, where to store runs, and how
/// to reach the power meter.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: String,
    pub db_path: String,
    /// Use the mock power source instead of a real adapter.
    pub mock_power: bool,
    pub power_url: Option<String>,
    pub power_user: Option<String>,
    pub power_password: Option<String>,
    pub power_device_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            mock_power: false,
            power_url: None,
            power_user: None,
            power_password: None,
            power_device_id: None,
        }
    }
}

impl Settings {
    /// Read settings from `WATTBENCH_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env_opt("WATTBENCH_LISTEN").unwrap_or(defaults.listen_addr),
            db_path: env_opt("WATTBENCH_DB").unwrap_or(defaults.db_path),
            mock_power: env_flag("WATTBENCH_MOCK_POWER"),
            power_url: env_opt("WATTBENCH_POWER_URL"),
            power_user: env_opt("WATTBENCH_POWER_USER"),
            power_password: env_opt("WATTBENCH_POWER_PASSWORD"),
            power_device_id: env_opt("WATTBENCH_POWER_DEVICE_ID"),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listen_addr, DEFAULT_LISTEN);
        assert_eq!(settings.db_path, DEFAULT_DB_PATH);
        assert!(!settings.mock_power);
        assert!(settings.power_url.is_none());
    }

    #[test]
    fn test_env_opt_treats_empty_as_unset() {
        std::env::set_var("WATTBENCH_TEST_EMPTY", "");
        assert_eq!(env_opt("WATTBENCH_TEST_EMPTY"), None);

        std::env::set_var("WATTBENCH_TEST_SET", "value");
        assert_eq!(env_opt("WATTBENCH_TEST_SET"), Some("value".to_string()));
    }

    #[test]
    fn test_env_flag_parsing() {
        std::env::set_var("WATTBENCH_TEST_FLAG_ON", "true");
        assert!(env_flag("WATTBENCH_TEST_FLAG_ON"));

        std::env::set_var("WATTBENCH_TEST_FLAG_OFF", "0");
        assert!(!env_flag("WATTBENCH_TEST_FLAG_OFF"));

        assert!(!env_flag("WATTBENCH_TEST_FLAG_UNSET"));
    }
}
