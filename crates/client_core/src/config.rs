use std::{env, fs};

use serde::Deserialize;

/// Client-wide settings. One instance feeds the composition root; rooms
/// never read configuration on their own.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base_url: String,
    /// Explicit broker endpoint; when absent it is derived from the API
    /// base URL.
    pub broker_url: Option<String>,
    pub history_page_size: u32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            broker_url: None,
            history_page_size: 50,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_ms: 10000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    broker_url: Option<String>,
    history_page_size: Option<u32>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("chat_client.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Ok(v) = env::var("CHAT_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = env::var("CHAT_BROKER_URL") {
        settings.broker_url = Some(v);
    }
    if let Ok(v) = env::var("CHAT_HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }
    if let Ok(v) = env::var("CHAT_RECONNECT_INITIAL_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_initial_delay_ms = parsed;
        }
    }
    if let Ok(v) = env::var("CHAT_RECONNECT_MAX_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_max_delay_ms = parsed;
        }
    }

    settings
}

fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<FileSettings>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.broker_url {
        settings.broker_url = Some(v);
    }
    if let Some(v) = file_cfg.history_page_size {
        settings.history_page_size = v;
    }
    if let Some(v) = file_cfg.reconnect_initial_delay_ms {
        settings.reconnect_initial_delay_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay_ms = v;
    }
}

impl Settings {
    pub fn broker_url_or_derived(&self) -> String {
        match &self.broker_url {
            Some(url) => url.clone(),
            None => derive_broker_url(&self.api_base_url),
        }
    }
}

fn derive_broker_url(api_base_url: &str) -> String {
    let base = if let Some(rest) = api_base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_base_url.to_string()
    };
    format!("{}/ws", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_broker_url_from_api_base() {
        assert_eq!(
            derive_broker_url("https://api.example.com"),
            "wss://api.example.com/ws"
        );
        assert_eq!(
            derive_broker_url("http://127.0.0.1:8080/"),
            "ws://127.0.0.1:8080/ws"
        );
    }

    #[test]
    fn explicit_broker_url_wins() {
        let settings = Settings {
            broker_url: Some("wss://broker.example.com/stomp".into()),
            ..Settings::default()
        };
        assert_eq!(
            settings.broker_url_or_derived(),
            "wss://broker.example.com/stomp"
        );
    }

    #[test]
    fn file_overrides_apply_over_defaults() {
        let mut settings = Settings::default();
        apply_file_overrides(
            &mut settings,
            r#"
                api_base_url = "https://api.example.com"
                history_page_size = 25
                reconnect_max_delay_ms = 5000
            "#,
        );
        assert_eq!(settings.api_base_url, "https://api.example.com");
        assert_eq!(settings.history_page_size, 25);
        assert_eq!(settings.reconnect_initial_delay_ms, 1000);
        assert_eq!(settings.reconnect_max_delay_ms, 5000);
    }

    #[test]
    fn malformed_file_is_ignored() {
        let mut settings = Settings::default();
        apply_file_overrides(&mut settings, "this is not toml [");
        assert_eq!(settings.api_base_url, Settings::default().api_base_url);
    }
}
