//! Runtime configuration, sourced from the environment plus an optional
//! banned-word list file (a JSON array of lowercase strings).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sampling options sent with every chat-completion request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplingOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            max_tokens: 180,
            temperature: 0.95,
            top_p: 0.95,
        }
    }
}

/// Where the inference backend lives and which model to prefer.
#[derive(Clone, Debug)]
pub struct InferenceConfig {
    pub host: String,
    pub port: u16,
    /// Case-insensitive substring used to pick among loaded models.
    pub model_hint: Option<String>,
    pub sampling: SamplingOptions,
}

impl InferenceConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1234,
            model_hint: None,
            sampling: SamplingOptions::default(),
        }
    }
}

/// Per-worker tuning knobs.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Worker exits voluntarily after this long without inbound traffic.
    pub idle_timeout: Duration,
    /// How long a worker gets to exit after a terminate request before it is killed.
    pub grace: Duration,
    /// Depth of each worker's inbound queue. Overflow drops the message.
    pub inbound_queue_depth: usize,
    /// Process-wide ceiling on live workers.
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            grace: Duration::from_millis(500),
            inbound_queue_depth: 64,
            max_workers: 256,
        }
    }
}

/// Top-level configuration for the relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub inference: InferenceConfig,
    pub worker: WorkerConfig,
    /// Soft cap on in-memory transcript entries per connection; `None` = unbounded.
    pub history_soft_cap: Option<usize>,
    /// How long shutdown waits for connections to drain before force-killing.
    pub shutdown_deadline: Duration,
    pub server_port: u16,
    /// Lowercase words replaced by the redaction marker.
    pub banned_words: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            worker: WorkerConfig::default(),
            history_soft_cap: Some(256),
            shutdown_deadline: Duration::from_secs(1),
            server_port: 6969,
            banned_words: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Build configuration from environment variables, falling back to defaults.
    ///
    /// Recognized: `INFERENCE_HOST`, `INFERENCE_PORT`, `INFERENCE_MODEL`,
    /// `WORKER_IDLE_TIMEOUT_SECS`, `WORKER_GRACE_MS`, `SERVER_PORT`,
    /// `BANNED_WORDS_FILE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("INFERENCE_HOST") {
            config.inference.host = host;
        }
        if let Some(port) = env_parse::<u16>("INFERENCE_PORT") {
            config.inference.port = port;
        }
        if let Ok(hint) = std::env::var("INFERENCE_MODEL") {
            if !hint.is_empty() {
                config.inference.model_hint = Some(hint);
            }
        }
        if let Some(secs) = env_parse::<u64>("WORKER_IDLE_TIMEOUT_SECS") {
            config.worker.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("WORKER_GRACE_MS") {
            config.worker.grace = Duration::from_millis(ms);
        }
        if let Some(port) = env_parse::<u16>("SERVER_PORT") {
            config.server_port = port;
        }
        if let Ok(path) = std::env::var("BANNED_WORDS_FILE") {
            match load_banned_words(Path::new(&path)) {
                Ok(words) => config.banned_words = words,
                Err(e) => eprintln!("lucid: failed to load banned words from {path}: {e}"),
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Load the banned-word list: a JSON array of strings, lowercased on load.
pub fn load_banned_words(path: &Path) -> Result<Vec<String>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let words: Vec<String> = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
    Ok(words.into_iter().map(|w| w.to_lowercase()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_defaults() {
        let s = SamplingOptions::default();
        assert_eq!(s.max_tokens, 180);
        assert!((s.temperature - 0.95).abs() < f64::EPSILON);
        assert!((s.top_p - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn inference_base_url() {
        let c = InferenceConfig {
            host: "10.0.0.5".into(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(c.base_url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn config_defaults() {
        let c = RelayConfig::default();
        assert_eq!(c.worker.idle_timeout, Duration::from_secs(1800));
        assert_eq!(c.worker.inbound_queue_depth, 64);
        assert_eq!(c.shutdown_deadline, Duration::from_secs(1));
        assert_eq!(c.history_soft_cap, Some(256));
        assert!(c.banned_words.is_empty());
    }

    #[test]
    fn banned_words_loaded_and_lowercased() {
        let dir = std::env::temp_dir().join(format!("lucid-config-{}", uuid_suffix()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("banned.json");
        std::fs::write(&path, r#"["Foo", "BAR", "baz"]"#).unwrap();

        let words = load_banned_words(&path).unwrap();
        assert_eq!(words, vec!["foo", "bar", "baz"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn banned_words_missing_file() {
        let path = Path::new("/nonexistent/banned.json");
        assert!(load_banned_words(path).is_err());
    }

    #[test]
    fn banned_words_bad_json() {
        let dir = std::env::temp_dir().join(format!("lucid-config-{}", uuid_suffix()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("banned.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_banned_words(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn uuid_suffix() -> String {
        uuid::Uuid::now_v7().to_string()
    }
}
