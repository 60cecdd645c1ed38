//! Configuration loader and validator for the campaign dispatcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub dispatch: Dispatch,
    pub mail: Mail,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Scheduler and worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub workers: usize,
    pub scan_interval_seconds: u64,
    #[serde(default = "default_scan_chunk_size")]
    pub scan_chunk_size: i64,
    pub send_timeout_seconds: u64,
    pub lease_seconds: u64,
    #[serde(default = "default_error_max_len")]
    pub error_max_len: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Smtp,
    Log,
}

/// Outgoing mail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub transport: TransportKind,
    pub from: String,
    #[serde(default)]
    pub unsubscribe_base_url: Option<String>,
    #[serde(default)]
    pub smtp: Option<Smtp>,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain connection upgraded with STARTTLS.
    #[default]
    Starttls,
    /// Implicit TLS from the first byte.
    Tls,
    /// Unencrypted; local relays and tests only.
    None,
}

/// SMTP relay settings, required when `mail.transport` is `smtp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smtp {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_seconds: u64,
}

fn default_scan_chunk_size() -> i64 {
    10
}

fn default_error_max_len() -> usize {
    crate::db::delivery::DEFAULT_ERROR_MAX_LEN
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout() -> u64 {
    10
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Database URL, honouring `DATABASE_URL` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/campaigns.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn worker_options(&self) -> crate::worker::WorkerOptions {
        crate::worker::WorkerOptions {
            send_timeout: Duration::from_secs(self.dispatch.send_timeout_seconds),
            lease: Duration::from_secs(self.dispatch.lease_seconds),
            max_backoff_secs: self.app.max_backoff_seconds as i64,
            error_max_len: self.dispatch.error_max_len,
            unsubscribe_base_url: self.mail.unsubscribe_base_url.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.dispatch.workers == 0 {
        return Err(ConfigError::Invalid("dispatch.workers must be > 0"));
    }
    if cfg.dispatch.scan_interval_seconds == 0 {
        return Err(ConfigError::Invalid("dispatch.scan_interval_seconds must be > 0"));
    }
    if cfg.dispatch.scan_chunk_size <= 0 {
        return Err(ConfigError::Invalid("dispatch.scan_chunk_size must be > 0"));
    }
    if cfg.dispatch.send_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("dispatch.send_timeout_seconds must be > 0"));
    }
    if cfg.dispatch.lease_seconds <= cfg.dispatch.send_timeout_seconds {
        return Err(ConfigError::Invalid(
            "dispatch.lease_seconds must exceed dispatch.send_timeout_seconds",
        ));
    }
    if cfg.dispatch.error_max_len == 0 {
        return Err(ConfigError::Invalid("dispatch.error_max_len must be > 0"));
    }

    if cfg.mail.from.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.from must be non-empty"));
    }
    if cfg.mail.transport == TransportKind::Smtp {
        let Some(smtp) = cfg.mail.smtp.as_ref() else {
            return Err(ConfigError::Invalid("mail.smtp is required for the smtp transport"));
        };
        if smtp.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mail.smtp.host must be non-empty"));
        }
    }

    Ok(())
}

/// Returns the example YAML shipped with the repository.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60

dispatch:
  workers: 4
  scan_interval_seconds: 60
  scan_chunk_size: 10
  send_timeout_seconds: 30
  lease_seconds: 120
  error_max_len: 255

mail:
  transport: smtp
  from: "Campaigns <campaigns@example.com>"
  unsubscribe_base_url: "https://mail.example.com/unsubscribe"
  smtp:
    host: "smtp.example.com"
    port: 587
    username: "YOUR_SMTP_USERNAME"
    password: "YOUR_SMTP_PASSWORD"
    tls: starttls
    timeout_seconds: 10
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispatch.workers, 4);
        assert_eq!(cfg.mail.transport, TransportKind::Smtp);
    }

    #[test]
    fn invalid_worker_count() {
        let mut cfg = example_cfg();
        cfg.dispatch.workers = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("dispatch.workers")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn lease_must_outlast_send_timeout() {
        let mut cfg = example_cfg();
        cfg.dispatch.lease_seconds = cfg.dispatch.send_timeout_seconds;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("lease_seconds")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn smtp_transport_requires_smtp_section() {
        let mut cfg = example_cfg();
        cfg.mail.smtp = None;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        cfg.mail.transport = TransportKind::Log;
        validate(&cfg).unwrap();
    }

    #[test]
    fn tls_mode_is_a_closed_set() {
        let cfg = example_cfg();
        assert_eq!(cfg.mail.smtp.as_ref().unwrap().tls, TlsMode::Starttls);

        let yaml = example().replace("tls: starttls", "tls: ssl3");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());

        let yaml = example().replace("tls: starttls", "tls: none");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.mail.smtp.unwrap().tls, TlsMode::None);
    }

    #[test]
    fn optional_fields_take_defaults() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 100
  max_backoff_seconds: 30
dispatch:
  workers: 2
  scan_interval_seconds: 5
  send_timeout_seconds: 10
  lease_seconds: 60
mail:
  transport: log
  from: "noreply@example.com"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispatch.scan_chunk_size, 10);
        assert_eq!(cfg.dispatch.error_max_len, 255);
        assert!(cfg.mail.unsubscribe_base_url.is_none());
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.dispatch.lease_seconds, 120);
        assert_eq!(
            cfg.mail.smtp.as_ref().map(|s| s.host.as_str()),
            Some("smtp.example.com")
        );
    }
}
