use std::path::PathBuf;

pub const DEFAULT_RESET_CONFIRM: &str = "RESET ALL DATA";
pub const DEFAULT_RETENTION_DAYS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Credential expected in the `x-admin-key` header. `None` disables admin methods.
    pub admin_key: Option<String>,
    pub workspace: Option<PathBuf>,
    pub reset_confirm: String,
    pub retention_days: i64,
    pub log_format: LogFormat,
    /// Problems found while loading. Logged by the caller once a subscriber is installed.
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_key: None,
            workspace: None,
            reset_confirm: DEFAULT_RESET_CONFIRM.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            log_format: LogFormat::Text,
            warnings: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(v) = lookup("TIMETABLED_ADMIN_KEY") {
            let v = v.trim().to_string();
            if v.is_empty() {
                config
                    .warnings
                    .push("TIMETABLED_ADMIN_KEY is empty; admin methods stay disabled".to_string());
            } else {
                config.admin_key = Some(v);
            }
        }
        if let Some(v) = lookup("TIMETABLED_WORKSPACE") {
            if !v.trim().is_empty() {
                config.workspace = Some(PathBuf::from(v.trim()));
            }
        }
        if let Some(v) = lookup("TIMETABLED_RESET_CONFIRM") {
            if !v.trim().is_empty() {
                config.reset_confirm = v.trim().to_string();
            }
        }
        if let Some(v) = lookup("TIMETABLED_RETENTION_DAYS") {
            match v.trim().parse::<i64>() {
                Ok(n) if n > 0 => config.retention_days = n,
                _ => config
                    .warnings
                    .push(format!("ignoring invalid TIMETABLED_RETENTION_DAYS value {v:?}")),
            }
        }
        if let Some(v) = lookup("TIMETABLED_LOG_FORMAT") {
            config.log_format = match v.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            };
        }

        config
    }
}
