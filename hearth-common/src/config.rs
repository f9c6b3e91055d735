//! Layered configuration.
//!
//! A configuration is a TOML table assembled from layers, later layers
//! winning per key: the global user file (`<config dir>/hearth/config.toml`),
//! then any explicitly listed files (the repository's `.hearth/config.toml`),
//! then `HEARTH_*` environment variables through the typed [`EnvParser`],
//! then `--config section.key=value` command-line overrides. Sessions clone
//! the loaded baseline before applying per-command overrides so nothing
//! leaks from one command into the next.
//!
//! Values are stored loosely and coerced on access: an integer written in a
//! file and the same number arriving as an override string answer the same
//! through the typed getters.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("malformed override {0:?}, expected section.key=value")]
    Override(String),

    #[error("invalid environment: {0}")]
    Environment(String),
}

/// Errors collected while parsing `HEARTH_*` variables. All of them are
/// reported at once instead of failing on the first.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("invalid duration for {var}: {value:?}")]
    InvalidDuration { var: String, value: String },

    #[error("value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Typed reader for prefixed environment variables, collecting every error
/// so a misconfigured environment produces one complete report.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "HEARTH_",
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str) -> Option<String> {
        env::var(self.var_name(name)).ok()
    }

    /// A value that must parse as a `humantime` duration ("30s", "1h").
    pub fn get_duration(&mut self, name: &str) -> Option<Duration> {
        let var = self.var_name(name);
        let value = env::var(&var).ok()?;
        match humantime::parse_duration(&value) {
            Ok(d) => Some(d),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                None
            }
        }
    }

    pub fn get_usize_range(&mut self, name: &str, min: usize, max: usize) -> Option<usize> {
        let var = self.var_name(name);
        let value = env::var(&var).ok()?;
        match value.parse::<usize>() {
            Ok(n) if (min..=max).contains(&n) => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer".to_owned(),
                    value,
                });
                None
            }
        }
    }

    /// A value restricted to a fixed set of words.
    pub fn get_choice(&mut self, name: &str, choices: &[&str]) -> Option<String> {
        let var = self.var_name(name);
        let value = env::var(&var).ok()?;
        if choices.contains(&value.as_str()) {
            Some(value)
        } else {
            self.errors.push(EnvError::InvalidValue {
                var,
                expected: choices.join("/"),
                value,
            });
            None
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Which layers [`Config::load`] reads.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Explicit config files, applied in order after the global file.
    /// Missing files are skipped; unreadable or unparsable ones fail.
    pub files: Vec<PathBuf>,
    /// Read the per-user global config file.
    pub use_global: bool,
    /// Apply `HEARTH_*` environment variables.
    pub use_env: bool,
    /// `section.key=value` overrides, applied last.
    pub overrides: Vec<String>,
}

impl LoadOptions {
    /// Everything: global file, environment, plus whatever the caller adds.
    pub fn standard() -> Self {
        Self {
            files: Vec::new(),
            use_global: true,
            use_env: true,
            overrides: Vec::new(),
        }
    }

    /// Only the listed files and overrides; hermetic for tests.
    pub fn isolated() -> Self {
        Self {
            files: Vec::new(),
            use_global: false,
            use_env: false,
            overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    table: toml::Table,
}

impl Config {
    pub fn load(opts: &LoadOptions) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if opts.use_global
            && let Some(dir) = dirs::config_dir()
        {
            config.merge_file(&dir.join("hearth").join("config.toml"))?;
        }
        for path in &opts.files {
            config.merge_file(path)?;
        }
        if opts.use_env {
            config.apply_env()?;
        }
        for spec in &opts.overrides {
            config.apply_override(spec)?;
        }
        Ok(config)
    }

    /// Merge one more config file on top of what is already loaded. Missing
    /// files are skipped; repo-local config uses this after discovery.
    pub fn merge_optional_file(&mut self, path: &std::path::Path) -> Result<(), ConfigError> {
        self.merge_file(path)
    }

    fn merge_file(&mut self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file");
                return Ok(());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        let parsed: toml::Table = content.parse().map_err(|err: toml::de::Error| {
            ConfigError::Parse {
                path: path.to_owned(),
                message: err.message().to_owned(),
            }
        })?;
        for (name, value) in parsed {
            match (self.table.get_mut(&name), value) {
                (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k, v);
                    }
                }
                (_, value) => {
                    self.table.insert(name, value);
                }
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();
        if let Some(path) = parser.get_string("SOCKET") {
            self.set("server", "socket-path", path);
        }
        if let Some(d) = parser.get_duration("IDLE_TIMEOUT") {
            self.set("server", "idle-timeout", format!("{}s", d.as_secs()));
        }
        if let Some(d) = parser.get_duration("POLL_INTERVAL") {
            self.set("server", "poll-interval", format!("{}ms", d.as_millis()));
        }
        if let Some(n) = parser.get_usize_range("REPO_CACHE_SIZE", 1, 1024) {
            self.set("server", "repo-cache-size", n.to_string());
        }
        if let Some(encoding) = parser.get_string("ENCODING") {
            self.set("ui", "encoding", encoding);
        }
        if let Some(mode) = parser.get_choice("MESSAGE_OUTPUT", &["bytes", "channel"]) {
            self.set("ui", "message-output", mode);
        }
        if parser.has_errors() {
            let joined = parser
                .take_errors()
                .iter()
                .map(EnvError::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigError::Environment(joined));
        }
        Ok(())
    }

    /// Apply one `section.key=value` override.
    pub fn apply_override(&mut self, spec: &str) -> Result<(), ConfigError> {
        let (name, value) = spec
            .split_once('=')
            .ok_or_else(|| ConfigError::Override(spec.to_owned()))?;
        let (section, key) = name
            .split_once('.')
            .ok_or_else(|| ConfigError::Override(spec.to_owned()))?;
        if section.is_empty() || key.is_empty() {
            return Err(ConfigError::Override(spec.to_owned()));
        }
        self.set(section.trim(), key.trim(), value);
        Ok(())
    }

    /// Set one item. Override and environment values arrive as strings; the
    /// typed getters coerce them back.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let entry = self
            .table
            .entry(section.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(table) = entry {
            table.insert(key.to_owned(), toml::Value::String(value.into()));
        }
    }

    fn section(&self, name: &str) -> Option<&toml::Table> {
        self.table.get(name).and_then(toml::Value::as_table)
    }

    fn raw(&self, section: &str, key: &str) -> Option<&toml::Value> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn get_str(&self, section: &str, key: &str) -> Option<String> {
        self.raw(section, key).map(render)
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.raw(section, key)? {
            toml::Value::Boolean(b) => Some(*b),
            toml::Value::String(s) => match s.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_usize(&self, section: &str, key: &str) -> Option<usize> {
        match self.raw(section, key)? {
            toml::Value::Integer(n) => usize::try_from(*n).ok(),
            toml::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Duration item: a `humantime` string, or a bare integer of seconds.
    pub fn get_duration(&self, section: &str, key: &str) -> Option<Duration> {
        match self.raw(section, key)? {
            toml::Value::Integer(n) => u64::try_from(*n).ok().map(Duration::from_secs),
            toml::Value::String(s) => humantime::parse_duration(s).ok(),
            _ => None,
        }
    }

    /// All items of a section in sorted key order, values in canonical
    /// string form. This is what the config hash digests.
    pub fn section_items(&self, name: &str) -> Vec<(String, String)> {
        let Some(section) = self.section(name) else {
            return Vec::new();
        };
        let mut items: Vec<(String, String)> = section
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect();
        items.sort();
        items
    }

    /// The `[plugins]` paths, tilde-expanded, in sorted key order.
    pub fn plugin_paths(&self) -> Vec<PathBuf> {
        self.section_items("plugins")
            .into_iter()
            .map(|(_, path)| PathBuf::from(shellexpand::tilde(&path).into_owned()))
            .collect()
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        let raw = self.get_str("server", "socket-path")?;
        Some(PathBuf::from(shellexpand::tilde(&raw).into_owned()))
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let raw = self.get_str("server", "log-dir")?;
        Some(PathBuf::from(shellexpand::tilde(&raw).into_owned()))
    }

    /// The session encoding announced in the hello banner: `ui.encoding`,
    /// else the locale's charset, else UTF-8.
    pub fn encoding(&self) -> String {
        if let Some(enc) = self.get_str("ui", "encoding") {
            return enc;
        }
        for var in ["LC_ALL", "LC_CTYPE", "LANG"] {
            if let Ok(locale) = env::var(var)
                && let Some((_, charset)) = locale.split_once('.')
            {
                return charset.to_owned();
            }
        }
        "UTF-8".to_owned()
    }

    /// Whether notices go out as structured `m` frames.
    pub fn message_output_channel(&self) -> bool {
        self.get_str("ui", "message-output").as_deref() == Some("channel")
    }

    pub fn shutdown_on_interrupt(&self) -> bool {
        self.get_bool("server", "shutdown-on-interrupt").unwrap_or(false)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.get_duration("server", "idle-timeout")
            .unwrap_or(Duration::from_secs(3600))
    }

    pub fn poll_interval(&self) -> Duration {
        self.get_duration("server", "poll-interval")
            .unwrap_or(Duration::from_secs(1))
    }

    pub fn repo_cache_size(&self) -> usize {
        self.get_usize("server", "repo-cache-size").unwrap_or(8)
    }

    pub fn lock_wait(&self) -> Option<Duration> {
        self.get_duration("ui", "lock-wait")
    }
}

/// Canonical string form of a value, stable across file and override
/// spellings of the same item.
fn render(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
