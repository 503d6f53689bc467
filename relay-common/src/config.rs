//! Configuration management for the relay bot.
//!
//! Configuration lives in a dotenv-style key/value file (`.env` by default,
//! overridable with `RELAY_CONFIG_PATH`). Environment variables take
//! precedence over values from the file.
//!
//! # Keys
//!
//! - `TELEGRAM_TOKEN` → Bot API token (required)
//! - `TELEGRAM_ID` → comma-separated allow-list of user or chat ids
//! - `EDIT_WAIT_SECONDS` → minimum seconds between live edits; unset or
//!   non-positive means every fragment is edited in
//! - `OPENAI_SESSION` → backend session cookie (required)
//! - `CONTINUATION_TOKEN` → per-chat tokens installed by `/renew`, written as
//!   `<chat_id>:<token>` pairs separated by commas
//! - `CHATGPT_BASE_URL` → backend endpoint override
//! - `LOG_LEVEL` / `LOG_FORMAT` → logging setup
//! - `LOG_QUIET_TARGETS` → comma-separated extra targets to quieten

use fs4::fs_std::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result, ResultExt};
use crate::validation::ValidationError;

pub const KEY_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const KEY_TELEGRAM_ID: &str = "TELEGRAM_ID";
pub const KEY_EDIT_WAIT_SECONDS: &str = "EDIT_WAIT_SECONDS";
pub const KEY_OPENAI_SESSION: &str = "OPENAI_SESSION";
pub const KEY_CONTINUATION_TOKEN: &str = "CONTINUATION_TOKEN";
pub const KEY_CHATGPT_BASE_URL: &str = "CHATGPT_BASE_URL";
pub const KEY_LOG_LEVEL: &str = "LOG_LEVEL";
pub const KEY_LOG_FORMAT: &str = "LOG_FORMAT";
pub const KEY_LOG_QUIET_TARGETS: &str = "LOG_QUIET_TARGETS";

/// Every key the config surface knows about.
pub const CONFIG_KEYS: &[&str] = &[
    KEY_TELEGRAM_TOKEN,
    KEY_TELEGRAM_ID,
    KEY_EDIT_WAIT_SECONDS,
    KEY_OPENAI_SESSION,
    KEY_CONTINUATION_TOKEN,
    KEY_CHATGPT_BASE_URL,
    KEY_LOG_LEVEL,
    KEY_LOG_FORMAT,
    KEY_LOG_QUIET_TARGETS,
];

/// Environment variable selecting the config file path.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG_PATH";

/// Accepted values for `LOG_FORMAT`.
pub const LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Parsed configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub telegram_token: String,
    /// Allow-listed user or chat ids. Empty means everyone may talk to the bot.
    pub telegram_ids: Vec<i64>,
    /// Raw `EDIT_WAIT_SECONDS`; see [`EnvConfig::edit_interval`].
    pub edit_wait_seconds: Option<i64>,
    pub openai_session: String,
    /// Continuation token per chat id, from `CONTINUATION_TOKEN`
    pub continuation_tokens: BTreeMap<i64, String>,
    pub chatgpt_base_url: Option<String>,
    pub log_level: String,
    pub log_format: String,
    /// Extra log targets to quieten, see [`crate::logging`]
    pub log_quiet_targets: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            telegram_token: String::new(),
            telegram_ids: Vec::new(),
            edit_wait_seconds: None,
            openai_session: String::new(),
            continuation_tokens: BTreeMap::new(),
            chatgpt_base_url: None,
            log_level: "info".into(),
            log_format: "pretty".into(),
            log_quiet_targets: Vec::new(),
        }
    }
}

impl EnvConfig {
    /// Build a config from raw key/value pairs.
    pub fn from_values(values: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            values
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let telegram_ids = match get(KEY_TELEGRAM_ID) {
            Some(raw) => parse_id_list(&raw)?,
            None => Vec::new(),
        };

        let edit_wait_seconds = match get(KEY_EDIT_WAIT_SECONDS) {
            Some(raw) => Some(raw.parse::<i64>().map_err(|e| ValidationError::InvalidValue {
                field: KEY_EDIT_WAIT_SECONDS.into(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let continuation_tokens = match get(KEY_CONTINUATION_TOKEN) {
            Some(raw) => parse_continuation_tokens(&raw)?,
            None => BTreeMap::new(),
        };

        let defaults = Self::default();
        Ok(Self {
            telegram_token: get(KEY_TELEGRAM_TOKEN).unwrap_or_default(),
            telegram_ids,
            edit_wait_seconds,
            openai_session: get(KEY_OPENAI_SESSION).unwrap_or_default(),
            continuation_tokens,
            chatgpt_base_url: get(KEY_CHATGPT_BASE_URL),
            log_level: get(KEY_LOG_LEVEL).unwrap_or(defaults.log_level),
            log_format: get(KEY_LOG_FORMAT).unwrap_or(defaults.log_format),
            log_quiet_targets: get(KEY_LOG_QUIET_TARGETS)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Minimum wait between two live edits of the same message.
    ///
    /// Unset, zero or negative all mean no throttling: every fragment
    /// produces an edit.
    pub fn edit_interval(&self) -> Duration {
        match self.edit_wait_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
            _ => Duration::ZERO,
        }
    }

    /// Ids allowed to use the bot. Empty means everyone is allowed.
    pub fn allow_list(&self) -> &[i64] {
        &self.telegram_ids
    }

    /// Check if an id is on the allow-list.
    pub fn has_telegram_id(&self, id: i64) -> bool {
        self.telegram_ids.contains(&id)
    }

    /// Log the defaults that apply because optional keys are missing.
    pub fn log_defaults(&self) {
        if self.telegram_ids.is_empty() {
            tracing::warn!("{KEY_TELEGRAM_ID} is not set, all users will be able to use the bot");
        }
        match self.edit_wait_seconds {
            None => tracing::info!("{KEY_EDIT_WAIT_SECONDS} not set, live edits are not throttled"),
            Some(secs) if secs <= 0 => {
                tracing::info!("{KEY_EDIT_WAIT_SECONDS} is {secs}, live edits are not throttled")
            }
            Some(_) => {}
        }
        if !self.continuation_tokens.is_empty() {
            tracing::info!(
                chats = self.continuation_tokens.len(),
                "Restoring renewed conversations"
            );
        }
    }
}

/// Parse `CONTINUATION_TOKEN`: `<chat_id>:<token>` pairs separated by commas.
pub fn parse_continuation_tokens(raw: &str) -> Result<BTreeMap<i64, String>> {
    let invalid = |reason: String| {
        Error::from(ValidationError::InvalidValue {
            field: KEY_CONTINUATION_TOKEN.into(),
            reason,
        })
    };

    let mut tokens = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (chat, token) = pair
            .split_once(':')
            .ok_or_else(|| invalid(format!("'{pair}' is not <chat_id>:<token>")))?;
        let chat = chat
            .trim()
            .parse::<i64>()
            .map_err(|e| invalid(format!("'{pair}': {e}")))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid(format!("'{pair}' has an empty token")));
        }
        tokens.insert(chat, token.to_string());
    }
    Ok(tokens)
}

/// Inverse of [`parse_continuation_tokens`].
pub fn format_continuation_tokens(tokens: &BTreeMap<i64, String>) -> String {
    tokens
        .iter()
        .map(|(chat, token)| format!("{chat}:{token}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|e| {
                Error::from(ValidationError::InvalidValue {
                    field: KEY_TELEGRAM_ID.into(),
                    reason: format!("'{s}': {e}"),
                })
            })
        })
        .collect()
}

/// Handle to the dotenv file backing the configuration.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `RELAY_CONFIG_PATH` if set, `.env` otherwise.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| ".env".to_string());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load configuration, with process environment variables taking precedence.
    pub fn load(&self) -> Result<EnvConfig> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Load configuration using `env` as the environment lookup.
    pub fn load_with_env<F>(&self, env: F) -> Result<EnvConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = self.read_values()?;

        for key in CONFIG_KEYS {
            if let Some(value) = env(key) {
                values.insert((*key).to_string(), value);
            }
        }

        EnvConfig::from_values(&values)
    }

    fn read_values(&self) -> Result<HashMap<String, String>> {
        let mut values = HashMap::new();

        if !self.path.exists() {
            tracing::info!(
                path = %self.path.display(),
                "Config file does not exist, using environment variables"
            );
            return Ok(values);
        }

        let iter = dotenvy::from_path_iter(&self.path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {e}", self.path.display()))
        })?;

        for item in iter {
            let (key, value) = item.map_err(|e| {
                Error::Config(format!("Failed to parse {}: {e}", self.path.display()))
            })?;
            values.insert(key, value);
        }

        Ok(values)
    }

    /// Write one key back to the file.
    pub fn update(&self, key: &str, value: &str) -> Result<()> {
        if value.contains(['\n', '\r']) {
            return Err(Error::InvalidInput(format!(
                "value for {key} must be a single line"
            )));
        }
        self.transact(key, |_| Ok(value.to_string()))
    }

    /// Record the continuation token of one chat, keeping the other chats'.
    pub fn set_continuation_token(&self, chat_id: i64, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() || token.contains([',', ':']) || token.contains(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "continuation token '{token}' cannot be stored"
            )));
        }

        self.transact(KEY_CONTINUATION_TOKEN, |current| {
            let mut tokens = match current {
                Some(raw) => parse_continuation_tokens(&raw)?,
                None => BTreeMap::new(),
            };
            tokens.insert(chat_id, token.to_string());
            Ok(format_continuation_tokens(&tokens))
        })
    }

    /// Rewrite `key` with the value `f` derives from its current one.
    ///
    /// The whole read-modify-write runs under an exclusive lock on the file, so
    /// two concurrent updates cannot interleave. Other lines, including
    /// comments, are kept as they are.
    pub fn transact<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(Option<String>) -> Result<String>,
    {
        if !CONFIG_KEYS.contains(&key) {
            return Err(Error::InvalidInput(format!("unknown config key {key}")));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create {}", parent.display()))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .context(format!("Failed to open {}", self.path.display()))?;

        file.lock_exclusive()
            .context(format!("Failed to lock {}", self.path.display()))?;

        let written = Self::rewrite_locked(&mut file, key, f);
        let unlocked = FileExt::unlock(&file);

        written.context(format!("Failed to update {}", self.path.display()))?;
        unlocked.context(format!("Failed to unlock {}", self.path.display()))?;

        tracing::info!(path = %self.path.display(), key = %key, "Config file updated");
        Ok(())
    }

    fn rewrite_locked<F>(file: &mut File, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(Option<String>) -> Result<String>,
    {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let mut current = None;
        for item in dotenvy::from_read_iter(contents.as_bytes()) {
            let (k, v) = item.map_err(|e| Error::Config(format!("Failed to parse: {e}")))?;
            if k == key {
                current = Some(v);
            }
        }

        let value = f(current)?;
        if value.contains(['\n', '\r']) {
            return Err(Error::InvalidInput(format!(
                "value for {key} must be a single line"
            )));
        }

        let updated = upsert_line(&contents, key, &value);

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(updated.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Replace the first `KEY=` line, or append one.
fn upsert_line(contents: &str, key: &str, value: &str) -> String {
    let new_line = format!("{key}={}", quote_value(value));
    let mut replaced = false;

    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            if !replaced && line_key(line) == Some(key) {
                replaced = true;
                new_line.clone()
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        lines.push(new_line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, _) = trimmed.split_once('=')?;
    Some(key.trim())
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$'));
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_file_uses_env() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("missing.env"));
        let config = file
            .load_with_env(|k| (k == KEY_TELEGRAM_TOKEN).then(|| "from-env".to_string()))
            .unwrap();
        assert_eq!(config.telegram_token, "from-env");
        assert!(config.telegram_ids.is_empty());
    }

    #[test]
    fn test_env_takes_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "TELEGRAM_TOKEN=from-file\nOPENAI_SESSION=abc\n").unwrap();

        let config = ConfigFile::new(&path)
            .load_with_env(|k| (k == KEY_TELEGRAM_TOKEN).then(|| "from-env".to_string()))
            .unwrap();
        assert_eq!(config.telegram_token, "from-env");
        assert_eq!(config.openai_session, "abc");
    }

    #[test]
    fn test_parse_id_list_and_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "TELEGRAM_ID=1,2,-100300\nEDIT_WAIT_SECONDS=3\n").unwrap();

        let config = ConfigFile::new(&path).load_with_env(no_env).unwrap();
        assert_eq!(config.telegram_ids, vec![1, 2, -100300]);
        assert!(config.has_telegram_id(-100300));
        assert_eq!(config.edit_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let mut values = HashMap::new();
        values.insert(KEY_TELEGRAM_ID.to_string(), "12,abc".to_string());
        let err = EnvConfig::from_values(&values).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_edit_interval_defaults() {
        let mut config = EnvConfig::default();
        assert_eq!(config.edit_interval(), Duration::ZERO);
        config.edit_wait_seconds = Some(2);
        assert_eq!(config.edit_interval(), Duration::from_secs(2));
        config.edit_wait_seconds = Some(0);
        assert_eq!(config.edit_interval(), Duration::ZERO);
        config.edit_wait_seconds = Some(-5);
        assert_eq!(config.edit_interval(), Duration::ZERO);
    }

    #[test]
    fn test_update_replaces_existing_key_and_keeps_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# bot settings\nTELEGRAM_TOKEN=t\nOPENAI_SESSION=old\nEDIT_WAIT_SECONDS=2\n",
        )
        .unwrap();

        let file = ConfigFile::new(&path);
        file.update(KEY_OPENAI_SESSION, "new-session").unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "# bot settings\nTELEGRAM_TOKEN=t\nOPENAI_SESSION=new-session\nEDIT_WAIT_SECONDS=2\n"
        );
        let config = file.load_with_env(no_env).unwrap();
        assert_eq!(config.openai_session, "new-session");
    }

    #[test]
    fn test_update_appends_missing_key_and_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".env");

        let file = ConfigFile::new(&path);
        file.update(KEY_OPENAI_SESSION, "with space").unwrap();

        let config = file.load_with_env(no_env).unwrap();
        assert_eq!(config.openai_session, "with space");
    }

    #[test]
    fn test_dollar_in_value_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join(".env"));
        file.update(KEY_OPENAI_SESSION, "ab$cd").unwrap();
        file.update(KEY_TELEGRAM_TOKEN, "1:x\\y$z").unwrap();

        let config = file.load_with_env(no_env).unwrap();
        assert_eq!(config.openai_session, "ab$cd");
        assert_eq!(config.telegram_token, "1:x\\y$z");
    }

    #[test]
    fn test_continuation_tokens_are_kept_per_chat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "TELEGRAM_TOKEN=t\n").unwrap();

        let file = ConfigFile::new(&path);
        file.set_continuation_token(42, "conv-a").unwrap();
        file.set_continuation_token(-100, "conv-b").unwrap();
        file.set_continuation_token(42, "conv-c").unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "TELEGRAM_TOKEN=t\nCONTINUATION_TOKEN=-100:conv-b,42:conv-c\n");

        let config = file.load_with_env(no_env).unwrap();
        assert_eq!(
            config.continuation_tokens,
            BTreeMap::from([(-100, "conv-b".to_string()), (42, "conv-c".to_string())])
        );

        assert!(file.set_continuation_token(7, "a,b").is_err());
        assert!(file.set_continuation_token(7, "").is_err());
    }

    #[test]
    fn test_malformed_continuation_tokens_are_rejected() {
        assert!(parse_continuation_tokens("conv-1").is_err());
        assert!(parse_continuation_tokens("abc:conv-1").is_err());
        assert!(parse_continuation_tokens("5:").is_err());
        assert_eq!(
            parse_continuation_tokens(" 5:conv-1 , ").unwrap(),
            BTreeMap::from([(5, "conv-1".to_string())])
        );
    }

    #[test]
    fn test_update_rejects_unknown_key_and_multiline() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join(".env"));
        assert!(file.update("SOMETHING_ELSE", "x").is_err());
        assert!(file.update(KEY_CONTINUATION_TOKEN, "a\nb").is_err());
        assert!(!file.path().exists());
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "TELEGRAM_TOKEN=t\n").unwrap();

        let handles: Vec<_> = [KEY_LOG_LEVEL, KEY_OPENAI_SESSION]
            .into_iter()
            .map(|key| {
                let file = ConfigFile::new(&path);
                std::thread::spawn(move || file.update(key, "value").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let config = ConfigFile::new(&path).load_with_env(no_env).unwrap();
        assert_eq!(config.telegram_token, "t");
        assert_eq!(config.log_level, "value");
        assert_eq!(config.openai_session, "value");
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value("plain"), "plain");
        assert_eq!(quote_value("a b"), "\"a b\"");
        assert_eq!(quote_value("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_value("a$b"), "\"a\\$b\"");
    }
}
