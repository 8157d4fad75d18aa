//! Configuration loading and validation.
//!
//! Accounts, cache policy and send policy come from a single YAML document in
//! the config directory. Unknown keys are rejected so typos fail loudly
//! instead of silently disabling safety settings.

pub mod secrets;

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const CACHE_FILE_NAME: &str = "cache.db";

/// Configuration directory: `$XDG_CONFIG_HOME/clerk` or `~/.config/clerk`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("clerk");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("clerk")
}

/// Data directory: `$XDG_DATA_HOME/clerk` or `~/.local/share/clerk`.
pub fn data_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("clerk");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("clerk")
}

/// Create the config and data directories, including the reserved
/// `oauth_tokens` subdirectory.
pub fn ensure_dirs() -> Result<()> {
    std::fs::create_dir_all(config_dir())?;
    std::fs::create_dir_all(data_dir())?;
    std::fs::create_dir_all(data_dir().join("oauth_tokens"))?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Gmail,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Imap
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FromAddress {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_true")]
    pub ssl: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_true")]
    pub starttls: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OauthConfig {
    pub client_id_file: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    #[serde(default)]
    pub protocol: Protocol,

    pub imap: Option<ImapConfig>,
    pub smtp: Option<SmtpConfig>,
    pub oauth: Option<OauthConfig>,
    pub from: FromAddress,

    pub password_cmd: Option<String>,
    pub password_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub window_days: u32,
    pub inbox_freshness_min: u32,
    pub body_freshness_min: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            inbox_freshness_min: 5,
            body_freshness_min: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SendConfig {
    pub require_confirmation: bool,
    /// Maximum sends per account per sliding hour.
    pub rate_limit: u32,
    pub blocked_recipients: Vec<String>,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            require_confirmation: true,
            rate_limit: 20,
            blocked_recipients: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub default_account: String,
    pub accounts: BTreeMap<String, AccountConfig>,
    pub cache: CacheConfig,
    pub send: SendConfig,
}

impl Config {
    /// Load configuration from the given path, or the default location.
    /// A missing file yields an empty configuration.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_dir().join(CONFIG_FILE_NAME),
        };
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::InvalidInput(format!("reading {}: {e}", path.display())))?;
        Config::parse(&raw)
    }

    /// Parse and validate a YAML configuration document.
    pub fn parse(raw: &str) -> Result<Config> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|e| Error::InvalidInput(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        for (name, account) in &self.accounts {
            match account.protocol {
                Protocol::Imap => {
                    if account.imap.is_none() {
                        return Err(Error::InvalidInput(format!(
                            "account '{name}': imap protocol requires an 'imap' section"
                        )));
                    }
                    if account.smtp.is_none() {
                        return Err(Error::InvalidInput(format!(
                            "account '{name}': imap protocol requires an 'smtp' section"
                        )));
                    }
                }
                Protocol::Gmail => {
                    if account.oauth.is_none() {
                        return Err(Error::InvalidInput(format!(
                            "account '{name}': gmail protocol requires an 'oauth' section"
                        )));
                    }
                }
            }
        }

        if !(1..=365).contains(&self.cache.window_days) {
            return Err(Error::InvalidInput(
                "cache.window_days must be between 1 and 365".into(),
            ));
        }
        if self.cache.inbox_freshness_min < 1 || self.cache.body_freshness_min < 1 {
            return Err(Error::InvalidInput(
                "cache freshness intervals must be at least 1 minute".into(),
            ));
        }
        if self.send.rate_limit < 1 {
            return Err(Error::InvalidInput("send.rate_limit must be at least 1".into()));
        }

        if self.default_account.is_empty() {
            if let Some(first) = self.accounts.keys().next() {
                self.default_account = first.clone();
            }
        } else if !self.accounts.contains_key(&self.default_account) {
            return Err(Error::InvalidInput(format!(
                "default account '{}' not found in accounts",
                self.default_account
            )));
        }
        Ok(())
    }

    /// Resolve an account by name, falling back to the default account.
    pub fn get_account<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a AccountConfig)> {
        let name = match name {
            Some(n) => n,
            None if !self.default_account.is_empty() => self.default_account.as_str(),
            None => {
                return Err(Error::NotFound(
                    "no account specified and no default account configured".into(),
                ))
            }
        };
        self.accounts
            .get(name)
            .map(|a| (name, a))
            .ok_or_else(|| Error::NotFound(format!("account '{name}' not found")))
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_account: work
accounts:
  work:
    protocol: imap
    imap: { host: mail.example.com, username: alice }
    smtp: { host: mail.example.com, username: alice }
    from: { address: alice@example.com, name: Alice }
cache:
  window_days: 14
send:
  rate_limit: 5
  blocked_recipients: [spam@example.com]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.default_account, "work");
        let (_, account) = cfg.get_account(None).unwrap();
        assert_eq!(account.imap.as_ref().unwrap().port, 993);
        assert!(account.imap.as_ref().unwrap().ssl);
        assert_eq!(account.smtp.as_ref().unwrap().port, 587);
        assert_eq!(cfg.cache.window_days, 14);
        assert_eq!(cfg.cache.inbox_freshness_min, 5);
        assert_eq!(cfg.send.rate_limit, 5);
        assert!(cfg.send.require_confirmation);
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = "default_account: ''\nbogus_key: 1\n";
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn imap_protocol_requires_smtp_section() {
        let raw = r#"
accounts:
  a:
    protocol: imap
    imap: { host: h, username: u }
    from: { address: a@b.c }
"#;
        let err = Config::parse(raw).unwrap_err();
        assert!(err.to_string().contains("smtp"));
    }

    #[test]
    fn gmail_protocol_requires_oauth() {
        let raw = r#"
accounts:
  g:
    protocol: gmail
    from: { address: g@gmail.com }
"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn first_account_becomes_default() {
        let raw = r#"
accounts:
  only:
    protocol: gmail
    oauth: { client_id_file: /tmp/creds.json }
    from: { address: o@gmail.com }
"#;
        let cfg = Config::parse(raw).unwrap();
        assert_eq!(cfg.default_account, "only");
    }

    #[test]
    fn unknown_account_is_not_found() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert!(matches!(
            cfg.get_account(Some("nope")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn window_days_bounds_enforced() {
        let raw = "cache:\n  window_days: 400\n";
        assert!(Config::parse(raw).is_err());
    }
}
