//! Credential retrieval.
//!
//! IMAP/SMTP passwords are looked up in order: system keyring, then
//! `password_cmd` stdout, then `password_file` (which must be mode 0600).

use std::time::Duration;

use tracing::warn;

use crate::config::AccountConfig;
use crate::errors::{Error, Result};

pub const KEYRING_SERVICE: &str = "clerk";

const PASSWORD_CMD_TIMEOUT: Duration = Duration::from_secs(10);

/// Abstract secret backend so tests can run without a system keyring.
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, account: &str) -> Option<String>;
    fn set(&self, service: &str, account: &str, value: &str) -> Result<()>;
    fn delete(&self, service: &str, account: &str);
}

/// System keyring backend.
pub struct KeyringStore;

impl SecretStore for KeyringStore {
    fn get(&self, service: &str, account: &str) -> Option<String> {
        let entry = keyring::Entry::new(service, account).ok()?;
        match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(service, account, error = %e, "Keyring read failed");
                None
            }
        }
    }

    fn set(&self, service: &str, account: &str, value: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|e| Error::Auth(format!("keyring entry: {e}")))?;
        entry
            .set_password(value)
            .map_err(|e| Error::Auth(format!("keyring write: {e}")))
    }

    fn delete(&self, service: &str, account: &str) {
        if let Ok(entry) = keyring::Entry::new(service, account) {
            let _ = entry.delete_password();
        }
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<std::collections::HashMap<(String, String), String>>,
}

impl SecretStore for MemoryStore {
    fn get(&self, service: &str, account: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(&(service.to_string(), account.to_string()))
            .cloned()
    }

    fn set(&self, service: &str, account: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert((service.to_string(), account.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(service.to_string(), account.to_string()));
    }
}

/// Resolve the password for an account using the configured fallback chain.
pub async fn account_password(
    account_name: &str,
    account: &AccountConfig,
    secrets: &dyn SecretStore,
) -> Result<String> {
    if let Some(password) = secrets.get(KEYRING_SERVICE, account_name) {
        return Ok(password);
    }

    if let Some(cmd) = &account.password_cmd {
        return run_password_cmd(cmd).await;
    }

    if let Some(path) = &account.password_file {
        return read_password_file(path);
    }

    Err(Error::Auth(format!(
        "no password configured for account '{account_name}' (keyring, password_cmd or password_file)"
    )))
}

async fn run_password_cmd(cmd: &str) -> Result<String> {
    let output = tokio::time::timeout(
        PASSWORD_CMD_TIMEOUT,
        tokio::process::Command::new("sh").arg("-c").arg(cmd).output(),
    )
    .await
    .map_err(|_| Error::Auth("password command timed out".into()))?
    .map_err(|e| Error::Auth(format!("password command failed to run: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Auth(format!(
            "password command exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn read_password_file(path: &std::path::Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .map_err(|_| Error::Auth(format!("password file not found: {}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o777;
        if mode != 0o600 {
            return Err(Error::Auth(format!(
                "password file {} has insecure permissions {mode:o}, expected 600",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Auth(format!("reading password file: {e}")))?;
    Ok(raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FromAddress, Protocol};
    use std::io::Write;

    fn account_with(cmd: Option<&str>, file: Option<std::path::PathBuf>) -> AccountConfig {
        AccountConfig {
            protocol: Protocol::Imap,
            imap: None,
            smtp: None,
            oauth: None,
            from: FromAddress {
                address: "a@example.com".into(),
                name: String::new(),
            },
            password_cmd: cmd.map(|c| c.to_string()),
            password_file: file,
        }
    }

    #[tokio::test]
    async fn keyring_takes_precedence() {
        let secrets = MemoryStore::default();
        secrets.set(KEYRING_SERVICE, "acct", "hunter2").unwrap();
        let account = account_with(Some("echo nope"), None);
        let got = account_password("acct", &account, &secrets).await.unwrap();
        assert_eq!(got, "hunter2");
    }

    #[tokio::test]
    async fn password_cmd_output_is_trimmed() {
        let secrets = MemoryStore::default();
        let account = account_with(Some("printf ' secret \\n'"), None);
        let got = account_password("acct", &account, &secrets).await.unwrap();
        assert_eq!(got, "secret");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn password_file_requires_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pw");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "filepass").unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let secrets = MemoryStore::default();
        let account = account_with(None, Some(path.clone()));
        assert!(matches!(
            account_password("acct", &account, &secrets).await,
            Err(Error::Auth(_))
        ));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        let got = account_password("acct", &account, &secrets).await.unwrap();
        assert_eq!(got, "filepass");
    }

    #[tokio::test]
    async fn missing_everything_is_auth_error() {
        let secrets = MemoryStore::default();
        let account = account_with(None, None);
        assert!(matches!(
            account_password("acct", &account, &secrets).await,
            Err(Error::Auth(_))
        ));
    }
}
