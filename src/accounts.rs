//! Account store: `username -> password` for the CardDAV accounts.
//!
//! Digest authentication needs each user's clear-text password, so the tool
//! keeps them either behind the admin API or in a local flat file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http::StatusCode;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::admin::AdminClient;
use crate::error::{Error, Result};

/// Random bytes in a generated password (hex encoded, so twice as many characters).
pub const PASSWORD_BYTES: usize = 12;

/// A new random password from the OS CSPRNG.
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_password(&self, username: &str) -> Result<Option<String>>;
    async fn set_password(&self, username: &str, password: &str) -> Result<()>;
    /// Returns whether an entry was removed.
    async fn delete_password(&self, username: &str) -> Result<bool>;
    async fn list_accounts(&self) -> Result<BTreeMap<String, String>>;
}

#[async_trait]
impl<T: AccountStore + ?Sized> AccountStore for Box<T> {
    async fn get_password(&self, username: &str) -> Result<Option<String>> {
        (**self).get_password(username).await
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<()> {
        (**self).set_password(username, password).await
    }

    async fn delete_password(&self, username: &str) -> Result<bool> {
        (**self).delete_password(username).await
    }

    async fn list_accounts(&self) -> Result<BTreeMap<String, String>> {
        (**self).list_accounts().await
    }
}

// ============================================================================
// Admin API backed store
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccountResponse {
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccountsResponse {
    accounts: BTreeMap<String, String>,
}

/// Passwords held by the admin API (`/password/<u>/` and `/accounts/`).
#[derive(Debug, Clone)]
pub struct HttpAccountStore {
    admin: AdminClient,
}

impl HttpAccountStore {
    pub fn new(admin: AdminClient) -> Self {
        Self { admin }
    }

    fn password_path(username: &str) -> String {
        format!("/password/{}/", urlencoding::encode(username))
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Admin { status, .. } if *status == StatusCode::NOT_FOUND)
}

#[async_trait]
impl AccountStore for HttpAccountStore {
    async fn get_password(&self, username: &str) -> Result<Option<String>> {
        match self
            .admin
            .get::<AccountResponse>(&Self::password_path(username))
            .await
        {
            Ok(response) if response.password.is_empty() => Ok(None),
            Ok(response) => Ok(Some(response.password)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let mut accounts = serde_json::Map::new();
        accounts.insert(username.to_string(), json!(password));
        let body = json!({ "accounts": accounts });
        let _: serde_json::Value = self.admin.post("/accounts/", Some(body)).await?;
        Ok(())
    }

    async fn delete_password(&self, username: &str) -> Result<bool> {
        match self
            .admin
            .delete::<serde_json::Value>(&Self::password_path(username), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_accounts(&self) -> Result<BTreeMap<String, String>> {
        let response: AccountsResponse = self.admin.get("/accounts/").await?;
        Ok(response.accounts)
    }
}

// ============================================================================
// Flat file store
// ============================================================================

/// `username:password` lines in a local file.
#[derive(Debug)]
pub struct FileAccountStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        parse_passwd(&content).map_err(|err| match err {
            Error::Format(detail) => Error::Format(format!("{}: {}", self.path.display(), detail)),
            other => other,
        })
    }

    fn write(&self, accounts: &BTreeMap<String, String>) -> Result<()> {
        let content = render_passwd(accounts)?;
        write_atomic(&self.path, content.as_bytes())?;
        debug!(path = %self.path.display(), count = accounts.len(), "wrote account file");
        Ok(())
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn get_password(&self, username: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read()?.remove(username))
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut accounts = self.read()?;
        accounts.insert(username.to_string(), password.to_string());
        self.write(&accounts)
    }

    async fn delete_password(&self, username: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut accounts = self.read()?;
        if accounts.remove(username).is_none() {
            return Ok(false);
        }
        self.write(&accounts)?;
        Ok(true)
    }

    async fn list_accounts(&self) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock.lock().await;
        self.read()
    }
}

fn parse_passwd(content: &str) -> Result<BTreeMap<String, String>> {
    let mut accounts = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 2 {
            return Err(Error::Format(format!(
                "line {}: expected username:password",
                index + 1
            )));
        }
        accounts.insert(fields[0].to_string(), fields[1].to_string());
    }
    Ok(accounts)
}

fn render_passwd(accounts: &BTreeMap<String, String>) -> Result<String> {
    let mut content = String::new();
    for (username, password) in accounts {
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "empty username or password for '{}'",
                username
            )));
        }
        if username.contains(':') || password.contains(':') {
            return Err(Error::InvalidArgument(format!(
                "illegal ':' in account entry for '{}'",
                username
            )));
        }
        content.push_str(username);
        content.push(':');
        content.push_str(password);
        content.push('\n');
    }
    Ok(content)
}

/// Write through a temporary sibling and rename over `target`.
fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("passwd");
    let mut counter: u32 = 0;
    let temp_path = loop {
        let candidate = parent.join(format!(".{}.{}.tmp", name, counter));
        if !candidate.exists() {
            break candidate;
        }
        counter += 1;
    };

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o660);
        }
        let mut file = options.open(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    if let Err(err) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }
    Ok(())
}
