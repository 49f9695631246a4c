//! Per-user workflows over the admin API, the account store and CardDAV.
//!
//! The controller is built from explicit collaborators; nothing here reads
//! global configuration. Bulk dump/restore/clear live in [`bulk`].

pub mod bulk;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::accounts::{generate_password, AccountStore};
use crate::admin::{AdminApi, Book, Response, StatusResponse, User};
use crate::card::Contact;
use crate::dav::{
    AddressBookClient, DigestSession, HttpSettings, HttpTransport, ScanHit, Transport,
};
use crate::error::{Error, Result};
use crate::token::{self, BookPath};

pub use bulk::{ClearSummary, Dump, RestoreSummary, UserDump};

/// Default number of concurrently running bulk workers.
pub const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_workers: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Outcome of a controller operation, rendered by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct Reply<T> {
    pub success: bool,
    pub request: String,
    pub message: String,
    pub result: T,
}

impl<T> Reply<T> {
    pub fn new(request: impl Into<String>, message: impl Into<String>, result: T) -> Self {
        Self {
            success: true,
            request: request.into(),
            message: message.into(),
            result,
        }
    }
}

// ============================================================================
// CardDAV connections
// ============================================================================

/// Creates one exclusively owned CardDAV client per user.
pub trait DavConnector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    fn connect(
        &self,
        username: &str,
        password: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<AddressBookClient<Self::Transport>>;
}

/// Connector for a real server; clients share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpDavConnector {
    client: reqwest::Client,
    base: Url,
}

impl HttpDavConnector {
    /// `dav_url` is the DAV root, e.g. `https://dav.example.org/dav.php`.
    pub fn new(dav_url: Url, settings: &HttpSettings) -> Result<Self> {
        Ok(Self {
            client: settings.client()?,
            base: dav_url,
        })
    }
}

impl DavConnector for HttpDavConnector {
    type Transport = HttpTransport;

    fn connect(
        &self,
        username: &str,
        password: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<AddressBookClient<HttpTransport>> {
        let transport = HttpTransport::with_client(&self.base, self.client.clone());
        let mut session = DigestSession::new(transport, username, password);
        if let Some(cancel) = cancel {
            session = session.with_cancellation(cancel);
        }
        Ok(AddressBookClient::new(session, self.base.path()))
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct Controller<A, S, D> {
    admin: Arc<A>,
    accounts: Arc<S>,
    connector: Arc<D>,
    pool: PoolSettings,
    cancel: CancellationToken,
}

impl<A, S, D> Controller<A, S, D>
where
    A: AdminApi + 'static,
    S: AccountStore + 'static,
    D: DavConnector,
{
    pub fn new(admin: A, accounts: S, connector: D, pool: PoolSettings) -> Self {
        Self {
            admin: Arc::new(admin),
            accounts: Arc::new(accounts),
            connector: Arc::new(connector),
            pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token aborts every in-flight CardDAV request.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn admin(&self) -> &A {
        &self.admin
    }

    pub fn accounts(&self) -> &S {
        &self.accounts
    }

    /// Resolve the password of `username` and open a client for it.
    async fn client(&self, username: &str) -> Result<AddressBookClient<D::Transport>> {
        let password = self
            .accounts
            .get_password(username)
            .await?
            .ok_or_else(|| Error::Configuration(format!("no password for user {}", username)))?;
        self.connector
            .connect(username, &password, Some(self.cancel.child_token()))
    }

    // ========================================================================
    // Users and accounts
    // ========================================================================

    pub async fn users(&self) -> Result<Reply<Vec<User>>> {
        let users = self.admin.users().await?;
        Ok(Reply::new("users", format!("{} users", users.len()), users))
    }

    /// One server user, or `None` when no such user exists.
    pub async fn user(&self, username: &str) -> Result<Reply<Option<User>>> {
        let user = self
            .admin
            .users()
            .await?
            .into_iter()
            .find(|u| u.username == username);
        let message = match user {
            Some(_) => format!("found {}", username),
            None => format!("not found: {}", username),
        };
        Ok(Reply::new(format!("get user: {}", username), message, user))
    }

    /// Create a server user and store its password; a random one when `None`.
    pub async fn add_user(
        &self,
        username: &str,
        display: Option<&str>,
        password: Option<&str>,
    ) -> Result<Reply<User>> {
        let display = display.filter(|d| !d.is_empty()).unwrap_or(username);
        let password = match password.filter(|p| !p.is_empty()) {
            Some(password) => password.to_string(),
            None => generate_password(),
        };
        let user = self.admin.add_user(username, display, &password).await?;
        self.accounts.set_password(username, &password).await?;
        info!(username, "added user");
        Ok(Reply::new(
            format!("add user: {}", username),
            format!("added user {}", username),
            user,
        ))
    }

    /// Delete the server user and its stored password.
    pub async fn delete_user(&self, username: &str) -> Result<Reply<Response>> {
        let response = self.admin.delete_user(username).await?;
        self.accounts.delete_password(username).await?;
        info!(username, "deleted user");
        Ok(Reply::new(
            format!("delete user: {}", username),
            format!("deleted user {}", username),
            response,
        ))
    }

    pub async fn password(&self, username: &str) -> Result<Reply<Option<String>>> {
        let password = self.accounts.get_password(username).await?;
        let message = match password {
            Some(_) => format!("password for {}", username),
            None => format!("not found: {}", username),
        };
        Ok(Reply::new(format!("get password: {}", username), message, password))
    }

    /// Store a new password for `username` (random when `None`) and return it.
    pub async fn set_password(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Reply<String>> {
        let password = match password.filter(|p| !p.is_empty()) {
            Some(password) => password.to_string(),
            None => generate_password(),
        };
        self.accounts.set_password(username, &password).await?;
        Ok(Reply::new(
            format!("set password: {}", username),
            format!("password updated for {}", username),
            password,
        ))
    }

    pub async fn accounts_list(&self) -> Result<Reply<BTreeMap<String, String>>> {
        let accounts = self.accounts.list_accounts().await?;
        Ok(Reply::new(
            "accounts",
            format!("{} accounts", accounts.len()),
            accounts,
        ))
    }

    /// Replace or add every given account entry.
    pub async fn set_accounts(
        &self,
        accounts: BTreeMap<String, String>,
    ) -> Result<Reply<BTreeMap<String, String>>> {
        for (username, password) in &accounts {
            self.accounts.set_password(username, password).await?;
        }
        self.accounts_list().await
    }

    // ========================================================================
    // Books
    // ========================================================================

    /// Books of `username` as seen over CardDAV, with contact counts.
    pub async fn books(&self, username: &str) -> Result<Reply<Vec<Book>>> {
        let mut client = self.client(username).await?;
        let mut books = Vec::new();
        for listed in client.list().await? {
            let parsed = BookPath::parse(&listed.path)?;
            let contacts = client.addresses(&listed.path).await?.len();
            books.push(Book {
                username: parsed.username,
                bookname: parsed.bookname,
                description: listed
                    .description
                    .or(listed.display_name)
                    .unwrap_or_default(),
                contacts,
                token: parsed.token,
                uri: listed.path,
            });
        }
        Ok(Reply::new(
            format!("books: {}", username),
            format!("{} books", books.len()),
            books,
        ))
    }

    pub async fn add_book(
        &self,
        username: &str,
        bookname: &str,
        description: &str,
    ) -> Result<Reply<Book>> {
        if token::is_default_book(bookname) {
            return Err(Error::InvalidArgument(format!(
                "book name '{}' is reserved",
                bookname
            )));
        }
        let description = match description.trim() {
            "" => bookname,
            _ => description,
        };
        let book = self.admin.add_book(username, bookname, description).await?;
        info!(username, bookname, "added book");
        Ok(Reply::new(
            format!("add book: {}/{}", username, bookname),
            format!("added book {}", bookname),
            book,
        ))
    }

    pub async fn delete_book(&self, username: &str, bookname: &str) -> Result<Reply<Response>> {
        let token = token::encode(username, bookname);
        let response = self.admin.delete_book(username, &token).await?;
        info!(username, bookname, "deleted book");
        Ok(Reply::new(
            format!("delete book: {}/{}", username, bookname),
            format!("deleted book {}", bookname),
            response,
        ))
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    pub async fn addresses(&self, username: &str, bookname: &str) -> Result<Reply<Vec<Contact>>> {
        let mut client = self.client(username).await?;
        let path = client.book_uri(bookname);
        let contacts = client.addresses(&path).await?;
        Ok(Reply::new(
            format!("addresses: {}/{}", username, bookname),
            format!("{} addresses", contacts.len()),
            contacts,
        ))
    }

    pub async fn add_address(
        &self,
        username: &str,
        bookname: &str,
        email: &str,
        name: Option<&str>,
    ) -> Result<Reply<Contact>> {
        let mut client = self.client(username).await?;
        let contact = client.add_address(bookname, email, name).await?;
        Ok(Reply::new(
            format!("add address: {}/{}/{}", username, bookname, email),
            format!("added {}", email),
            contact,
        ))
    }

    pub async fn delete_address(
        &self,
        username: &str,
        bookname: &str,
        email: &str,
    ) -> Result<Reply<Vec<Contact>>> {
        let mut client = self.client(username).await?;
        let deleted = client.delete_address(bookname, email).await?;
        let message = if deleted.is_empty() {
            format!("not found: {}", email)
        } else {
            format!("deleted {}", email)
        };
        Ok(Reply::new(
            format!("delete address: {}/{}/{}", username, bookname, email),
            message,
            deleted,
        ))
    }

    pub async fn query_address(
        &self,
        username: &str,
        bookname: &str,
        email: &str,
    ) -> Result<Reply<Vec<Contact>>> {
        let mut client = self.client(username).await?;
        let found = client.query_address(bookname, email).await?;
        let message = if found.is_empty() {
            format!("not found: {}", email)
        } else {
            format!("found {}", email)
        };
        Ok(Reply::new(
            format!("query address: {}/{}/{}", username, bookname, email),
            message,
            found,
        ))
    }

    /// Books of `username` containing `email`.
    pub async fn scan_address(&self, username: &str, email: &str) -> Result<Reply<Vec<ScanHit>>> {
        let mut client = self.client(username).await?;
        let hits = client.scan_address(email).await?;
        let message = if hits.is_empty() {
            format!("not found: {}", email)
        } else {
            format!("found {} in {} books", email, hits.len())
        };
        Ok(Reply::new(
            format!("scan address: {}/{}", username, email),
            message,
            hits,
        ))
    }

    // ========================================================================
    // Server
    // ========================================================================

    pub async fn status(&self) -> Result<Reply<StatusResponse>> {
        let status = self.admin.status().await?;
        Ok(Reply::new("status", status.response.message.clone(), status))
    }

    pub async fn uptime(&self) -> Result<Reply<Response>> {
        passthrough("uptime", self.admin.uptime().await?)
    }

    pub async fn initialize(&self) -> Result<Reply<Response>> {
        passthrough("initialize", self.admin.initialize().await?)
    }

    pub async fn reset(&self) -> Result<Reply<Response>> {
        passthrough("reset", self.admin.reset().await?)
    }

    pub async fn shutdown(&self) -> Result<Reply<Response>> {
        passthrough("shutdown", self.admin.shutdown().await?)
    }
}

fn passthrough(request: &str, response: Response) -> Result<Reply<Response>> {
    Ok(Reply::new(request, response.message.clone(), response))
}
