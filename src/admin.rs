//! Client for the administrative REST API in front of the CardDAV server.
//!
//! The API speaks JSON over HTTPS, authenticates every request with the
//! `X-Api-Key`, `X-Admin-Username` and `X-Admin-Password` headers, and may
//! require a client certificate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use http::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::dav::HttpSettings;
use crate::error::{Error, Result};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    pub displayname: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Book {
    pub username: String,
    pub bookname: String,
    pub description: String,
    pub contacts: usize,
    pub token: String,
    pub uri: String,
}

/// Envelope carried by every admin API response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub request: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub response: Response,
    pub status: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UsersResponse {
    users: Vec<User>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BooksResponse {
    books: Vec<Book>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddUserResponse {
    user: User,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddBookResponse {
    book: Book,
}

// ============================================================================
// Trait
// ============================================================================

/// Operations of the admin API the controller depends on.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn initialize(&self) -> Result<Response>;
    async fn reset(&self) -> Result<Response>;
    async fn status(&self) -> Result<StatusResponse>;
    async fn uptime(&self) -> Result<Response>;
    async fn shutdown(&self) -> Result<Response>;

    async fn users(&self) -> Result<Vec<User>>;
    /// Books of one user, or of every user when `username` is `None`.
    async fn books(&self, username: Option<&str>) -> Result<Vec<Book>>;

    async fn add_user(&self, username: &str, display: &str, password: &str) -> Result<User>;
    async fn delete_user(&self, username: &str) -> Result<Response>;
    async fn add_book(&self, username: &str, bookname: &str, description: &str) -> Result<Book>;
    async fn delete_book(&self, username: &str, token: &str) -> Result<Response>;
}

// ============================================================================
// HTTP client
// ============================================================================

/// Connection parameters for `AdminClient`.
#[derive(Debug, Clone)]
pub struct AdminSettings {
    /// Base URL, e.g. `https://dav.example.org:4443/bcc`.
    pub url: String,
    pub api_key: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AdminClient {
    client: reqwest::Client,
    base: String,
    api_key: String,
    username: String,
    password: String,
}

impl AdminClient {
    pub fn new(settings: &AdminSettings, http: &HttpSettings) -> Result<Self> {
        Ok(Self::with_client(settings, http.client()?))
    }

    pub fn with_client(settings: &AdminSettings, client: reqwest::Client) -> Self {
        Self {
            client,
            base: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        self.call(Method::GET, path, None).await
    }

    pub async fn post<R: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<R> {
        self.call(Method::POST, path, body).await
    }

    pub async fn delete<R: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<R> {
        self.call(Method::DELETE, path, body).await
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<R> {
        debug!(%method, path, "admin request");
        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base, path))
            .header("X-Api-Key", &self.api_key)
            .header("X-Admin-Username", &self.username)
            .header("X-Admin-Password", &self.password);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::Admin {
                method: method.to_string(),
                path: path.to_string(),
                status,
                body: pretty_if_json(&text),
            });
        }

        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text).map_err(|err| {
            Error::Protocol(format!("cannot decode {} {} response: {}\n{}", method, path, err, text))
        })
    }
}

/// Pretty-print `body` when it is JSON, otherwise return it unchanged.
pub fn pretty_if_json(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| body.to_string())
}

fn user_path(prefix: &str, username: &str) -> String {
    format!("/{}/{}/", prefix, urlencoding::encode(username))
}

#[async_trait]
impl AdminApi for AdminClient {
    async fn initialize(&self) -> Result<Response> {
        self.post("/initialize/", None).await
    }

    async fn reset(&self) -> Result<Response> {
        self.post("/reset/", None).await
    }

    async fn status(&self) -> Result<StatusResponse> {
        self.get("/status/").await
    }

    async fn uptime(&self) -> Result<Response> {
        self.get("/uptime/").await
    }

    async fn shutdown(&self) -> Result<Response> {
        self.post("/shutdown/", None).await
    }

    async fn users(&self) -> Result<Vec<User>> {
        let response: UsersResponse = self.get("/users/").await?;
        Ok(response.users)
    }

    async fn books(&self, username: Option<&str>) -> Result<Vec<Book>> {
        let path = match username {
            Some(username) => user_path("books", username),
            None => "/books/".to_string(),
        };
        let response: BooksResponse = self.get(&path).await?;
        Ok(response.books)
    }

    async fn add_user(&self, username: &str, display: &str, password: &str) -> Result<User> {
        let body = json!({
            "username": username,
            "displayname": display,
            "password": password,
        });
        let response: AddUserResponse = self.post("/user/", Some(body)).await?;
        Ok(response.user)
    }

    async fn delete_user(&self, username: &str) -> Result<Response> {
        self.delete("/user/", Some(json!({ "username": username }))).await
    }

    async fn add_book(&self, username: &str, bookname: &str, description: &str) -> Result<Book> {
        let body = json!({
            "username": username,
            "bookname": bookname,
            "description": description,
        });
        let response: AddBookResponse = self.post("/book/", Some(body)).await?;
        Ok(response.book)
    }

    async fn delete_book(&self, username: &str, token: &str) -> Result<Response> {
        self.delete("/book/", Some(json!({ "username": username, "token": token })))
            .await
    }
}
