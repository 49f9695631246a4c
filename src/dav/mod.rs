//! CardDAV client stack.
//!
//! This module provides:
//! - `Transport` trait abstracting the physical HTTP layer
//! - `DigestSession`, the authentication state machine wrapping a transport
//! - `AddressBookClient`, the CardDAV operations built on a session
//! - XML bodies and multistatus parsing for the WebDAV exchanges

pub mod client;
pub mod digest;
pub mod transport;
pub mod xml;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::error::Result;

pub use client::{AddressBook, AddressBookClient, PropFilter, ScanHit};
pub use digest::{DigestSession, SessionState};
pub use transport::{HttpSettings, HttpTransport};

/// A request addressed by absolute path; the transport supplies scheme and host.
#[derive(Debug, Clone)]
pub struct DavRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl DavRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    /// Set a header; values built from our own constants and paths are always valid.
    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct DavResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl DavResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    /// First value of a header as text, if present and printable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The physical HTTP layer under a `DigestSession`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: DavRequest) -> Result<DavResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, request: DavRequest) -> Result<DavResponse> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: DavRequest) -> Result<DavResponse> {
        (**self).send(request).await
    }
}
