//! HTTP Digest authentication session.
//!
//! `DigestSession` wraps a `Transport` and turns `401 Unauthorized` responses
//! carrying a `WWW-Authenticate: Digest ...` challenge into authorized retries.
//! Once a challenge is held, every request is authorized pre-emptively with a
//! strictly increasing nonce count. A session is owned by exactly one actor:
//! it is not `Clone` and `send` takes `&mut self`.

use std::str::FromStr;

use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, StatusCode};
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DavRequest, DavResponse, Transport};
use crate::error::{Error, Result};

/// Hash algorithms a server may name in its challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

/// Parses the `algorithm` challenge parameter (case-insensitive).
impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(Algorithm::Md5),
            "MD5-SESS" => Ok(Algorithm::Md5Sess),
            "SHA-256" => Ok(Algorithm::Sha256),
            "SHA-256-SESS" => Ok(Algorithm::Sha256Sess),
            _ => Err(Error::Protocol(format!("unsupported digest algorithm: {}", s))),
        }
    }
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    /// Lowercase hex digest of `input`.
    pub fn hash(&self, input: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => format!("{:x}", Md5::digest(input.as_bytes())),
            Algorithm::Sha256 | Algorithm::Sha256Sess => {
                format!("{:x}", Sha256::digest(input.as_bytes()))
            }
        }
    }
}

/// The parameters of a parsed `WWW-Authenticate: Digest` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Algorithm,
    pub stale: bool,
}

/// Parse a single `WWW-Authenticate` value.
pub fn parse_challenge(header: &str) -> Result<DigestChallenge> {
    let header = header.trim();
    let (scheme, rest) = header
        .split_once(char::is_whitespace)
        .unwrap_or((header, ""));
    if !scheme.eq_ignore_ascii_case("digest") {
        return Err(Error::Protocol(format!(
            "auth header is not Digest: {}",
            scheme
        )));
    }

    let mut realm = None;
    let mut nonce = None;
    let mut opaque = None;
    let mut qop = None;
    let mut algorithm = Algorithm::Md5;
    let mut stale = false;

    for (key, value) in parse_params(rest)? {
        match key.as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "opaque" => opaque = Some(value),
            "qop" => qop = Some(value),
            "algorithm" => {
                algorithm = value.parse()?;
            }
            "stale" => stale = value.eq_ignore_ascii_case("true"),
            other => debug!("ignoring digest challenge parameter {}", other),
        }
    }

    let nonce = nonce.ok_or_else(|| Error::Protocol("digest challenge without nonce".into()))?;
    let realm = realm.ok_or_else(|| Error::Protocol("digest challenge without realm".into()))?;
    if let Some(qop) = &qop {
        // only qop=auth is implemented
        if qop != "auth" {
            return Err(Error::Protocol(format!("unsupported digest qop: {}", qop)));
        }
    }

    Ok(DigestChallenge {
        realm,
        nonce,
        opaque,
        qop,
        algorithm,
        stale,
    })
}

/// Split `key=value, key="quoted, value"` into lowercase keys and unescaped values.
fn parse_params(input: &str) -> Result<Vec<(String, String)>> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(Error::Protocol(format!(
                "malformed digest challenge parameter: {}",
                key
            )));
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(Error::Protocol(format!(
                    "unterminated quoted value for {}",
                    key
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.push((key.to_ascii_lowercase(), value));
    }

    Ok(params)
}

/// Externally visible phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No challenge received yet; requests go out bare.
    Unchallenged,
    /// A challenge is held but no request has been authorized with it.
    Challenged,
    /// Requests are being authorized under the current challenge.
    Authorizing,
}

/// Per-challenge state: the server's parameters plus our nonce bookkeeping.
#[derive(Debug, Clone)]
struct Challenge {
    params: DigestChallenge,
    cnonce: String,
    nonce_count: u32,
    ha1: String,
}

impl Challenge {
    fn new(params: DigestChallenge, username: &str, password: &str, cnonce: String) -> Self {
        let algorithm = params.algorithm;
        let mut ha1 = algorithm.hash(&format!("{}:{}:{}", username, params.realm, password));
        if algorithm.is_session() {
            ha1 = algorithm.hash(&format!("{}:{}:{}", ha1, params.nonce, cnonce));
        }
        Self {
            params,
            cnonce,
            nonce_count: 0,
            ha1,
        }
    }

    /// Response digest for the current nonce count.
    fn response(&self, method: &Method, uri: &str) -> String {
        let algorithm = self.params.algorithm;
        let ha2 = algorithm.hash(&format!("{}:{}", method.as_str(), uri));
        match &self.params.qop {
            Some(qop) => algorithm.hash(&format!(
                "{}:{}:{:08x}:{}:{}:{}",
                self.ha1, self.params.nonce, self.nonce_count, self.cnonce, qop, ha2
            )),
            None => algorithm.hash(&format!("{}:{}:{}", self.ha1, self.params.nonce, ha2)),
        }
    }

    fn header(&self, username: &str, method: &Method, uri: &str) -> String {
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            quote(username),
            quote(&self.params.realm),
            quote(&self.params.nonce),
            quote(uri),
            self.params.algorithm.name(),
            self.response(method, uri),
        );
        if let Some(opaque) = &self.params.opaque {
            header.push_str(&format!(", opaque=\"{}\"", quote(opaque)));
        }
        if let Some(qop) = &self.params.qop {
            header.push_str(&format!(
                ", qop={}, nc={:08x}, cnonce=\"{}\"",
                qop, self.nonce_count, self.cnonce
            ));
        }
        header
    }
}

#[derive(Debug)]
enum State {
    Unchallenged,
    Challenged(Challenge),
    Authorizing(Challenge),
}

/// Digest authentication over an owned transport.
pub struct DigestSession<T> {
    transport: T,
    username: String,
    password: String,
    state: State,
    cancel: Option<CancellationToken>,
}

impl<T: Transport> DigestSession<T> {
    pub fn new(transport: T, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            transport,
            username: username.into(),
            password: password.into(),
            state: State::Unchallenged,
            cancel: None,
        }
    }

    /// Abort in-flight and future requests when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            State::Unchallenged => SessionState::Unchallenged,
            State::Challenged(_) => SessionState::Challenged,
            State::Authorizing(_) => SessionState::Authorizing,
        }
    }

    /// Nonce count of the last authorized request under the current challenge.
    pub fn nonce_count(&self) -> u32 {
        match &self.state {
            State::Unchallenged => 0,
            State::Challenged(c) | State::Authorizing(c) => c.nonce_count,
        }
    }

    /// Send a request, answering at most one challenge.
    pub async fn send(&mut self, request: DavRequest) -> Result<DavResponse> {
        let method = request.method.clone();
        let path = request.path.clone();

        let response = self.dispatch(request.clone()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.accept_challenge(&response)?;
        let response = self.dispatch(request).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                username: self.username.clone(),
                detail: format!("{} {} rejected after re-challenge", method, path),
            });
        }
        Ok(response)
    }

    async fn dispatch(&mut self, mut request: DavRequest) -> Result<DavResponse> {
        if let Some(header) = self.authorize(&request.method, &request.path) {
            let value = HeaderValue::from_str(&header).map_err(|err| {
                Error::Protocol(format!("cannot encode authorization header: {}", err))
            })?;
            request.headers.insert(AUTHORIZATION, value);
        }
        debug!(method = %request.method, path = %request.path, "dav request");

        let pending = self.transport.send(request);
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::Cancelled),
                    result = pending => result,
                }
            }
            None => pending.await,
        }
    }

    /// Build the `Authorization` value for the next request, if a challenge is held.
    fn authorize(&mut self, method: &Method, uri: &str) -> Option<String> {
        let mut challenge = match std::mem::replace(&mut self.state, State::Unchallenged) {
            State::Unchallenged => return None,
            State::Challenged(c) | State::Authorizing(c) => c,
        };
        challenge.nonce_count += 1;
        let header = challenge.header(&self.username, method, uri);
        self.state = State::Authorizing(challenge);
        Some(header)
    }

    fn accept_challenge(&mut self, response: &DavResponse) -> Result<()> {
        let values: Vec<&str> = response
            .headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            return Err(Error::Protocol(format!(
                "received {} without WWW-Authenticate header",
                response.status
            )));
        }
        let header = values
            .iter()
            .find(|v| {
                v.trim_start()
                    .get(..6)
                    .is_some_and(|s| s.eq_ignore_ascii_case("digest"))
            })
            .ok_or_else(|| Error::Protocol(format!("auth header not Digest: {}", values[0])))?;

        let params = parse_challenge(header)?;
        debug!(realm = %params.realm, stale = params.stale, "accepted digest challenge");
        self.state = State::Challenged(Challenge::new(
            params,
            &self.username,
            &self.password,
            client_nonce(),
        ));
        Ok(())
    }
}

/// 16 bytes from the OS CSPRNG, hex encoded.
fn client_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
