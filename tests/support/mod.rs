//! In-memory CardDAV server with Digest enforcement, plus fake admin API and
//! account store sharing its state.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, StatusCode};
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;

use mabctl::accounts::AccountStore;
use mabctl::admin::{AdminApi, Book, Response, StatusResponse, User};
use mabctl::card::Contact;
use mabctl::controller::{Controller, DavConnector, PoolSettings};
use mabctl::dav::{AddressBookClient, DavRequest, DavResponse, DigestSession, Transport};
use mabctl::error::{Error, Result};
use mabctl::token;

pub const ROOT: &str = "/dav.php";
const REALM: &str = "mabctl test";

// =============================================================================
// Server state
// =============================================================================

#[derive(Debug, Default)]
struct BookState {
    bookname: String,
    description: String,
    /// href -> (etag, card)
    cards: BTreeMap<String, (String, String)>,
}

#[derive(Debug, Default)]
struct UserState {
    password: String,
    display: String,
    /// token -> book
    books: BTreeMap<String, BookState>,
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<String, UserState>,
    /// nonce -> highest nc seen
    nonces: HashMap<String, u32>,
    issued: u64,
    etags: u64,
    requests: usize,
    fail_puts: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct DavServer {
    state: Mutex<State>,
}

impl DavServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of challenges issued so far.
    pub fn challenges(&self) -> u64 {
        self.state.lock().unwrap().issued
    }

    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    /// Make every PUT by `username` fail with 500.
    pub fn fail_puts_for(&self, username: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_puts
            .insert(username.to_string());
    }

    pub fn card_count(&self, username: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .users
            .get(username)
            .map(|u| u.books.values().map(|b| b.cards.len()).sum())
            .unwrap_or(0)
    }

    fn handle(&self, request: &DavRequest) -> DavResponse {
        let mut state = self.state.lock().unwrap();
        state.requests += 1;

        let username = match authenticate(&mut state, request) {
            Some(username) => username,
            None => return challenge(&mut state),
        };
        route(&mut state, &username, request)
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

fn challenge(state: &mut State) -> DavResponse {
    state.issued += 1;
    let nonce = format!("nonce-{}", state.issued);
    state.nonces.insert(nonce.clone(), 0);
    let mut response = DavResponse::new(StatusCode::UNAUTHORIZED);
    let value = format!(
        "Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\", algorithm=MD5, opaque=\"opaque-data\"",
        REALM, nonce
    );
    response
        .headers
        .insert(WWW_AUTHENTICATE, HeaderValue::from_str(&value).unwrap());
    response
}

fn authorization_params(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.strip_prefix("Digest ")?;
    let mut params = HashMap::new();
    for part in rest.split(", ") {
        let (key, value) = part.split_once('=')?;
        params.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
    }
    Some(params)
}

/// The authenticated user, or `None` when the request must be challenged.
fn authenticate(state: &mut State, request: &DavRequest) -> Option<String> {
    let header = request.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let params = authorization_params(header)?;
    let get = |key: &str| params.get(key).map(String::as_str).unwrap_or_default();

    let user = state.users.get(get("username"))?;
    if get("realm") != REALM || get("uri") != request.path || get("qop") != "auth" {
        return None;
    }
    if get("opaque") != "opaque-data" {
        return None;
    }
    let nc = u32::from_str_radix(get("nc"), 16).ok()?;
    let last = *state.nonces.get(get("nonce"))?;
    if nc <= last {
        return None;
    }

    let ha1 = md5_hex(&format!("{}:{}:{}", get("username"), REALM, user.password));
    let ha2 = md5_hex(&format!("{}:{}", request.method, request.path));
    let expected = md5_hex(&format!(
        "{}:{}:{}:{}:auth:{}",
        ha1,
        get("nonce"),
        get("nc"),
        get("cnonce"),
        ha2
    ));
    if expected != get("response") {
        return None;
    }
    let username = get("username").to_string();
    state.nonces.insert(get("nonce").to_string(), nc);
    Some(username)
}

// =============================================================================
// Routing
// =============================================================================

fn status(code: StatusCode) -> DavResponse {
    DavResponse::new(code)
}

fn multistatus(responses: &[String]) -> DavResponse {
    let mut response = DavResponse::new(StatusCode::MULTI_STATUS);
    response.body = format!(
        "<?xml version=\"1.0\"?>\n<d:multistatus xmlns:d=\"DAV:\" xmlns:card=\"urn:ietf:params:xml:ns:carddav\">{}</d:multistatus>",
        responses.concat()
    );
    response
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn prop_response(href: &str, props: &str) -> String {
    format!(
        "<d:response><d:href>{}</d:href><d:propstat><d:prop>{}</d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
        href, props
    )
}

/// `(property, value)` of the REPORT body's prop-filter, if any.
fn report_filter(body: &str) -> Option<(String, String)> {
    let start = body.find("prop-filter name=\"")? + "prop-filter name=\"".len();
    let name = &body[start..start + body[start..].find('"')?];
    let match_start = body.find("<card:text-match")?;
    let value_start = match_start + body[match_start..].find('>')? + 1;
    let value_end = value_start + body[value_start..].find("</card:text-match>")?;
    Some((name.to_string(), xml_unescape(&body[value_start..value_end])))
}

fn route(state: &mut State, username: &str, request: &DavRequest) -> DavResponse {
    let home = format!("{}/addressbooks/{}/", ROOT, username);
    let principal = format!("{}/principals/{}/", ROOT, username);
    let path = request.path.as_str();

    if request.method == Method::OPTIONS {
        let mut response = status(StatusCode::OK);
        response
            .headers
            .insert("dav", HeaderValue::from_static("1, 3, extended-mkcol, addressbook"));
        return response;
    }

    if request.method.as_str() == "PROPFIND" {
        if path == format!("{}/", ROOT) {
            return multistatus(&[prop_response(
                path,
                &format!("<d:current-user-principal><d:href>{}</d:href></d:current-user-principal>", principal),
            )]);
        }
        if path == principal {
            return multistatus(&[prop_response(
                path,
                &format!("<card:addressbook-home-set><d:href>{}</d:href></card:addressbook-home-set>", home),
            )]);
        }
        if path == home {
            let Some(user) = state.users.get(username) else {
                return status(StatusCode::NOT_FOUND);
            };
            let mut responses = vec![prop_response(
                &home,
                "<d:resourcetype><d:collection/></d:resourcetype>",
            )];
            for (token, book) in &user.books {
                responses.push(prop_response(
                    &format!("{}{}/", home, token),
                    &format!(
                        "<d:resourcetype><d:collection/><card:addressbook/></d:resourcetype><d:displayname>{}</d:displayname><card:addressbook-description>{}</card:addressbook-description>",
                        xml_escape(&book.bookname),
                        xml_escape(&book.description)
                    ),
                ));
            }
            return multistatus(&responses);
        }
        return status(StatusCode::FORBIDDEN);
    }

    let Some(rest) = path.strip_prefix(&home) else {
        return status(StatusCode::FORBIDDEN);
    };
    let (token, resource) = match rest.split_once('/') {
        Some((token, resource)) => (token.to_string(), resource.to_string()),
        None => return status(StatusCode::NOT_FOUND),
    };

    let fail_put = state.fail_puts.contains(username);
    state.etags += 1;
    let etag = format!("\"{}\"", state.etags);
    let Some(book) = state
        .users
        .get_mut(username)
        .and_then(|u| u.books.get_mut(&token))
    else {
        return status(StatusCode::NOT_FOUND);
    };

    match request.method.as_str() {
        "REPORT" if resource.is_empty() => {
            let filter = report_filter(&request.body);
            let mut responses = Vec::new();
            for (href, (etag, card)) in &book.cards {
                let Ok(contact) = Contact::parse(href, None, card) else {
                    continue;
                };
                let selected = match &filter {
                    None => true,
                    Some((name, value)) if name == "EMAIL" => contact.has_email(value),
                    Some((name, value)) if name == "UID" => contact.uid.eq_ignore_ascii_case(value),
                    Some(_) => false,
                };
                if selected {
                    responses.push(prop_response(
                        href,
                        &format!(
                            "<d:getetag>{}</d:getetag><card:address-data>{}</card:address-data>",
                            xml_escape(etag),
                            xml_escape(card)
                        ),
                    ));
                }
            }
            multistatus(&responses)
        }
        "PUT" if resource.ends_with(".vcf") => {
            if fail_put {
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            let exists = book.cards.contains_key(path);
            let if_none_match = request
                .headers
                .get("if-none-match")
                .is_some_and(|v| v.as_bytes() == b"*");
            if exists && if_none_match {
                return status(StatusCode::PRECONDITION_FAILED);
            }
            book.cards
                .insert(path.to_string(), (etag, request.body.clone()));
            status(StatusCode::CREATED)
        }
        "DELETE" if resource.ends_with(".vcf") => match book.cards.remove(path) {
            Some(_) => status(StatusCode::NO_CONTENT),
            None => status(StatusCode::NOT_FOUND),
        },
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    }
}

// =============================================================================
// Transport and connector
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerTransport {
    server: Arc<DavServer>,
}

#[async_trait]
impl Transport for ServerTransport {
    async fn send(&self, request: DavRequest) -> Result<DavResponse> {
        tokio::task::yield_now().await;
        Ok(self.server.handle(&request))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: Arc<DavServer>,
}

impl DavConnector for MemoryConnector {
    type Transport = ServerTransport;

    fn connect(
        &self,
        username: &str,
        password: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<AddressBookClient<ServerTransport>> {
        let transport = ServerTransport {
            server: self.server.clone(),
        };
        let mut session = DigestSession::new(transport, username, password);
        if let Some(cancel) = cancel {
            session = session.with_cancellation(cancel);
        }
        Ok(AddressBookClient::new(session, ROOT))
    }
}

// =============================================================================
// Admin API
// =============================================================================

#[derive(Debug, Clone)]
pub struct MemoryAdmin {
    server: Arc<DavServer>,
}

fn ok(request: &str) -> Response {
    Response {
        success: true,
        message: format!("{}: ok", request),
        request: request.to_string(),
    }
}

fn admin_error(method: &str, path: &str, status: StatusCode, message: &str) -> Error {
    Error::Admin {
        method: method.to_string(),
        path: path.to_string(),
        status,
        body: message.to_string(),
    }
}

fn book_record(username: &str, token: &str, book: &BookState) -> Book {
    Book {
        username: username.to_string(),
        bookname: book.bookname.clone(),
        description: book.description.clone(),
        contacts: book.cards.len(),
        token: token.to_string(),
        uri: token::token_uri(ROOT, username, token),
    }
}

#[async_trait]
impl AdminApi for MemoryAdmin {
    async fn initialize(&self) -> Result<Response> {
        Ok(ok("initialize"))
    }

    async fn reset(&self) -> Result<Response> {
        self.server.state.lock().unwrap().users.clear();
        Ok(ok("reset"))
    }

    async fn status(&self) -> Result<StatusResponse> {
        let users = self.server.state.lock().unwrap().users.len();
        Ok(StatusResponse {
            response: ok("status"),
            status: BTreeMap::from([("users".to_string(), users.to_string())]),
        })
    }

    async fn uptime(&self) -> Result<Response> {
        Ok(ok("uptime"))
    }

    async fn shutdown(&self) -> Result<Response> {
        Ok(ok("shutdown"))
    }

    async fn users(&self) -> Result<Vec<User>> {
        let state = self.server.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .map(|(username, user)| User {
                username: username.clone(),
                displayname: user.display.clone(),
                uri: format!("principals/{}", username),
            })
            .collect())
    }

    async fn books(&self, username: Option<&str>) -> Result<Vec<Book>> {
        let state = self.server.state.lock().unwrap();
        let mut books = Vec::new();
        for (name, user) in &state.users {
            if username.is_some_and(|u| u != name) {
                continue;
            }
            for (token, book) in &user.books {
                books.push(book_record(name, token, book));
            }
        }
        Ok(books)
    }

    async fn add_user(&self, username: &str, display: &str, password: &str) -> Result<User> {
        let mut state = self.server.state.lock().unwrap();
        if state.users.contains_key(username) {
            return Err(admin_error("POST", "/user/", StatusCode::CONFLICT, "user exists"));
        }
        let default = BookState {
            bookname: token::DEFAULT_TOKEN.to_string(),
            ..BookState::default()
        };
        state.users.insert(
            username.to_string(),
            UserState {
                password: password.to_string(),
                display: display.to_string(),
                books: BTreeMap::from([(token::DEFAULT_TOKEN.to_string(), default)]),
            },
        );
        Ok(User {
            username: username.to_string(),
            displayname: display.to_string(),
            uri: format!("principals/{}", username),
        })
    }

    async fn delete_user(&self, username: &str) -> Result<Response> {
        let mut state = self.server.state.lock().unwrap();
        match state.users.remove(username) {
            Some(_) => Ok(ok("delete user")),
            None => Err(admin_error("DELETE", "/user/", StatusCode::NOT_FOUND, "no such user")),
        }
    }

    async fn add_book(&self, username: &str, bookname: &str, description: &str) -> Result<Book> {
        let mut state = self.server.state.lock().unwrap();
        let Some(user) = state.users.get_mut(username) else {
            return Err(admin_error("POST", "/book/", StatusCode::NOT_FOUND, "no such user"));
        };
        let token = token::encode(username, bookname);
        if user.books.contains_key(&token) {
            return Err(admin_error("POST", "/book/", StatusCode::CONFLICT, "book exists"));
        }
        let book = user.books.entry(token.clone()).or_insert(BookState {
            bookname: bookname.to_string(),
            description: description.to_string(),
            cards: BTreeMap::new(),
        });
        Ok(book_record(username, &token, book))
    }

    async fn delete_book(&self, username: &str, token: &str) -> Result<Response> {
        let mut state = self.server.state.lock().unwrap();
        match state.users.get_mut(username).and_then(|u| u.books.remove(token)) {
            Some(_) => Ok(ok("delete book")),
            None => Err(admin_error("DELETE", "/book/", StatusCode::NOT_FOUND, "no such book")),
        }
    }
}

// =============================================================================
// Account store
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryAccounts {
    accounts: Arc<Mutex<BTreeMap<String, String>>>,
}

#[async_trait]
impl AccountStore for MemoryAccounts {
    async fn get_password(&self, username: &str) -> Result<Option<String>> {
        Ok(self.accounts.lock().unwrap().get(username).cloned())
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<()> {
        self.accounts
            .lock()
            .unwrap()
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn delete_password(&self, username: &str) -> Result<bool> {
        Ok(self.accounts.lock().unwrap().remove(username).is_some())
    }

    async fn list_accounts(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.accounts.lock().unwrap().clone())
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub type TestController = Controller<MemoryAdmin, MemoryAccounts, MemoryConnector>;

pub struct Fixture {
    pub server: Arc<DavServer>,
    pub accounts: MemoryAccounts,
    pub controller: TestController,
}

impl Fixture {
    pub fn new(max_workers: usize) -> Self {
        let server = DavServer::new();
        let accounts = MemoryAccounts::default();
        let controller = Controller::new(
            MemoryAdmin {
                server: server.clone(),
            },
            accounts.clone(),
            MemoryConnector {
                server: server.clone(),
            },
            PoolSettings { max_workers },
        );
        Self {
            server,
            accounts,
            controller,
        }
    }
}
