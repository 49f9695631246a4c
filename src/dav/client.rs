//! CardDAV operations for one user over one Digest session.

use http::{Method, StatusCode};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::xml::{self, Entry};
use super::{DavRequest, DavResponse, DigestSession, Transport};
use crate::card::{self, Contact};
use crate::error::{Error, Result};
use crate::token::{self, BookPath};

/// An address-book collection as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressBook {
    pub path: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

/// A single `prop-filter` with an `equals` text match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropFilter {
    pub name: String,
    pub value: String,
}

impl PropFilter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn email(value: &str) -> Self {
        Self::new("EMAIL", value)
    }

    pub fn uid(value: &str) -> Self {
        Self::new("UID", value)
    }
}

/// A book in which `scan_address` found the address.
#[derive(Debug, Clone, Serialize)]
pub struct ScanHit {
    pub username: String,
    pub bookname: String,
    pub token: String,
    pub contacts: Vec<Contact>,
}

/// CardDAV client bound to one user.
///
/// Owns its `DigestSession`, so every method takes `&mut self`.
pub struct AddressBookClient<T> {
    session: DigestSession<T>,
    root: String,
    supported: bool,
}

impl<T: Transport> AddressBookClient<T> {
    /// `root` is the DAV root path on the server, e.g. `/dav.php`.
    pub fn new(session: DigestSession<T>, root: &str) -> Self {
        Self {
            session,
            root: root.trim_end_matches('/').to_string(),
            supported: false,
        }
    }

    pub fn username(&self) -> &str {
        self.session.username()
    }

    pub fn session(&self) -> &DigestSession<T> {
        &self.session
    }

    /// Collection path of one of this user's books.
    pub fn book_uri(&self, bookname: &str) -> String {
        token::book_uri(&self.root, self.session.username(), bookname)
    }

    /// Collection path for an already-derived token.
    pub fn token_uri(&self, token: &str) -> String {
        token::token_uri(&self.root, self.session.username(), token)
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Verify the server advertises CardDAV (`DAV: ..., addressbook`).
    pub async fn check_support(&mut self) -> Result<()> {
        let path = format!("{}/", self.root);
        let response = self.execute(DavRequest::new(Method::OPTIONS, &path)).await?;
        let dav: Vec<&str> = response
            .headers
            .get_all("dav")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let supported = dav
            .iter()
            .flat_map(|v| v.split(','))
            .any(|class| class.trim().eq_ignore_ascii_case("addressbook"));
        if !supported {
            return Err(Error::Discovery(format!(
                "{} does not advertise CardDAV (DAV: {})",
                path,
                dav.join(", ")
            )));
        }
        self.supported = true;
        Ok(())
    }

    pub async fn current_user_principal(&mut self) -> Result<String> {
        let path = format!("{}/", self.root);
        let entries = self
            .propfind(&path, "0", xml::propfind_current_user_principal())
            .await?;
        entries
            .into_iter()
            .find_map(|e| e.props.current_user_principal)
            .map(|href| href_path(&href))
            .ok_or_else(|| Error::Discovery(format!("no current-user-principal at {}", path)))
    }

    pub async fn home_set(&mut self, principal: &str) -> Result<String> {
        let entries = self
            .propfind(principal, "0", xml::propfind_home_set())
            .await?;
        entries
            .into_iter()
            .find_map(|e| e.props.addressbook_home_set)
            .map(|href| href_path(&href))
            .ok_or_else(|| Error::Discovery(format!("no addressbook-home-set for {}", principal)))
    }

    /// All address books of the user.
    pub async fn list(&mut self) -> Result<Vec<AddressBook>> {
        if !self.supported {
            self.check_support().await?;
        }
        let principal = self.current_user_principal().await?;
        let home = self.home_set(&principal).await?;
        let entries = self
            .propfind(&home, "1", xml::propfind_address_books())
            .await?;

        let books: Vec<AddressBook> = entries
            .into_iter()
            .filter(|e| e.props.is_address_book())
            .map(|e| AddressBook {
                path: href_path(&e.href),
                display_name: e.props.display_name,
                description: e.props.description,
            })
            .collect();
        debug!(user = self.username(), count = books.len(), "listed address books");
        Ok(books)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Every card in the collection at `path`.
    pub async fn addresses(&mut self, path: &str) -> Result<Vec<Contact>> {
        self.report(path, xml::addressbook_query(None)).await
    }

    pub async fn query(&mut self, path: &str, filter: &PropFilter) -> Result<Vec<Contact>> {
        self.report(
            path,
            xml::addressbook_query(Some((filter.name.as_str(), filter.value.as_str()))),
        )
        .await
    }

    /// Cards in `bookname` carrying `email`. An empty result is not an error.
    pub async fn query_address(&mut self, bookname: &str, email: &str) -> Result<Vec<Contact>> {
        let path = self.book_uri(bookname);
        let mut contacts = self.query(&path, &PropFilter::email(email)).await?;
        contacts.retain(|c| c.has_email(email));
        Ok(contacts)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add `email` to `bookname` unless a card with it already exists.
    pub async fn add_address(
        &mut self,
        bookname: &str,
        email: &str,
        name: Option<&str>,
    ) -> Result<Contact> {
        if let Some(existing) = self.query_address(bookname, email).await?.into_iter().next() {
            debug!(user = self.username(), book = bookname, email, "address already present");
            return Ok(existing);
        }

        let uid = Uuid::new_v4();
        let path = format!("{}{}.vcf", self.book_uri(bookname), uid);
        let request = DavRequest::new(Method::PUT, &path)
            .header("content-type", "text/vcard; charset=utf-8")
            .header("if-none-match", "*")
            .body(card::new_card(&uid, email, name)?);
        self.execute(request).await?;

        let book = self.book_uri(bookname);
        let mut created = self.query(&book, &PropFilter::uid(&uid.to_string())).await?;
        if created.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected one card with UID {} after PUT {}, found {}",
                uid,
                path,
                created.len()
            )));
        }
        info!(user = self.username(), book = bookname, email, "added address");
        Ok(created.remove(0))
    }

    /// Delete every card in `bookname` carrying `email`; returns what was deleted.
    pub async fn delete_address(&mut self, bookname: &str, email: &str) -> Result<Vec<Contact>> {
        let matches = self.query_address(bookname, email).await?;
        let book = self.book_uri(bookname);
        for contact in &matches {
            let path = if contact.href.is_empty() {
                format!("{}{}.vcf", book, contact.uid)
            } else {
                contact.href.clone()
            };
            self.execute(DavRequest::new(Method::DELETE, &path)).await?;
        }
        if !matches.is_empty() {
            info!(user = self.username(), book = bookname, email, count = matches.len(), "deleted address");
        }
        Ok(matches)
    }

    /// Search every book of the user for `email`.
    pub async fn scan_address(&mut self, email: &str) -> Result<Vec<ScanHit>> {
        let mut hits = Vec::new();
        for book in self.list().await? {
            let parsed = BookPath::parse(&book.path)?;
            let contacts = self.query(&book.path, &PropFilter::email(email)).await?;
            let contacts: Vec<Contact> = contacts.into_iter().filter(|c| c.has_email(email)).collect();
            if !contacts.is_empty() {
                hits.push(ScanHit {
                    username: parsed.username,
                    bookname: parsed.bookname,
                    token: parsed.token,
                    contacts,
                });
            }
        }
        Ok(hits)
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn execute(&mut self, request: DavRequest) -> Result<DavResponse> {
        let method = request.method.to_string();
        let path = request.path.clone();
        let response = self.session.send(request).await?;
        if !response.status.is_success() {
            return Err(Error::Dav {
                method,
                path,
                status: response.status,
            });
        }
        Ok(response)
    }

    async fn propfind(&mut self, path: &str, depth: &str, body: String) -> Result<Vec<Entry>> {
        let request = DavRequest::new(dav_method("PROPFIND")?, path)
            .header("depth", depth)
            .header("content-type", "application/xml; charset=utf-8")
            .body(body);
        let response = self.execute(request).await?;
        multistatus(&response, path)
    }

    async fn report(&mut self, path: &str, body: String) -> Result<Vec<Contact>> {
        let request = DavRequest::new(dav_method("REPORT")?, path)
            .header("depth", "1")
            .header("content-type", "application/xml; charset=utf-8")
            .body(body);
        let response = self.execute(request).await?;

        let mut contacts = Vec::new();
        for entry in multistatus(&response, path)? {
            if let Some(data) = entry.props.address_data.as_deref() {
                contacts.push(Contact::parse(&href_path(&entry.href), entry.props.etag.clone(), data)?);
            }
        }
        Ok(contacts)
    }
}

fn dav_method(name: &str) -> Result<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|err| Error::Protocol(format!("bad method {}: {}", name, err)))
}

fn multistatus(response: &DavResponse, path: &str) -> Result<Vec<Entry>> {
    if response.status != StatusCode::MULTI_STATUS {
        return Err(Error::Protocol(format!(
            "expected 207 Multi-Status from {}, got {}",
            path, response.status
        )));
    }
    xml::parse_multistatus(&response.body)
}

/// Servers may answer with absolute URLs; keep only the path.
fn href_path(href: &str) -> String {
    let href = href.trim();
    match Url::parse(href) {
        Ok(url) if url.has_host() => url.path().to_string(),
        _ => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use http::HeaderValue;

    /// Replays canned responses in order and records requests.
    #[derive(Default)]
    struct Canned {
        responses: Mutex<VecDeque<DavResponse>>,
        seen: Mutex<Vec<DavRequest>>,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn send(&self, request: DavRequest) -> Result<DavResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| DavResponse::new(StatusCode::INTERNAL_SERVER_ERROR)))
        }
    }

    fn multi(body: &str) -> DavResponse {
        let mut response = DavResponse::new(StatusCode::MULTI_STATUS);
        response.body = body.to_string();
        response
    }

    fn client(responses: Vec<DavResponse>) -> (AddressBookClient<Arc<Canned>>, Arc<Canned>) {
        let canned = Arc::new(Canned {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        });
        let session = DigestSession::new(canned.clone(), "alice@example.org", "pw");
        (AddressBookClient::new(session, "/dav.php/"), canned)
    }

    #[test]
    fn test_href_path() {
        assert_eq!(href_path("https://h.example/dav.php/x/"), "/dav.php/x/");
        assert_eq!(href_path(" /dav.php/x/ "), "/dav.php/x/");
    }

    #[tokio::test]
    async fn test_check_support_requires_addressbook_class() {
        let mut options = DavResponse::new(StatusCode::OK);
        options
            .headers
            .insert("dav", HeaderValue::from_static("1, 3, extended-mkcol, access-control"));
        let (mut c, _) = client(vec![options]);
        assert!(matches!(c.check_support().await, Err(Error::Discovery(_))));

        let mut options = DavResponse::new(StatusCode::OK);
        options
            .headers
            .insert("dav", HeaderValue::from_static("1, 3, addressbook"));
        let (mut c, canned) = client(vec![options]);
        c.check_support().await.unwrap();
        assert_eq!(canned.seen.lock().unwrap()[0].path, "/dav.php/");
    }

    #[tokio::test]
    async fn test_missing_principal_is_discovery_error() {
        let (mut c, _) = client(vec![multi(
            r#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/dav.php/</d:href></d:response></d:multistatus>"#,
        )]);
        assert!(matches!(
            c.current_user_principal().await,
            Err(Error::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_query_address_empty_is_ok() {
        let (mut c, canned) = client(vec![multi(r#"<d:multistatus xmlns:d="DAV:"/>"#)]);
        let found = c.query_address("friends", "nobody@example.org").await.unwrap();
        assert!(found.is_empty());

        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen[0].method.as_str(), "REPORT");
        assert_eq!(
            seen[0].path,
            "/dav.php/addressbooks/alice@example.org/alice-example-org-friends/"
        );
        assert!(seen[0].body.contains("nobody@example.org"));
    }

    #[tokio::test]
    async fn test_error_status_maps_to_dav_error() {
        let (mut c, _) = client(vec![DavResponse::new(StatusCode::FORBIDDEN)]);
        match c.addresses("/dav.php/addressbooks/alice@example.org/default/").await {
            Err(Error::Dav { method, status, .. }) => {
                assert_eq!(method, "REPORT");
                assert_eq!(status, StatusCode::FORBIDDEN);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_address_requires_single_created_card() {
        let (mut c, canned) = client(vec![
            multi(r#"<d:multistatus xmlns:d="DAV:"/>"#),
            DavResponse::new(StatusCode::CREATED),
            multi(r#"<d:multistatus xmlns:d="DAV:"/>"#),
        ]);
        let err = c.add_address("default", "a@b.c", None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen[1].method, Method::PUT);
        assert_eq!(seen[1].headers.get("if-none-match").unwrap(), "*");
        assert!(seen[1].path.ends_with(".vcf"));
        assert!(seen[1].body.contains("EMAIL:a@b.c"));
    }

    #[tokio::test]
    async fn test_delete_address_uses_server_href() {
        let (mut c, canned) = client(vec![
            multi(
                r#"<d:multistatus xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">
 <d:response>
  <d:href>/dav.php/addressbooks/alice@example.org/default/imported-7.vcf</d:href>
  <d:propstat>
   <d:prop>
    <card:address-data>BEGIN:VCARD
VERSION:3.0
UID:u-7
FN:Ann
EMAIL:ann@b.c
END:VCARD
</card:address-data>
   </d:prop>
   <d:status>HTTP/1.1 200 OK</d:status>
  </d:propstat>
 </d:response>
</d:multistatus>"#,
            ),
            DavResponse::new(StatusCode::NO_CONTENT),
        ]);
        let deleted = c.delete_address("default", "ann@b.c").await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].uid, "u-7");

        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen[1].method, Method::DELETE);
        assert_eq!(
            seen[1].path,
            "/dav.php/addressbooks/alice@example.org/default/imported-7.vcf"
        );
    }
}
