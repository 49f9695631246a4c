//! Book token codec.
//!
//! Every address book lives at `/<root>/addressbooks/<username>/<token>/`, where
//! the token is derived from the owning user and the book name. The mapping is
//! lossy on special characters, so decoding only round-trips for usernames made
//! of ASCII letters, digits and the `@`/`.` separators.

use crate::error::{Error, Result};

/// Token (and book name) of the collection every account is created with.
pub const DEFAULT_TOKEN: &str = "default";

/// Whether `bookname` names the reserved default collection.
pub fn is_default_book(bookname: &str) -> bool {
    bookname.eq_ignore_ascii_case(DEFAULT_TOKEN)
}

/// Derive the collection token for a user's book.
pub fn encode(username: &str, bookname: &str) -> String {
    if is_default_book(bookname) {
        return DEFAULT_TOKEN.to_string();
    }
    sanitize(&format!("{}-{}", username, bookname))
}

/// Recover `(username, bookname)` from a token and the username path segment
/// it was found under. The book name comes back in its sanitized form.
pub fn decode(path_username: &str, token: &str) -> Result<(String, String)> {
    if token == DEFAULT_TOKEN {
        return Err(Error::Format(format!(
            "token '{}' does not encode a user book",
            token
        )));
    }

    if !path_username.is_empty() {
        let prefix = format!("{}-", sanitize(path_username));
        return match token.strip_prefix(&prefix) {
            Some(bookname) if !bookname.is_empty() => {
                Ok((path_username.to_string(), bookname.to_string()))
            }
            _ => Err(Error::Format(format!(
                "token '{}' does not belong to user {}",
                token, path_username
            ))),
        };
    }

    // No username segment to anchor on: assume local-domain-tld-book.
    let fields: Vec<&str> = token.splitn(4, '-').collect();
    if fields.len() == 4 && fields.iter().all(|f| !f.is_empty()) {
        let username = format!("{}@{}.{}", fields[0], fields[1], fields[2]);
        return Ok((username, fields[3].to_string()));
    }
    Err(Error::Format(format!("unexpected token format: {}", token)))
}

/// An address-book collection path split into its identity parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookPath {
    pub username: String,
    pub bookname: String,
    pub token: String,
}

impl BookPath {
    /// Parse `/<root>/addressbooks/<username>/<token>/`.
    pub fn parse(path: &str) -> Result<Self> {
        let fields: Vec<&str> = path.split('/').collect();
        if fields.len() < 4 {
            return Err(Error::Format(format!("unexpected book path: {}", path)));
        }
        let raw_username = fields[fields.len() - 3];
        let token = fields[fields.len() - 2];
        if raw_username.is_empty() || token.is_empty() {
            return Err(Error::Format(format!("unexpected book path: {}", path)));
        }

        let username = urlencoding::decode(raw_username)
            .map_err(|err| Error::Format(format!("bad username segment in {}: {}", path, err)))?
            .into_owned();

        if token == DEFAULT_TOKEN {
            return Ok(Self {
                username,
                bookname: DEFAULT_TOKEN.to_string(),
                token: token.to_string(),
            });
        }

        let (username, bookname) = decode(&username, token)?;
        Ok(Self {
            username,
            bookname,
            token: token.to_string(),
        })
    }
}

/// Collection path for a user's book under the DAV root (e.g. `/dav.php`).
pub fn book_uri(root: &str, username: &str, bookname: &str) -> String {
    token_uri(root, username, &encode(username, bookname))
}

/// Collection path for an already-derived token.
pub fn token_uri(root: &str, username: &str, token: &str) -> String {
    format!(
        "{}/addressbooks/{}/{}/",
        root.trim_end_matches('/'),
        username,
        token
    )
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect()
}
