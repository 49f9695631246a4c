//! Rendering of controller replies on stdout.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;

use mabctl::admin::{Book, Response, StatusResponse, User};
use mabctl::card::Contact;
use mabctl::controller::{ClearSummary, Reply, RestoreSummary};
use mabctl::dav::ScanHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The whole reply as pretty JSON.
    Json,
    /// One line per result item.
    Terse,
    Quiet,
}

impl Mode {
    pub fn from_flags(terse: bool, quiet: bool) -> Self {
        if quiet {
            Mode::Quiet
        } else if terse {
            Mode::Terse
        } else {
            Mode::Json
        }
    }
}

/// Compact text form of a result.
pub trait Terse {
    fn terse(&self) -> Vec<String>;
}

pub fn print<T: Serialize + Terse>(mode: Mode, reply: &Reply<T>) -> Result<()> {
    match mode {
        Mode::Quiet => {}
        Mode::Json => {
            let text = serde_json::to_string_pretty(reply).context("failed formatting JSON")?;
            println!("{}", text);
        }
        Mode::Terse => {
            let lines = reply.result.terse();
            if lines.is_empty() {
                println!("{}", reply.message);
            }
            for line in lines {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

/// Serialize a bare value (dump files, config) regardless of mode.
pub fn json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed formatting JSON")
}

// ============================================================================
// Terse renderings
// ============================================================================

impl<T: Terse> Terse for Vec<T> {
    fn terse(&self) -> Vec<String> {
        self.iter().flat_map(Terse::terse).collect()
    }
}

impl<T: Terse> Terse for Option<T> {
    fn terse(&self) -> Vec<String> {
        self.as_ref().map(Terse::terse).unwrap_or_default()
    }
}

impl Terse for String {
    fn terse(&self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl Terse for User {
    fn terse(&self) -> Vec<String> {
        vec![self.username.clone()]
    }
}

impl Terse for Book {
    fn terse(&self) -> Vec<String> {
        vec![self.bookname.clone()]
    }
}

impl Terse for Contact {
    fn terse(&self) -> Vec<String> {
        let email = self.emails.first().cloned().unwrap_or_default();
        match &self.formatted_name {
            Some(name) if name != &email => vec![format!("{}\t{}", email, name)],
            _ => vec![email],
        }
    }
}

impl Terse for ScanHit {
    fn terse(&self) -> Vec<String> {
        vec![self.bookname.clone()]
    }
}

impl Terse for Response {
    fn terse(&self) -> Vec<String> {
        vec![self.message.clone()]
    }
}

impl Terse for StatusResponse {
    fn terse(&self) -> Vec<String> {
        self.status
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value))
            .collect()
    }
}

impl Terse for BTreeMap<String, String> {
    fn terse(&self) -> Vec<String> {
        self.iter()
            .map(|(user, password)| format!("{}:{}", user, password))
            .collect()
    }
}

impl Terse for RestoreSummary {
    fn terse(&self) -> Vec<String> {
        vec![format!(
            "{} users, {} books, {} addresses",
            self.users, self.books, self.addresses
        )]
    }
}

impl Terse for ClearSummary {
    fn terse(&self) -> Vec<String> {
        self.users
            .iter()
            .chain(self.accounts.iter())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_flags() {
        assert_eq!(Mode::from_flags(false, false), Mode::Json);
        assert_eq!(Mode::from_flags(true, false), Mode::Terse);
        assert_eq!(Mode::from_flags(true, true), Mode::Quiet);
    }

    #[test]
    fn test_terse_contacts() {
        let contact = Contact {
            href: "/x.vcf".into(),
            etag: None,
            uid: "x".into(),
            emails: vec!["a@b.c".into()],
            formatted_name: Some("Ann".into()),
            given_name: None,
            family_name: None,
            additional_name: None,
            raw: String::new(),
        };
        assert_eq!(vec![contact].terse(), vec!["a@b.c\tAnn"]);
    }

    #[test]
    fn test_terse_clear_summary_dedups() {
        let summary = ClearSummary {
            users: vec!["a".into(), "b".into()],
            accounts: vec!["b".into(), "c".into()],
        };
        assert_eq!(summary.terse(), vec!["a", "b", "c"]);
    }
}
