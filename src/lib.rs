//! Administration of a CardDAV address-book server.
//!
//! Users, passwords and books are managed through the server's admin REST
//! API ([`admin`]); address cards are read and written over CardDAV with
//! Digest authentication ([`dav`]). [`controller`] ties both together and
//! adds the bulk dump/restore workflows used by the `mabctl` binary.

pub mod accounts;
pub mod admin;
pub mod card;
pub mod config;
pub mod controller;
pub mod dav;
pub mod error;
pub mod token;

pub use error::{Error, Result};
