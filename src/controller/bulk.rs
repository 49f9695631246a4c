//! Whole-server dump, restore and clear.
//!
//! Dump and restore fan out one worker task per user on a `JoinSet`, capped
//! by a `Semaphore` at `PoolSettings::max_workers`. Each worker owns at most
//! one CardDAV client (one Digest session), created on first use, and reports
//! `(username, result)` on an mpsc channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Controller, DavConnector, Reply};
use crate::accounts::AccountStore;
use crate::admin::AdminApi;
use crate::dav::AddressBookClient;
use crate::error::{Error, Result, WorkerFailure};
use crate::token;

/// Everything stored for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDump {
    pub password: String,
    /// Book name -> email addresses.
    #[serde(default)]
    pub books: BTreeMap<String, Vec<String>>,
}

/// Server state keyed by username.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dump {
    pub users: BTreeMap<String, UserDump>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub users: usize,
    pub books: usize,
    pub addresses: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    pub users: Vec<String>,
    pub accounts: Vec<String>,
}

type Outcome<T> = (String, Result<T>);

/// Await every worker, resuming any panic on the coordinator.
async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }
}

/// Return `slot`'s client, connecting on first use.
fn lazy_client<'a, D: DavConnector>(
    slot: &'a mut Option<AddressBookClient<D::Transport>>,
    connector: &D,
    username: &str,
    password: &str,
    cancel: &CancellationToken,
) -> Result<&'a mut AddressBookClient<D::Transport>> {
    match *slot {
        Some(ref mut client) => Ok(client),
        None => {
            debug!(username, "opening CardDAV session");
            Ok(slot.insert(connector.connect(username, password, Some(cancel.clone()))?))
        }
    }
}

async fn dump_user<A: AdminApi, D: DavConnector>(
    admin: &A,
    connector: &D,
    username: &str,
    password: &str,
    cancel: &CancellationToken,
) -> Result<UserDump> {
    let mut session = None;
    let mut books = BTreeMap::new();

    for book in admin.books(Some(username)).await? {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if book.contacts == 0 {
            books.insert(book.bookname, Vec::new());
            continue;
        }

        let client = lazy_client(&mut session, connector, username, password, cancel)?;
        let path = if book.token.is_empty() {
            client.book_uri(&book.bookname)
        } else {
            client.token_uri(&book.token)
        };

        let mut emails = Vec::new();
        for contact in client.addresses(&path).await? {
            let email = contact.emails.into_iter().next().ok_or_else(|| {
                Error::Format(format!("card {} has no EMAIL", contact.href))
            })?;
            emails.push(email);
        }
        emails.sort();
        books.insert(book.bookname, emails);
    }

    Ok(UserDump {
        password: password.to_string(),
        books,
    })
}

async fn restore_user<D: DavConnector>(
    connector: &D,
    username: &str,
    user: &UserDump,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut session = None;
    let mut added = 0;
    for (bookname, emails) in &user.books {
        for email in emails {
            let client = lazy_client(&mut session, connector, username, &user.password, cancel)?;
            client.add_address(bookname, email, None).await?;
            added += 1;
        }
    }
    Ok(added)
}

impl<A, S, D> Controller<A, S, D>
where
    A: AdminApi + 'static,
    S: AccountStore + 'static,
    D: DavConnector,
{
    /// Export every user (or only `target`) with password, books and addresses.
    pub async fn dump(&self, target: Option<&str>) -> Result<Reply<Dump>> {
        let server_users: Vec<String> = self
            .admin
            .users()
            .await?
            .into_iter()
            .map(|u| u.username)
            .collect();
        let selected = match target {
            Some(target) => {
                if !server_users.iter().any(|u| u == target) {
                    return Err(Error::Configuration(format!("no such user: {}", target)));
                }
                vec![target.to_string()]
            }
            None => server_users,
        };

        let accounts = self.accounts.list_accounts().await?;
        let mut jobs = Vec::with_capacity(selected.len());
        for username in selected {
            let password = accounts.get(&username).cloned().ok_or_else(|| {
                Error::Configuration(format!("no password for user {}", username))
            })?;
            jobs.push((username, password));
        }

        let cancel = self.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.pool.max_workers.max(1)));
        let (tx, mut rx) = mpsc::channel::<Outcome<UserDump>>(jobs.len().max(1));
        let mut workers = JoinSet::new();

        info!(users = jobs.len(), workers = self.pool.max_workers, "starting dump");
        for (username, password) in jobs {
            let admin = self.admin.clone();
            let connector = self.connector.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            workers.spawn(async move {
                let result: Result<UserDump> = async {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| Error::Cancelled)?;
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    dump_user(&*admin, &*connector, &username, &password, &cancel).await
                }
                .await;
                let _ = tx.send((username, result)).await;
            });
        }
        drop(tx);

        let mut dump = Dump::default();
        let mut failure: Option<Error> = None;
        while let Some((username, result)) = rx.recv().await {
            match result {
                Ok(user) => {
                    debug!(username = %username, books = user.books.len(), "dumped user");
                    dump.users.insert(username, user);
                }
                Err(err) => {
                    if failure.is_none() {
                        warn!(username = %username, error = %err, "dump worker failed, cancelling");
                        cancel.cancel();
                        failure = Some(err.for_user(&username));
                    }
                }
            }
        }
        join_all(&mut workers).await;

        if let Some(err) = failure {
            return Err(err);
        }
        let message = format!("dumped {} users", dump.users.len());
        Ok(Reply::new("dump", message, dump))
    }

    /// Recreate users, passwords, books and addresses from `dump`.
    pub async fn restore(&self, dump: &Dump, target: Option<&str>) -> Result<Reply<RestoreSummary>> {
        let selected: Vec<(&String, &UserDump)> = match target {
            Some(target) => match dump.users.get_key_value(target) {
                Some(entry) => vec![entry],
                None => {
                    return Err(Error::Configuration(format!(
                        "user {} not present in dump",
                        target
                    )))
                }
            },
            None => dump.users.iter().collect(),
        };

        let mut summary = RestoreSummary::default();

        // users, passwords and books go first, in order, so workers only add cards
        for (username, user) in &selected {
            self.admin
                .add_user(username, username, &user.password)
                .await
                .map_err(|e| e.for_user(username))?;
            self.accounts
                .set_password(username, &user.password)
                .await
                .map_err(|e| e.for_user(username))?;
            summary.users += 1;
            for bookname in user.books.keys() {
                if token::is_default_book(bookname) {
                    continue;
                }
                self.admin
                    .add_book(username, bookname, bookname)
                    .await
                    .map_err(|e| e.for_user(username))?;
                summary.books += 1;
            }
        }

        let cancel = self.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.pool.max_workers.max(1)));
        let (tx, mut rx) = mpsc::channel::<Outcome<usize>>(selected.len().max(1));
        let mut workers = JoinSet::new();

        for (username, user) in selected {
            if user.books.values().all(Vec::is_empty) {
                continue;
            }
            let username = username.clone();
            let user = user.clone();
            let connector = self.connector.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            workers.spawn(async move {
                let result: Result<usize> = async {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| Error::Cancelled)?;
                    restore_user(&*connector, &username, &user, &cancel).await
                }
                .await;
                let _ = tx.send((username, result)).await;
            });
        }
        drop(tx);

        let mut failures = Vec::new();
        while let Some((username, result)) = rx.recv().await {
            match result {
                Ok(added) => summary.addresses += added,
                Err(error) => {
                    warn!(username = %username, %error, "restore worker failed");
                    failures.push(WorkerFailure { username, error });
                }
            }
        }
        join_all(&mut workers).await;

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.username.cmp(&b.username));
            return Err(Error::Aggregate(failures));
        }
        let message = format!(
            "restored {} users, {} books, {} addresses",
            summary.users, summary.books, summary.addresses
        );
        Ok(Reply::new("restore", message, summary))
    }

    /// Delete every server user and every stored account.
    pub async fn clear(&self) -> Result<Reply<ClearSummary>> {
        let accounts = self.accounts.list_accounts().await?;
        let users: BTreeSet<String> = self
            .admin
            .users()
            .await?
            .into_iter()
            .map(|u| u.username)
            .collect();
        let names: BTreeSet<&String> = users.iter().chain(accounts.keys()).collect();

        let mut summary = ClearSummary::default();
        for name in names {
            if users.contains(name) {
                self.admin
                    .delete_user(name)
                    .await
                    .map_err(|e| e.for_user(name))?;
                summary.users.push(name.clone());
            }
            if accounts.contains_key(name) && self.accounts.delete_password(name).await? {
                summary.accounts.push(name.clone());
            }
        }
        info!(users = summary.users.len(), accounts = summary.accounts.len(), "cleared server");
        let message = format!(
            "deleted {} users, {} accounts",
            summary.users.len(),
            summary.accounts.len()
        );
        Ok(Reply::new("clear", message, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_file_shape() {
        let mut dump = Dump::default();
        dump.users.insert(
            "b@example.org".into(),
            UserDump {
                password: "pw".into(),
                books: BTreeMap::from([("default".to_string(), vec!["x@y.z".to_string()])]),
            },
        );
        dump.users.insert("a@example.org".into(), UserDump::default());

        let text = serde_json::to_string(&dump).unwrap();
        assert_eq!(
            text,
            r#"{"a@example.org":{"password":"","books":{}},"b@example.org":{"password":"pw","books":{"default":["x@y.z"]}}}"#
        );
        let back: Dump = serde_json::from_str(&text).unwrap();
        assert_eq!(back, dump);
    }

    #[test]
    fn test_dump_file_books_optional() {
        let dump: Dump = serde_json::from_str(r#"{"u@x.y": {"password": "p"}}"#).unwrap();
        assert!(dump.users["u@x.y"].books.is_empty());
    }
}
