mod output;

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use mabctl::accounts::{AccountStore, FileAccountStore, HttpAccountStore};
use mabctl::admin::{AdminClient, AdminSettings};
use mabctl::config::{self, Config, Settings};
use mabctl::controller::{Controller, Dump, HttpDavConnector, PoolSettings};
use mabctl::token;

use output::Mode;

type App = Controller<AdminClient, Box<dyn AccountStore>, HttpDavConnector>;

#[derive(Parser, Debug)]
#[command(name = "mabctl", version, about = "Manage users, books and addresses on a CardDAV server")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Configuration file
    #[arg(long, global = true, env = "MABCTL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Print nothing on success
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Print names and messages instead of JSON
    #[arg(long, short = 't', global = true)]
    terse: bool,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Domain whose _carddavs._tcp SRV record names the server
    #[arg(long, global = true)]
    domain: Option<String>,

    /// Server host or URL used to derive the admin and DAV URLs
    #[arg(long, global = true)]
    url: Option<String>,

    #[arg(long, global = true, value_name = "URL")]
    admin_url: Option<String>,

    #[arg(long, global = true, value_name = "URL")]
    dav_url: Option<String>,

    #[arg(long, short = 'U', global = true)]
    admin_username: Option<String>,

    #[arg(long, short = 'P', global = true)]
    admin_password: Option<String>,

    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Client certificate (PEM)
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    cert: Option<PathBuf>,

    /// Client certificate key (PEM)
    #[arg(long, short = 'k', global = true, value_name = "PATH")]
    key: Option<PathBuf>,

    /// Keep account passwords in this flat file instead of the admin API
    #[arg(long, global = true, value_name = "PATH")]
    passwd: Option<PathBuf>,

    /// Concurrent users during dump and restore
    #[arg(long, global = true)]
    max_workers: Option<usize>,
}

impl GlobalArgs {
    fn overrides(&self) -> Settings {
        Settings {
            domain: self.domain.clone(),
            url: self.url.clone(),
            admin_url: self.admin_url.clone(),
            dav_url: self.dav_url.clone(),
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
            api_key: self.api_key.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            insecure: self.insecure.then_some(true),
            passwd: self.passwd.clone(),
            max_workers: self.max_workers,
            request_timeout_secs: None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List server users
    Users,
    /// Show one user; exits 1 when absent
    User { username: String },
    /// Create a user and store its password
    Mkuser {
        username: String,
        #[arg(long)]
        display: Option<String>,
        /// Random when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Delete a user and its stored password
    Rmuser { username: String },
    /// Show a user's password, or set it with --set
    Passwd {
        username: String,
        /// New password; random when given without a value
        #[arg(long, num_args = 0..=1, default_missing_value = "", value_name = "PASSWORD")]
        set: Option<String>,
    },
    /// List stored accounts, or add them from a JSON object with --set
    Accounts {
        /// JSON file of username -> password, or - for stdin
        #[arg(long, value_name = "FILE")]
        set: Option<PathBuf>,
    },
    /// List a user's books with contact counts
    Books { username: String },
    /// Create a book
    Mkbook {
        username: String,
        bookname: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Delete a book
    Rmbook { username: String, bookname: String },
    /// List the cards of a book
    Addresses { username: String, bookname: String },
    /// Add an address unless it is already present
    Add {
        username: String,
        bookname: String,
        email: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete every card carrying an address
    Delete {
        username: String,
        bookname: String,
        email: String,
    },
    /// Look an address up in one book
    Query {
        username: String,
        bookname: String,
        email: String,
    },
    /// Look an address up in one book; exits 1 when absent
    Get {
        username: String,
        bookname: String,
        email: String,
    },
    /// Look an address up in every book of a user; exits 1 when absent
    Scan { username: String, email: String },
    /// Write users, passwords, books and addresses as JSON
    Dump {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Recreate server state from a dump
    Restore {
        /// Dump file, or - for stdin
        file: PathBuf,
        #[arg(long)]
        user: Option<String>,
        /// Delete existing users first
        #[arg(long)]
        force: bool,
    },
    /// Delete every user and stored account
    Clear,
    Status,
    Uptime,
    /// Initialize the server database
    Init,
    Reset,
    Shutdown,
    /// Encode or decode book tokens
    #[command(subcommand)]
    Token(TokenCommand),
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    Encode { username: String, bookname: String },
    Decode {
        token: String,
        /// Username path segment the token was found under
        #[arg(long)]
        user: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "mabctl=debug,warn" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            let configuration = err
                .downcast_ref::<mabctl::Error>()
                .is_some_and(mabctl::Error::is_configuration);
            ExitCode::from(if configuration { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mode = Mode::from_flags(cli.global.terse, cli.global.quiet);

    // token commands are pure and need no server
    if let Command::Token(command) = &cli.command {
        return run_token(mode, command);
    }

    let config = config::load(cli.global.config.as_deref(), cli.global.overrides()).await?;
    debug!(admin = %config.admin_url, dav = %config.dav_url, "configuration loaded");

    if let Command::Config = cli.command {
        print!("{}", config.to_masked_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let app = build(&config)?;
    let cancel = app.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    dispatch(&app, mode, cli.command).await
}

fn build(config: &Config) -> Result<App> {
    let http = config.http_settings();
    let admin = AdminClient::new(
        &AdminSettings {
            url: config.admin_url.to_string(),
            api_key: config.api_key.clone(),
            username: config.admin_username.clone(),
            password: config.admin_password.clone(),
        },
        &http,
    )
    .context("failed to create admin client")?;

    let accounts: Box<dyn AccountStore> = match &config.passwd {
        Some(path) => Box::new(FileAccountStore::new(path)),
        None => Box::new(HttpAccountStore::new(admin.clone())),
    };
    let connector =
        HttpDavConnector::new(config.dav_url.clone(), &http).context("failed to create DAV client")?;

    Ok(Controller::new(
        admin,
        accounts,
        connector,
        PoolSettings {
            max_workers: config.max_workers,
        },
    ))
}

fn run_token(mode: Mode, command: &TokenCommand) -> Result<ExitCode> {
    let lines = match command {
        TokenCommand::Encode { username, bookname } => vec![token::encode(username, bookname)],
        TokenCommand::Decode { token, user } => {
            let (username, bookname) = token::decode(user.as_deref().unwrap_or(""), token)?;
            vec![username, bookname]
        }
    };
    if mode != Mode::Quiet {
        for line in lines {
            println!("{}", line);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Read a file, or stdin for `-`.
fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn dispatch(app: &App, mode: Mode, command: Command) -> Result<ExitCode> {
    match command {
        Command::Users => output::print(mode, &app.users().await?)?,
        Command::User { username } => {
            let reply = app.user(&username).await?;
            output::print(mode, &reply)?;
            return Ok(found(reply.result.is_some()));
        }
        Command::Mkuser {
            username,
            display,
            password,
        } => output::print(
            mode,
            &app.add_user(&username, display.as_deref(), password.as_deref())
                .await?,
        )?,
        Command::Rmuser { username } => output::print(mode, &app.delete_user(&username).await?)?,
        Command::Passwd { username, set } => match set {
            Some(password) => {
                output::print(mode, &app.set_password(&username, Some(&password)).await?)?
            }
            None => {
                let reply = app.password(&username).await?;
                output::print(mode, &reply)?;
                return Ok(found(reply.result.is_some()));
            }
        },
        Command::Accounts { set } => match set {
            Some(path) => {
                let text = read_input(&path)?;
                let accounts: BTreeMap<String, String> = serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse accounts from {}", path.display()))?;
                output::print(mode, &app.set_accounts(accounts).await?)?
            }
            None => output::print(mode, &app.accounts_list().await?)?,
        },
        Command::Books { username } => output::print(mode, &app.books(&username).await?)?,
        Command::Mkbook {
            username,
            bookname,
            description,
        } => output::print(mode, &app.add_book(&username, &bookname, &description).await?)?,
        Command::Rmbook { username, bookname } => {
            output::print(mode, &app.delete_book(&username, &bookname).await?)?
        }
        Command::Addresses { username, bookname } => {
            output::print(mode, &app.addresses(&username, &bookname).await?)?
        }
        Command::Add {
            username,
            bookname,
            email,
            name,
        } => output::print(
            mode,
            &app.add_address(&username, &bookname, &email, name.as_deref())
                .await?,
        )?,
        Command::Delete {
            username,
            bookname,
            email,
        } => output::print(mode, &app.delete_address(&username, &bookname, &email).await?)?,
        Command::Query {
            username,
            bookname,
            email,
        } => output::print(mode, &app.query_address(&username, &bookname, &email).await?)?,
        Command::Get {
            username,
            bookname,
            email,
        } => {
            let reply = app.query_address(&username, &bookname, &email).await?;
            output::print(mode, &reply)?;
            return Ok(found(!reply.result.is_empty()));
        }
        Command::Scan { username, email } => {
            let reply = app.scan_address(&username, &email).await?;
            output::print(mode, &reply)?;
            return Ok(found(!reply.result.is_empty()));
        }
        Command::Dump { user, output: target } => {
            let reply = app.dump(user.as_deref()).await?;
            let text = output::json(&reply.result)?;
            match target {
                Some(path) => {
                    fs::write(&path, format!("{}\n", text))
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    if mode != Mode::Quiet {
                        println!("{}", reply.message);
                    }
                }
                None => println!("{}", text),
            }
        }
        Command::Restore { file, user, force } => {
            let text = read_input(&file)?;
            let dump: Dump = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse dump from {}", file.display()))?;
            if force {
                match user.as_deref() {
                    Some(username) => {
                        let exists = app
                            .users()
                            .await?
                            .result
                            .iter()
                            .any(|u| u.username == username);
                        if exists {
                            app.delete_user(username).await?;
                        }
                    }
                    None => {
                        app.clear().await?;
                    }
                }
            }
            output::print(mode, &app.restore(&dump, user.as_deref()).await?)?
        }
        Command::Clear => output::print(mode, &app.clear().await?)?,
        Command::Status => output::print(mode, &app.status().await?)?,
        Command::Uptime => output::print(mode, &app.uptime().await?)?,
        Command::Init => output::print(mode, &app.initialize().await?)?,
        Command::Reset => output::print(mode, &app.reset().await?)?,
        Command::Shutdown => output::print(mode, &app.shutdown().await?)?,
        Command::Token(_) | Command::Config => bail!("command does not use the server"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Exit status of the lookup commands: success only when something matched.
fn found(matched: bool) -> ExitCode {
    if matched {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
