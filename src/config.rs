use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::controller::DEFAULT_MAX_WORKERS;
use crate::dav::HttpSettings;
use crate::error::Error;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_NAME: &str = "mabctl";
const SYSTEM_CONFIG_PATH: &str = "/etc/mabctl/config.toml";
const ENV_PREFIX: &str = "MABCTL_";

const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_CERT: &str = "/etc/mabctl/mabctl.pem";
const DEFAULT_KEY: &str = "/etc/mabctl/mabctl.key";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MASK: &str = "********";

const KNOWN_KEYS: &[&str] = &[
    "domain",
    "url",
    "admin_url",
    "dav_url",
    "admin_username",
    "admin_password",
    "api_key",
    "cert",
    "key",
    "insecure",
    "passwd",
    "max_workers",
    "request_timeout_secs",
];

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The file the settings were read from, if any.
    pub config_path: Option<PathBuf>,
    pub admin_url: Url,
    pub dav_url: Url,
    pub admin_username: String,
    pub admin_password: String,
    pub api_key: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub insecure: bool,
    /// Flat-file account store; `None` keeps passwords behind the admin API.
    pub passwd: Option<PathBuf>,
    pub max_workers: usize,
    pub request_timeout: Duration,
}

impl Config {
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            insecure: self.insecure,
            timeout: self.request_timeout,
            identity: match (&self.cert, &self.key) {
                (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
                _ => None,
            },
        }
    }

    /// The configuration as TOML, with secrets masked.
    pub fn to_masked_toml(&self) -> Result<String> {
        let mask = |value: &str| {
            if value.is_empty() {
                String::new()
            } else {
                MASK.to_string()
            }
        };
        let view = Settings {
            domain: None,
            url: None,
            admin_url: Some(self.admin_url.to_string()),
            dav_url: Some(self.dav_url.to_string()),
            admin_username: Some(self.admin_username.clone()),
            admin_password: Some(mask(&self.admin_password)),
            api_key: Some(mask(&self.api_key)),
            cert: self.cert.clone(),
            key: self.key.clone(),
            insecure: Some(self.insecure),
            passwd: self.passwd.clone(),
            max_workers: Some(self.max_workers),
            request_timeout_secs: Some(self.request_timeout.as_secs()),
        };
        let mut text = String::new();
        if let Some(path) = &self.config_path {
            text.push_str(&format!("# {}\n", path.display()));
        }
        text.push_str(&toml::to_string_pretty(&view).context("failed to render configuration")?);
        Ok(text)
    }
}

// =============================================================================
// Layered settings
// =============================================================================

/// One layer of settings: the config file, the environment, or the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dav_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl Settings {
    /// Apply `other` on top of `self`; set values in `other` win.
    pub fn overlay(&mut self, other: Settings) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            domain,
            url,
            admin_url,
            dav_url,
            admin_username,
            admin_password,
            api_key,
            cert,
            key,
            insecure,
            passwd,
            max_workers,
            request_timeout_secs
        );
    }

    /// Read `MABCTL_<KEY>` variables from `vars`.
    pub fn from_env<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut settings = Settings::default();
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "domain" => settings.domain = Some(value),
                "url" => settings.url = Some(value),
                "admin_url" => settings.admin_url = Some(value),
                "dav_url" => settings.dav_url = Some(value),
                "admin_username" => settings.admin_username = Some(value),
                "admin_password" => settings.admin_password = Some(value),
                "api_key" => settings.api_key = Some(value),
                "cert" => settings.cert = Some(PathBuf::from(value)),
                "key" => settings.key = Some(PathBuf::from(value)),
                "passwd" => settings.passwd = Some(PathBuf::from(value)),
                "insecure" => settings.insecure = Some(parse_bool(&name, &value)?),
                "max_workers" => {
                    settings.max_workers = Some(
                        value
                            .parse()
                            .with_context(|| format!("{} must be a number", name))?,
                    )
                }
                "request_timeout_secs" => {
                    settings.request_timeout_secs = Some(
                        value
                            .parse()
                            .with_context(|| format!("{} must be a number", name))?,
                    )
                }
                // MABCTL_CONFIG selects the file and is read by the CLI
                "config" => {}
                _ => warn!("ignoring unknown environment variable {}", name),
            }
        }
        Ok(settings)
    }

    /// Whether the server host has to be found through DNS.
    pub fn needs_discovery(&self) -> bool {
        (self.admin_url.is_none() || self.dav_url.is_none()) && self.url.is_none()
    }

    /// Build the final configuration. `host` is the SRV-discovered server
    /// host and is only consulted when neither explicit URLs nor `url` are set.
    pub fn resolve(self, config_path: Option<PathBuf>, host: Option<String>) -> Result<Config> {
        let host = match self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Some(host_of(url)?),
            None => host,
        };
        let default_url = |template: &str| -> Result<String> {
            let host = host.as_deref().ok_or_else(|| {
                Error::Configuration(
                    "no server configured: set url, domain, admin_url or dav_url".into(),
                )
            })?;
            Ok(template.replace("{host}", host))
        };

        let admin_url = match self.admin_url {
            Some(url) => url,
            None => default_url("https://{host}:4443/bcc")?,
        };
        let dav_url = match self.dav_url {
            Some(url) => url,
            None => default_url("https://{host}/dav.php")?,
        };
        let admin_url = Url::parse(&admin_url)
            .map_err(|err| Error::Configuration(format!("invalid admin_url {}: {}", admin_url, err)))?;
        let dav_url = Url::parse(&dav_url)
            .map_err(|err| Error::Configuration(format!("invalid dav_url {}: {}", dav_url, err)))?;

        let (cert, key) = match (self.cert, self.key) {
            (Some(cert), Some(key)) => (Some(expand_tilde(&cert)), Some(expand_tilde(&key))),
            (None, None) => {
                let (cert, key) = (PathBuf::from(DEFAULT_CERT), PathBuf::from(DEFAULT_KEY));
                if cert.exists() && key.exists() {
                    (Some(cert), Some(key))
                } else {
                    (None, None)
                }
            }
            _ => {
                return Err(
                    Error::Configuration("cert and key must be configured together".into()).into(),
                )
            }
        };

        let max_workers = self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
        if max_workers == 0 {
            return Err(Error::Configuration("max_workers must be at least 1".into()).into());
        }

        Ok(Config {
            config_path,
            admin_url,
            dav_url,
            admin_username: self
                .admin_username
                .unwrap_or_else(|| DEFAULT_ADMIN_USERNAME.to_string()),
            admin_password: self.admin_password.unwrap_or_default(),
            api_key: self.api_key.unwrap_or_default(),
            cert,
            key,
            insecure: self.insecure.unwrap_or(false),
            passwd: self.passwd.map(|p| expand_tilde(&p)),
            max_workers,
            request_timeout: Duration::from_secs(
                self.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("{} must be a boolean, got '{}'", name, value),
    }
}

/// Host part of `url`, which may also be a bare host name.
fn host_of(url: &str) -> Result<String> {
    let parsed = if url.contains("://") {
        Url::parse(url)
    } else {
        Url::parse(&format!("https://{}", url))
    }
    .map_err(|err| Error::Configuration(format!("invalid url {}: {}", url, err)))?;
    let host = parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Configuration(format!("url has no host: {}", url)))?;
    Ok(host)
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// =============================================================================
// Loading
// =============================================================================

fn user_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|base| base.config_dir().join(APP_NAME).join(CONFIG_FILE_NAME))
}

/// The config file to read: the explicit one, else the first that exists of
/// the per-user and system locations.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }
    user_config_path()
        .into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG_PATH)))
        .find(|path| path.exists())
}

/// Parse a config file, warning about keys this tool does not know.
pub fn read_settings(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
    let value: toml::Value = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;

    warn_unknown_keys(&value);

    value
        .try_into()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))
}

/// Load configuration: defaults < file < environment < `overrides`.
pub async fn load(explicit: Option<&Path>, overrides: Settings) -> Result<Config> {
    let path = config_path(explicit);
    let mut settings = Settings::default();
    if let Some(path) = &path {
        if explicit.is_some() && !path.exists() {
            return Err(Error::Configuration(format!(
                "configuration file not found at {}",
                path.display()
            ))
            .into());
        }
        debug!(path = %path.display(), "reading configuration");
        settings.overlay(read_settings(path)?);
    }
    settings.overlay(Settings::from_env(std::env::vars())?);
    settings.overlay(overrides);

    let host = match discovery_domain(&settings, local_domain) {
        Some(domain) => Some(discover_host(&domain).await?),
        None => None,
    };

    settings.resolve(path, host)
}

/// The domain to look the server up under, when discovery is needed at all.
/// Without a configured `domain` the local host's own domain is used.
fn discovery_domain(settings: &Settings, local: impl FnOnce() -> Option<String>) -> Option<String> {
    if !settings.needs_discovery() {
        return None;
    }
    if let Some(domain) = settings.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        return Some(domain.to_string());
    }
    let domain = local();
    if let Some(domain) = &domain {
        debug!(%domain, "no domain configured, using the local host's domain");
    }
    domain
}

/// Domain part of a host name: everything after the first dot.
pub fn domain_of_host(hostname: &str) -> Option<String> {
    let hostname = hostname.trim().trim_end_matches('.');
    hostname
        .split_once('.')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .map(str::to_string)
}

/// Domain of the machine this runs on, from the first qualified host name found.
fn local_domain() -> Option<String> {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .chain(std::env::var("HOSTNAME").ok())
        .find_map(|name| domain_of_host(&name))
}

/// Find the CardDAV host from the `_carddavs._tcp.<domain>` SRV record.
pub async fn discover_host(domain: &str) -> crate::error::Result<String> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let name = format!("_carddavs._tcp.{}", domain.trim_end_matches('.'));
    let lookup = resolver
        .srv_lookup(name.as_str())
        .await
        .map_err(|err| Error::Configuration(format!("SRV lookup for {} failed: {}", name, err)))?;
    let host = lookup
        .iter()
        .min_by_key(|record| record.priority())
        .map(|record| record.target().to_string().trim_end_matches('.').to_string())
        .ok_or_else(|| Error::Configuration(format!("no SRV record for {}", name)))?;
    debug!(%name, %host, "discovered CardDAV host");
    Ok(host)
}

// =============================================================================
// Unknown key warnings
// =============================================================================

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };
    for key in table.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            warn!("unknown configuration key `{}`", key);
        }
    }
}
