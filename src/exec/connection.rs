//! Login strategies for remote endpoints

use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One way of authenticating to a remote host
#[derive(Clone)]
pub enum Connection {
    /// Explicit password
    Password(SecretString),
    /// Private key file
    KeyFile(PathBuf),
    /// Agent identities or whatever the transport discovers on its own
    Agent,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Password(_) => write!(f, "Password(***)"),
            Connection::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
            Connection::Agent => write!(f, "Agent"),
        }
    }
}

/// Credentials an endpoint logs in with
#[derive(Clone)]
pub struct LoginSpec {
    pub username: String,
    pub password: Option<SecretString>,
    /// Append the agent/auto-discovery fallback
    pub discover_auth: bool,
    /// Candidate private keys, in priority order
    pub key_paths: Vec<PathBuf>,
}

impl fmt::Debug for LoginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginSpec")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("discover_auth", &self.discover_auth)
            .field("key_paths", &self.key_paths)
            .finish()
    }
}

impl LoginSpec {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
            discover_auth: true,
            key_paths: default_key_paths(),
        }
    }

    pub fn with_password(mut self, password: Option<&str>) -> Self {
        self.password = password.map(|p| SecretString::new(p.to_string().into_boxed_str()));
        self
    }

    pub fn with_discover_auth(mut self, discover_auth: bool) -> Self {
        self.discover_auth = discover_auth;
        self
    }

    pub fn with_key_paths(mut self, key_paths: Vec<PathBuf>) -> Self {
        self.key_paths = key_paths;
        self
    }

    /// Ordered strategy list: password, keys present on disk, then agent
    pub fn strategies(&self) -> Vec<Connection> {
        let mut strategies = Vec::new();
        if let Some(password) = &self.password {
            strategies.push(Connection::Password(password.clone()));
        }
        strategies.extend(
            self.key_paths
                .iter()
                .filter(|p| p.exists())
                .cloned()
                .map(Connection::KeyFile),
        );
        if self.discover_auth {
            strategies.push(Connection::Agent);
        }
        strategies
    }
}

/// `~/.ssh/id_rsa` then `~/.ssh/id_ed25519`
pub fn default_key_paths() -> Vec<PathBuf> {
    match dirs::home_dir() {
        Some(home) => vec![
            home.join(".ssh").join("id_rsa"),
            home.join(".ssh").join("id_ed25519"),
        ],
        None => Vec::new(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct Ignition {
    #[serde(default)]
    passwd: Passwd,
}

#[derive(Debug, Default, Deserialize)]
struct Passwd {
    #[serde(default)]
    users: Vec<IgnitionUser>,
}

#[derive(Debug, Deserialize)]
struct IgnitionUser {
    #[serde(rename = "sshAuthorizedKeys", default)]
    ssh_authorized_keys: Vec<String>,
}

/// Public keys an ignition config authorizes, in document order
pub fn ignition_authorized_keys(ignition: &str) -> Result<Vec<String>> {
    let ignition: Ignition = serde_json::from_str(ignition)?;
    Ok(ignition
        .passwd
        .users
        .into_iter()
        .flat_map(|u| u.ssh_authorized_keys)
        .collect())
}

/// Key type and base64 body; the comment is ignored
fn key_identity(public_key: &str) -> Option<(&str, &str)> {
    let mut fields = public_key.split_whitespace();
    Some((fields.next()?, fields.next()?))
}

/// Public half of a private key file
fn public_key_of(private_key: &Path) -> io::Result<Option<String>> {
    let mut name = private_key.as_os_str().to_os_string();
    name.push(".pub");
    match fs::read_to_string(PathBuf::from(name)) {
        Ok(key) => Ok(Some(key)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// First candidate whose `<key>.pub` is one of `authorized`
///
/// Candidates without a private or public file are skipped.
pub fn matching_private_key(authorized: &[String], candidates: &[PathBuf]) -> Result<Option<PathBuf>> {
    let wanted: Vec<(&str, &str)> = authorized.iter().filter_map(|k| key_identity(k)).collect();
    for candidate in candidates.iter().filter(|p| p.exists()) {
        let Some(public) = public_key_of(candidate)? else {
            continue;
        };
        if key_identity(&public).is_some_and(|id| wanted.contains(&id)) {
            return Ok(Some(candidate.clone()));
        }
    }
    Ok(None)
}
