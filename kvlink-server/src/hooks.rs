//! Authentication and access hooks.
//!
//! A server stub consults an [`Authenticator`] when a client sends AUTH,
//! and an [`AccessPolicy`] before every store operation. Both are plain
//! predicates supplied by the embedding application; closures work too.
//!
//! Passwords for the bundled [`PasswordAuthenticator`] are stored as
//! SHA-256 hashes, never in plaintext.

use kvlink_protocol::Operation;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Turns client credentials into a user value.
pub trait Authenticator: Send + Sync {
    /// Returns the user to attach to the connection, or a rejection reason.
    fn authenticate(&self, credentials: &Value) -> Result<Value, String>;
}

impl<F> Authenticator for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn authenticate(&self, credentials: &Value) -> Result<Value, String> {
        self(credentials)
    }
}

/// Decides whether a user may call a store method.
pub trait AccessPolicy: Send + Sync {
    /// `user` is `None` until the connection authenticates.
    fn check(&self, user: Option<&Value>, method: &str, args: &[Value]) -> Result<(), String>;
}

impl<F> AccessPolicy for F
where
    F: Fn(Option<&Value>, &str, &[Value]) -> Result<(), String> + Send + Sync,
{
    fn check(&self, user: Option<&Value>, method: &str, args: &[Value]) -> Result<(), String> {
        self(user, method, args)
    }
}

/// The hooks a server stub runs.
#[derive(Clone, Default)]
pub struct Hooks {
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub access: Option<Arc<dyn AccessPolicy>>,
}

impl Hooks {
    /// Runs the access policy. Without one, everything is allowed.
    pub fn check_access(
        &self,
        user: Option<&Value>,
        method: &str,
        args: &[Value],
    ) -> Result<(), String> {
        match &self.access {
            Some(policy) => policy.check(user, method, args),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("authenticator", &self.authenticator.is_some())
            .field("access", &self.access.is_some())
            .finish()
    }
}

/// Authenticates `{"name": ..., "password": ...}` credentials against
/// SHA-256 password hashes.
#[derive(Debug, Clone, Default)]
pub struct PasswordAuthenticator {
    /// user name -> lowercase hex SHA-256 of the password
    users: HashMap<String, String>,
}

impl PasswordAuthenticator {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|(name, hash)| (name, hash.to_ascii_lowercase()))
                .collect(),
        }
    }

    /// Adds a user from a plaintext password.
    pub fn with_user(mut self, name: impl Into<String>, password: &str) -> Self {
        self.users.insert(name.into(), Self::hash_password(password));
        self
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.users
            .get(name)
            .is_some_and(|hash| *hash == Self::hash_password(password))
    }

    /// Hashes a password using SHA-256, returning a lowercase hex string.
    pub fn hash_password(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Authenticator for PasswordAuthenticator {
    fn authenticate(&self, credentials: &Value) -> Result<Value, String> {
        let name = credentials["name"].as_str().unwrap_or_default();
        let password = credentials["password"].as_str().unwrap_or_default();
        if self.verify(name, password) {
            Ok(json!({ "name": name }))
        } else {
            Err("invalid credentials".to_string())
        }
    }
}

/// Lets everyone read, and only the listed users write.
#[derive(Debug, Clone, Default)]
pub struct WriterPolicy {
    writers: HashSet<String>,
}

impl WriterPolicy {
    pub fn new(writers: impl IntoIterator<Item = String>) -> Self {
        Self {
            writers: writers.into_iter().collect(),
        }
    }

    pub fn is_writer(&self, user: Option<&Value>) -> bool {
        user.and_then(|u| u["name"].as_str())
            .is_some_and(|name| self.writers.contains(name))
    }
}

impl AccessPolicy for WriterPolicy {
    fn check(&self, user: Option<&Value>, method: &str, _args: &[Value]) -> Result<(), String> {
        let is_write = Operation::from_method_name(method).map_or(true, |op| op.is_write());
        if is_write && !self.is_writer(user) {
            return Err("read-only access".to_string());
        }
        Ok(())
    }
}
