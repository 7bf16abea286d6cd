//! Username/password resolution and connection string assembly.
//!
//! Credentials are resolved on every connection attempt so that a rotated
//! password file or environment is picked up by the next reconnect.

use crate::config::TargetConfig;
use crate::error::DbError;
use std::path::Path;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

// Never print the password
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Resolve credentials for a target
///
/// Precedence: `*_env` variables, then `password_file`, then inline values.
pub fn resolve(target: &TargetConfig) -> Result<Credentials, DbError> {
    resolve_with(target, |name| std::env::var(name).ok())
}

fn resolve_with<F>(target: &TargetConfig, lookup: F) -> Result<Credentials, DbError>
where
    F: Fn(&str) -> Option<String>,
{
    let username = match &target.username_env {
        Some(var) => Some(lookup(var).ok_or_else(|| {
            DbError::Other(format!("username environment variable '{}' is not set", var))
        })?),
        None => target.username.clone(),
    };

    let password = if let Some(var) = &target.password_env {
        Some(lookup(var).ok_or_else(|| {
            DbError::Other(format!("password environment variable '{}' is not set", var))
        })?)
    } else if let Some(path) = &target.password_file {
        Some(read_password_file(path)?)
    } else {
        target.password.clone()
    };

    Ok(Credentials { username, password })
}

fn read_password_file(path: &Path) -> Result<String, DbError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DbError::Other(format!("failed to read password file {}: {}", path.display(), e))
    })?;
    Ok(content.trim_end_matches(['\r', '\n']).to_string())
}

/// Merge resolved credentials into the target url
///
/// Credentials already present in the url are replaced. Urls without an
/// authority (e.g. `sqlite:`) are returned unchanged.
pub fn connection_url(url: &str, credentials: &Credentials) -> Result<String, DbError> {
    if credentials.username.is_none() && credentials.password.is_none() {
        return Ok(url.to_string());
    }

    let mut parsed = url::Url::parse(url)
        .map_err(|e| DbError::Other(format!("invalid connection url: {}", e)))?;

    if !parsed.has_host() {
        return Ok(url.to_string());
    }

    if let Some(username) = &credentials.username {
        parsed
            .set_username(username)
            .map_err(|_| DbError::Other("connection url cannot carry a username".to_string()))?;
    }
    if let Some(password) = &credentials.password {
        parsed
            .set_password(Some(password))
            .map_err(|_| DbError::Other("connection url cannot carry a password".to_string()))?;
    }

    Ok(parsed.to_string())
}
