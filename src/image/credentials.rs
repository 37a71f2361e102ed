//! Registry credentials from the engine client's config file.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::engine::RegistryAuth;
use crate::errors::{Result, StackError};

#[derive(Debug, Default, Deserialize)]
struct ClientConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,
}

impl ClientConfig {
    /// Credential helper configured for `registry`, if any. Helpers are not
    /// executed; only inline `auths` entries are read.
    fn helper(&self, registry: &str) -> Option<&str> {
        self.cred_helpers
            .get(registry)
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// `~/.docker/config.json`, or `$DOCKER_CONFIG/config.json` when set.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Resolve credentials for `registry`. A stored entry supplies the username
/// (and password); `token`, when given, always replaces the password.
pub fn resolve(config: Option<&Path>, registry: &str, token: Option<&str>) -> Result<RegistryAuth> {
    let credential_error = |message: String| StackError::Credential {
        registry: registry.to_string(),
        message,
    };

    let stored = match config {
        Some(path) => read_entry(path, registry).map_err(credential_error)?,
        None => None,
    };

    let (username, password) = match stored {
        Some(entry) => decode(entry).map_err(credential_error)?,
        None => {
            debug!(%registry, "no stored credentials for registry");
            (None, None)
        }
    };

    Ok(RegistryAuth {
        username,
        password: token.map(str::to_string).or(password),
        server_address: registry.to_string(),
    })
}

fn read_entry(path: &Path, registry: &str) -> std::result::Result<Option<AuthEntry>, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
    };
    let mut config: ClientConfig = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
    if let Some(helper) = config.helper(registry) {
        debug!(%registry, %helper, "credential helper configured but not consulted");
    }

    let entry = config.auths.remove(registry).or_else(|| {
        let with_scheme = format!("https://{}", registry);
        config.auths.remove(&with_scheme)
    });
    Ok(entry)
}

fn decode(entry: AuthEntry) -> std::result::Result<(Option<String>, Option<String>), String> {
    let Some(encoded) = entry.auth.filter(|a| !a.is_empty()) else {
        return Ok((entry.username, entry.password));
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid auth value: {}", e))?;
    let decoded = String::from_utf8(bytes).map_err(|e| format!("invalid auth value: {}", e))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| "invalid auth value: expected user:password".to_string())?;
    Ok((Some(user.to_string()), Some(pass.to_string())))
}
