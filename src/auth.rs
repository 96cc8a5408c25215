//! User identities and the credentials attached to their requests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Basic,
    Bearer,
    Jwt,
    ApiKey,
}

impl FromStr for AuthType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthType::Basic),
            "bearer" => Ok(AuthType::Bearer),
            "jwt" => Ok(AuthType::Jwt),
            "apikey" | "api_key" => Ok(AuthType::ApiKey),
            other => Err(anyhow::anyhow!("unsupported auth type: {other}")),
        }
    }
}

/// One entry of the users file.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_header: Option<String>,
}

impl fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserConfig")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Credentials resolved for a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    /// `Authorization: Bearer <token>`, used for bearer and jwt users.
    Bearer(String),
    ApiKey { header: String, key: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
            Credentials::ApiKey { header, .. } => f
                .debug_struct("ApiKey")
                .field("header", header)
                .field("key", &"***")
                .finish(),
        }
    }
}

impl UserConfig {
    /// Credentials for this user, or `None` when the entry is incomplete.
    pub fn credentials(&self) -> Option<Credentials> {
        let auth_type = match self.auth_type.as_deref().map(str::parse::<AuthType>) {
            Some(Ok(auth_type)) => auth_type,
            Some(Err(err)) => {
                warn!("{err}");
                return None;
            }
            None => {
                warn!("User config has no authType");
                return None;
            }
        };

        let credentials = match auth_type {
            AuthType::Basic => match (&self.username, &self.password) {
                (Some(username), Some(password)) => Some(Credentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            },
            AuthType::Bearer | AuthType::Jwt => {
                self.token.clone().map(Credentials::Bearer)
            }
            AuthType::ApiKey => match (&self.api_key_header, &self.api_key) {
                (Some(header), Some(key)) => Some(Credentials::ApiKey {
                    header: header.clone(),
                    key: key.clone(),
                }),
                _ => None,
            },
        };

        if credentials.is_none() {
            warn!("Missing credential fields for {auth_type:?} authentication");
        }
        credentials
    }
}

/// Look up `user_id` and build its credentials. Unknown users and
/// incomplete entries yield `None` with a warning; the request is then
/// sent without authentication.
pub fn resolve_credentials(
    users: &HashMap<String, UserConfig>,
    user_id: &str,
) -> Option<Credentials> {
    let Some(user) = users.get(user_id) else {
        warn!("No user configuration found for '{user_id}', sending request without auth");
        return None;
    };
    let credentials = user.credentials();
    if credentials.is_some() {
        debug!("Applying credentials for user '{user_id}'");
    }
    credentials
}
