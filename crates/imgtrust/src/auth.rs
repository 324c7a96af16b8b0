//! Registry authentication.
//!
//! Registries answer unauthenticated requests with `401` and a challenge:
//!
//! ```text
//! WWW-Authenticate: Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:rancher/rke2:pull"
//! ```
//!
//! The client then asks the realm for a token (anonymously, or with basic
//! credentials when configured) and retries. Tokens are cached per registry
//! and scope until shortly before they expire.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::error::{TrustError, TrustResult};

/// Lifetime assumed for tokens issued without `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 60;

/// Tokens are dropped this long before they expire.
const EXPIRY_BUFFER_SECS: i64 = 10;

/// Credentials presented to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Anonymous token exchange.
    Anonymous,

    /// Username and password, sent to the token realm.
    Basic { username: String, password: String },

    /// Pre-issued bearer token, sent as is.
    Bearer(String),
}

impl Credentials {
    /// Pick credentials from config: a static token wins over username and password.
    pub fn from_config(config: &RegistryConfig) -> Self {
        if let Some(token) = config.token.as_ref().filter(|t| !t.is_empty()) {
            return Self::Bearer(token.clone());
        }

        match (&config.username, &config.password) {
            (Some(username), Some(password)) => Self::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Self::Anonymous,
        }
    }
}

/// Authentication scheme requested by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(params);
        let realm = params.get("realm")?.clone();

        Some(Self::Bearer {
            realm,
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// `key="value",key=value` pairs; commas inside quotes are kept.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        out.insert(key, value.trim().to_string());
        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    out
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,

    #[serde(default)]
    access_token: Option<String>,

    #[serde(default)]
    expires_in: Option<i64>,
}

/// Credentials plus the bearer tokens obtained with them.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    credentials: Credentials,
    tokens: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl RegistryAuth {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// `Authorization` header to send before any challenge was seen.
    pub async fn authorization(&self, registry: &str, scope: &str) -> Option<String> {
        if let Credentials::Bearer(token) = &self.credentials {
            return Some(format!("Bearer {}", token));
        }

        let cache = self.tokens.read().await;
        cache
            .get(&cache_key(registry, scope))
            .filter(|cached| cached.expires_at > Utc::now())
            .map(|cached| format!("Bearer {}", cached.token))
    }

    /// Answer a challenge, returning the `Authorization` header to retry with.
    pub async fn respond(
        &self,
        client: &reqwest::Client,
        registry: &str,
        scope: &str,
        challenge: &Challenge,
    ) -> TrustResult<String> {
        match (challenge, &self.credentials) {
            (Challenge::Basic, Credentials::Basic { username, password }) => {
                use base64::Engine as _;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                Ok(format!("Basic {}", encoded))
            }
            (Challenge::Basic, _) => Err(TrustError::Unauthorized {
                message: format!("{} requires basic credentials", registry),
            }),
            (Challenge::Bearer { .. }, Credentials::Bearer(_)) => Err(TrustError::Unauthorized {
                message: format!("{} rejected the configured token", registry),
            }),
            (
                Challenge::Bearer {
                    realm,
                    service,
                    scope: challenge_scope,
                },
                _,
            ) => {
                let requested = challenge_scope.as_deref().unwrap_or(scope);
                let token = self
                    .exchange(client, realm, service.as_deref(), requested)
                    .await?;
                // Cached under the request scope, not the challenge scope.
                self.store(registry, scope, &token).await;
                Ok(format!("Bearer {}", token.token))
            }
        }
    }

    async fn exchange(
        &self,
        client: &reqwest::Client,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> TrustResult<CachedToken> {
        let mut url = url::Url::parse(realm).map_err(|e| TrustError::Unauthorized {
            message: format!("invalid token realm {:?}: {}", realm, e),
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }

        debug!(realm = realm, scope = scope, "requesting registry token");

        let mut request = client.get(url);
        if let Credentials::Basic { username, password } = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| TrustError::Network {
            message: format!("failed to request registry token: {}", e),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TrustError::Unauthorized {
                message: format!("token request to {} was refused", realm),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrustError::Network {
                message: format!("token request failed: HTTP {} - {}", status.as_u16(), body),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| TrustError::Network {
            message: format!("failed to parse token response: {}", e),
        })?;

        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TrustError::Unauthorized {
                message: "token response carried no token".to_string(),
            })?;

        let lifetime = body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = Utc::now() + Duration::seconds(lifetime - EXPIRY_BUFFER_SECS);

        info!(scope = scope, expires_in = lifetime, "obtained registry token");

        Ok(CachedToken { token, expires_at })
    }

    async fn store(&self, registry: &str, scope: &str, token: &CachedToken) {
        let now = Utc::now();
        let mut cache = self.tokens.write().await;
        cache.retain(|_, cached| cached.expires_at > now);
        cache.insert(cache_key(registry, scope), token.clone());
    }

    /// Drop every cached token.
    pub async fn clear_cache(&self) {
        self.tokens.write().await.clear();
    }
}

fn cache_key(registry: &str, scope: &str) -> String {
    format!("{}|{}", registry, scope)
}

/// Pull scope for a repository.
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}
