//! HTTP layer: status mapping, auth challenges, retry.
//!
//! This is the ONLY place for status code handling. oci/mod.rs never
//! interprets status codes.

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::auth::{Challenge, RegistryAuth};
use crate::config::RegistryConfig;
use crate::error::{TrustError, TrustResult};

/// Where a request goes and which pull scope it needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub registry: &'a str,
    pub scope: &'a str,
}

/// HTTP backend for registry requests (holds reqwest client, auth, config).
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) auth: RegistryAuth,
    pub(crate) config: RegistryConfig,
}

impl HttpBackend {
    /// Base URL of the registry API, e.g. `https://registry-1.docker.io`.
    pub(crate) fn base_url(&self, registry: &str) -> String {
        let host = api_host(registry);
        let scheme = if self.config.is_insecure(registry) || self.config.is_insecure(host) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    /// GET `url` and read the full body.
    pub(crate) async fn get(
        &self,
        url: &str,
        target: Target<'_>,
        accept: &str,
    ) -> TrustResult<Vec<u8>> {
        let response = self.request(Method::GET, url, target, accept).await?;
        let body = response.bytes().await.map_err(|e| TrustError::Network {
            message: format!("failed to read response body: {}", e),
        })?;

        Ok(body.to_vec())
    }

    /// HEAD `url`; only headers are returned.
    pub(crate) async fn head(
        &self,
        url: &str,
        target: Target<'_>,
        accept: &str,
    ) -> TrustResult<HeaderMap> {
        let response = self.request(Method::HEAD, url, target, accept).await?;
        Ok(response.headers().clone())
    }

    /// GET a blob and check it against its digest.
    pub(crate) async fn get_verified(
        &self,
        url: &str,
        target: Target<'_>,
        digest: &str,
    ) -> TrustResult<Vec<u8>> {
        let body = self.get(url, target, "*/*").await?;
        verify_digest(digest, &body)?;
        Ok(body)
    }

    /// Make a request, retrying transient failures.
    pub(crate) async fn request(
        &self,
        method: Method,
        url: &str,
        target: Target<'_>,
        accept: &str,
    ) -> TrustResult<reqwest::Response> {
        use rand::Rng;

        let mut retries = 0;
        let max_retries = self.config.max_retries;

        loop {
            let result = self.request_once(method.clone(), url, target, accept).await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;

                    let backoff = match &e {
                        TrustError::RateLimited {
                            retry_after: Some(retry_after),
                        } => {
                            let capped = (*retry_after).min(Duration::from_secs(30));
                            let base_ms = capped.as_millis() as u64;
                            let jitter_factor: f64 =
                                rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
                            let jittered_ms = ((base_ms as f64) * jitter_factor).round() as u64;
                            Duration::from_millis(jittered_ms.max(100))
                        }
                        _ => {
                            let base_backoff = Duration::from_secs(1 << retries);
                            let base_backoff = base_backoff.min(Duration::from_secs(30));
                            let jittered_ms =
                                rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
                            Duration::from_millis(jittered_ms.max(10))
                        }
                    };

                    warn!(
                        error = %e,
                        retry = retries,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis(),
                        "retrying request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(
        &self,
        method: Method,
        url: &str,
        target: Target<'_>,
        accept: &str,
    ) -> TrustResult<reqwest::Response> {
        let authorization = self.auth.authorization(target.registry, target.scope).await;
        let response = self
            .send(method.clone(), url, accept, authorization.as_deref())
            .await?;

        // One challenge round per attempt.
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            match challenge_of(&response) {
                Some(challenge) => {
                    debug!(registry = target.registry, "answering auth challenge");
                    let authorization = self
                        .auth
                        .respond(&self.client, target.registry, target.scope, &challenge)
                        .await?;
                    self.send(method, url, accept, Some(&authorization)).await?
                }
                None => response,
            }
        } else {
            response
        };

        map_status(url, response).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        accept: &str,
        authorization: Option<&str>,
    ) -> TrustResult<reqwest::Response> {
        let mut request = self.client.request(method, url).header(ACCEPT, accept);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        Ok(request.send().await?)
    }
}

fn challenge_of(response: &reqwest::Response) -> Option<Challenge> {
    response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(Challenge::parse)
}

async fn map_status(url: &str, response: reqwest::Response) -> TrustResult<reqwest::Response> {
    let status = response.status();

    match status.as_u16() {
        200..=299 => Ok(response),

        401 | 403 => Err(TrustError::Unauthorized {
            message: format!("HTTP {} for {}", status.as_u16(), url),
        }),

        404 => Err(TrustError::NotFound {
            what: url.to_string(),
        }),

        429 => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);

            Err(TrustError::RateLimited { retry_after })
        }

        _ => {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            Err(TrustError::Network {
                message: format!("HTTP {}: {}", status.as_u16(), message),
            })
        }
    }
}

/// Docker Hub serves its API from a different host than the one images name.
pub(crate) fn api_host(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => "registry-1.docker.io",
        other => other,
    }
}

/// `sha256:<hex>` of `bytes`.
pub(crate) fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Check `bytes` against a `sha256:` digest.
pub(crate) fn verify_digest(expected: &str, bytes: &[u8]) -> TrustResult<()> {
    let actual = sha256_digest(bytes);
    if expected.eq_ignore_ascii_case(&actual) {
        Ok(())
    } else {
        Err(TrustError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
