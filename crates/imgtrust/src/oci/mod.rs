//! OCI registry client for signatures, bundles and build attestations.
//!
//! Public API: no status code knowledge. All HTTP/status mapping in http.rs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::auth::{pull_scope, Credentials, RegistryAuth};
use crate::certificate::SignatureSource;
use crate::config::RegistryConfig;
use crate::error::{TrustError, TrustResult};
use crate::provenance::{ProvenanceFetcher, SLSA_V02_PREDICATE_TYPE};
use crate::reference::ImageReference;

mod http;

use http::{sha256_digest, HttpBackend, Target};

const USER_AGENT_VALUE: &str = concat!("imgtrust/", env!("CARGO_PKG_VERSION"));

/// Manifest media types accepted from registries.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Artifact type of sigstore bundles attached through the referrers API.
pub const SIGSTORE_BUNDLE_ARTIFACT_TYPE: &str = "application/vnd.dev.sigstore.bundle.v0.3+json";

/// Layer annotation holding the signer certificate on legacy `.sig` tags.
pub const COSIGN_CERTIFICATE_ANNOTATION: &str = "dev.sigstore.cosign/certificate";

const REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";
const REFERENCE_DIGEST_ANNOTATION: &str = "vnd.docker.reference.digest";
const ATTESTATION_MANIFEST: &str = "attestation-manifest";
const PREDICATE_TYPE_ANNOTATION: &str = "in-toto.io/predicate-type";

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Registry client.
#[derive(Debug, Clone)]
pub struct OciClient {
    http: HttpBackend,
}

impl OciClient {
    pub fn new(config: RegistryConfig) -> TrustResult<Self> {
        let credentials = Credentials::from_config(&config);
        Self::with_auth(config, RegistryAuth::new(credentials))
    }

    pub fn with_auth(config: RegistryConfig, auth: RegistryAuth) -> TrustResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| TrustError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http: HttpBackend {
                client,
                auth,
                config,
            },
        })
    }

    pub fn from_env() -> TrustResult<Self> {
        Self::new(RegistryConfig::from_env())
    }

    /// Manifest digest of `image`.
    ///
    /// A digest in the reference is returned as is. Otherwise the registry is
    /// asked with `HEAD`, falling back to hashing the manifest body when the
    /// registry does not send `Docker-Content-Digest`.
    pub async fn resolve_digest(&self, image: &ImageReference) -> TrustResult<String> {
        if let Some(digest) = &image.digest {
            return Ok(digest.clone());
        }

        let tag = image.require_tag()?;
        let url = self.manifest_url(image, tag);
        let repo = image.repository_path();
        let scope = pull_scope(&repo);
        let target = self.target(image, &scope);

        debug!(url = %url, "resolving manifest digest");
        let headers = self.http.head(&url, target, MANIFEST_ACCEPT).await?;

        if let Some(digest) = headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Ok(digest.to_string());
        }

        let body = self.http.get(&url, target, MANIFEST_ACCEPT).await?;
        Ok(sha256_digest(&body))
    }

    /// Raw manifest (or index) bytes for `reference` in the repository of `image`.
    pub async fn fetch_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
    ) -> TrustResult<Vec<u8>> {
        let url = self.manifest_url(image, reference);
        let scope = pull_scope(&image.repository_path());
        debug!(url = %url, "fetching manifest");

        let body = self
            .http
            .get(&url, self.target(image, &scope), MANIFEST_ACCEPT)
            .await?;

        if reference.starts_with("sha256:") {
            http::verify_digest(reference, &body)?;
        }

        Ok(body)
    }

    /// Blob bytes, checked against `digest`.
    pub async fn fetch_blob(&self, image: &ImageReference, digest: &str) -> TrustResult<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.http.base_url(image.registry_host()),
            image.repository_path(),
            digest
        );
        let scope = pull_scope(&image.repository_path());
        debug!(url = %url, "fetching blob");

        self.http
            .get_verified(&url, self.target(image, &scope), digest)
            .await
    }

    /// Referrers of `digest`, filtered by `artifact_type`.
    ///
    /// Registries without referrers for the digest answer 404; that is an
    /// empty list.
    pub async fn referrers(
        &self,
        image: &ImageReference,
        digest: &str,
        artifact_type: &str,
    ) -> TrustResult<Vec<Descriptor>> {
        let base = format!(
            "{}/v2/{}/referrers/{}",
            self.http.base_url(image.registry_host()),
            image.repository_path(),
            digest
        );
        let url = url::Url::parse_with_params(&base, &[("artifactType", artifact_type)])
            .map_err(|e| TrustError::Config {
                message: format!("invalid referrers url {}: {}", base, e),
            })?;
        let scope = pull_scope(&image.repository_path());
        debug!(url = %url, "listing referrers");

        let body = match self
            .http
            .get(
                url.as_str(),
                self.target(image, &scope),
                "application/vnd.oci.image.index.v1+json",
            )
            .await
        {
            Ok(body) => body,
            Err(TrustError::NotFound { .. }) => {
                debug!(digest = digest, "no referrers");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let index = parse_index(&body)?;

        // Registries may ignore the filter.
        Ok(index
            .manifests()
            .iter()
            .filter(|d| {
                d.artifact_type()
                    .as_ref()
                    .map_or(true, |t| t.to_string() == artifact_type)
            })
            .cloned()
            .collect())
    }

    fn manifest_url(&self, image: &ImageReference, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.http.base_url(image.registry_host()),
            image.repository_path(),
            reference
        )
    }

    fn target<'a>(&self, image: &'a ImageReference, scope: &'a str) -> Target<'a> {
        Target {
            registry: image.registry_host(),
            scope,
        }
    }
}

#[async_trait]
impl SignatureSource for OciClient {
    async fn fetch_bundle_certificates(&self, image: &ImageReference) -> TrustResult<Vec<Vec<u8>>> {
        let digest = self.resolve_digest(image).await?;
        let referrers = self
            .referrers(image, &digest, SIGSTORE_BUNDLE_ARTIFACT_TYPE)
            .await?;

        let mut certificates = Vec::new();
        for descriptor in referrers {
            let manifest = parse_manifest(
                &self
                    .fetch_manifest(image, &descriptor.digest().to_string())
                    .await?,
            )?;

            let Some(layer) = manifest.layers().first() else {
                debug!(digest = %descriptor.digest(), "bundle manifest has no layers");
                continue;
            };

            let bundle = self.fetch_blob(image, &layer.digest().to_string()).await?;
            if let Some(certificate) = bundle_certificate(&bundle)? {
                certificates.push(certificate);
            }
        }

        debug!(image = %image, count = certificates.len(), "bundle certificates");
        Ok(certificates)
    }

    async fn fetch_legacy_certificates(&self, image: &ImageReference) -> TrustResult<Vec<Vec<u8>>> {
        let digest = self.resolve_digest(image).await?;
        let tag = signature_tag(&digest);

        let bytes = match self.fetch_manifest(image, &tag).await {
            Ok(bytes) => bytes,
            Err(TrustError::NotFound { .. }) => {
                debug!(image = %image, tag = %tag, "no legacy signature tag");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let manifest = parse_manifest(&bytes)?;
        let certificates: Vec<Vec<u8>> = manifest
            .layers()
            .iter()
            .filter_map(|layer| annotation(layer, COSIGN_CERTIFICATE_ANNOTATION))
            .filter(|pem| !pem.trim().is_empty())
            .map(|pem| pem.as_bytes().to_vec())
            .collect();

        debug!(image = %image, count = certificates.len(), "legacy certificates");
        Ok(certificates)
    }
}

#[async_trait]
impl ProvenanceFetcher for OciClient {
    /// BuildKit attestations, as `{"<os>/<arch>": {"SLSA": <predicate>}}`.
    async fn fetch_build_provenance(&self, image: &ImageReference) -> TrustResult<Vec<u8>> {
        let reference = image
            .manifest_reference()
            .ok_or_else(|| TrustError::MissingImageTag {
                image: image.to_string(),
            })?;

        let bytes = self.fetch_manifest(image, reference).await?;
        let index = match serde_json::from_slice::<ImageIndex>(&bytes) {
            Ok(index) => index,
            Err(e) => {
                debug!(image = %image, error = %e, "image is not an index");
                return Err(TrustError::NotFound {
                    what: format!("provenance attestation for {}", image),
                });
            }
        };

        let platforms: HashMap<String, String> = index
            .manifests()
            .iter()
            .filter_map(|d| {
                d.platform()
                    .as_ref()
                    .map(|p| (d.digest().to_string(), platform_name(p)))
            })
            .collect();

        let mut document = BTreeMap::new();

        for attestation in index.manifests().iter().filter(|d| {
            annotation(d, REFERENCE_TYPE_ANNOTATION).as_deref() == Some(ATTESTATION_MANIFEST)
        }) {
            let Some(platform) = annotation(attestation, REFERENCE_DIGEST_ANNOTATION)
                .and_then(|digest| platforms.get(&digest).cloned())
            else {
                debug!(digest = %attestation.digest(), "attestation without platform");
                continue;
            };

            let manifest = parse_manifest(
                &self
                    .fetch_manifest(image, &attestation.digest().to_string())
                    .await?,
            )?;

            for layer in manifest.layers() {
                match annotation(layer, PREDICATE_TYPE_ANNOTATION) {
                    Some(kind) if kind != SLSA_V02_PREDICATE_TYPE => continue,
                    _ => {}
                }

                let statement = self.fetch_blob(image, &layer.digest().to_string()).await?;
                if let Some(predicate) = slsa_predicate(&statement)? {
                    document.insert(platform.clone(), serde_json::json!({ "SLSA": predicate }));
                    break;
                }
            }
        }

        if document.is_empty() {
            return Err(TrustError::NotFound {
                what: format!("provenance attestation for {}", image),
            });
        }

        serde_json::to_vec(&document).map_err(|e| TrustError::InvalidProvenance {
            message: e.to_string(),
        })
    }
}

fn parse_manifest(bytes: &[u8]) -> TrustResult<ImageManifest> {
    serde_json::from_slice(bytes).map_err(|e| TrustError::InvalidResponse {
        message: format!("failed to parse image manifest: {}", e),
    })
}

fn parse_index(bytes: &[u8]) -> TrustResult<ImageIndex> {
    serde_json::from_slice(bytes).map_err(|e| TrustError::InvalidResponse {
        message: format!("failed to parse image index: {}", e),
    })
}

fn annotation(descriptor: &Descriptor, key: &str) -> Option<String> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .cloned()
}

fn platform_name(platform: &oci_spec::image::Platform) -> String {
    match platform.variant() {
        Some(variant) if !variant.is_empty() => format!(
            "{}/{}/{}",
            platform.os(),
            platform.architecture(),
            variant
        ),
        _ => format!("{}/{}", platform.os(), platform.architecture()),
    }
}

/// Tag under which cosign stores signatures for `digest`.
pub fn signature_tag(digest: &str) -> String {
    format!("{}.sig", digest.replacen(':', "-", 1))
}

/// DER certificate of a sigstore bundle, if it carries one.
///
/// Bundles signed with a public key carry no certificate.
fn bundle_certificate(bundle: &[u8]) -> TrustResult<Option<Vec<u8>>> {
    let doc: Value = serde_json::from_slice(bundle).map_err(|e| TrustError::InvalidResponse {
        message: format!("failed to parse sigstore bundle: {}", e),
    })?;

    let material = &doc["verificationMaterial"];
    let raw = material["certificate"]["rawBytes"]
        .as_str()
        .or_else(|| material["x509CertificateChain"]["certificates"][0]["rawBytes"].as_str());

    let Some(raw) = raw else {
        return Ok(None);
    };

    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map(Some)
        .map_err(|e| TrustError::InvalidCertificate {
            reason: format!("bundle certificate is not base64: {}", e),
        })
}

/// `predicate` of an in-toto statement carrying SLSA v0.2 provenance.
fn slsa_predicate(statement: &[u8]) -> TrustResult<Option<Value>> {
    let mut doc: Value =
        serde_json::from_slice(statement).map_err(|e| TrustError::InvalidProvenance {
            message: format!("failed to parse in-toto statement: {}", e),
        })?;

    if doc["predicateType"].as_str() != Some(SLSA_V02_PREDICATE_TYPE) {
        return Ok(None);
    }

    Ok(doc.get_mut("predicate").map(Value::take))
}
