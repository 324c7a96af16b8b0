//! Signer certificate lookup and Fulcio extension extraction.
//!
//! Keyless signatures carry a Fulcio-issued certificate whose extensions
//! describe the build that produced the signature. The extractor reads:
//!
//! | OID | Field |
//! |-----|-------|
//! | `1.3.6.1.4.1.57264.1.12` | Source repository URI |
//! | `1.3.6.1.4.1.57264.1.13` | Source repository digest (commit) |
//! | `1.3.6.1.4.1.57264.1.14` | Source repository ref |
//! | `1.3.6.1.4.1.57264.1.20` | Build trigger |
//! | `1.3.6.1.4.1.57264.1.21` | Run invocation URI |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::{Decode, DecodePem};
use x509_cert::Certificate;

use crate::error::{TrustError, TrustResult};
use crate::provenance::{ProvenancePredicateV1, ResourceDescriptor};
use crate::reference::ImageReference;

/// Builder ID recorded when a provenance document has been enriched.
pub const ENRICHED_BUILDER_ID: &str =
    "https://github.com/rancherlabs/slsactl/tree/main/buildtypes/buildkit-gha/v1";

pub const OID_SOURCE_REPOSITORY_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.12");
pub const OID_SOURCE_REPOSITORY_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.13");
pub const OID_SOURCE_REPOSITORY_REF: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.14");
pub const OID_BUILD_TRIGGER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.20");
pub const OID_RUN_INVOCATION_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.21");

/// Source of signer certificates for an image.
///
/// Implementations return raw certificate bytes (DER or PEM), newest format first.
#[async_trait]
pub trait SignatureSource: Send + Sync {
    /// Certificates embedded in sigstore bundles attached to the image.
    async fn fetch_bundle_certificates(&self, image: &ImageReference)
        -> TrustResult<Vec<Vec<u8>>>;

    /// Certificates attached to legacy (`sha256-<hex>.sig`) signature objects.
    async fn fetch_legacy_certificates(&self, image: &ImageReference)
        -> TrustResult<Vec<Vec<u8>>>;
}

/// Source facts recovered from a signer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateOverride {
    pub source_commit_digest: String,
    pub source_repo_url: String,
    pub source_ref: String,
    pub build_trigger: String,
    pub invocation_uri: String,

    /// Git ref the build ran from; set when the certificate names one.
    pub resolved_ref: Option<String>,
}

impl CertificateOverride {
    /// Read the recognized Fulcio extensions from a certificate (DER or PEM).
    pub fn from_certificate(bytes: &[u8]) -> TrustResult<Self> {
        let cert = decode_certificate(bytes)?;
        let mut out = Self::default();

        let Some(extensions) = cert.tbs_certificate.extensions.as_ref() else {
            return Ok(out);
        };

        for ext in extensions {
            let slot = match ext.extn_id {
                id if id == OID_SOURCE_REPOSITORY_DIGEST => &mut out.source_commit_digest,
                id if id == OID_SOURCE_REPOSITORY_URI => &mut out.source_repo_url,
                id if id == OID_SOURCE_REPOSITORY_REF => &mut out.source_ref,
                id if id == OID_BUILD_TRIGGER => &mut out.build_trigger,
                id if id == OID_RUN_INVOCATION_URI => &mut out.invocation_uri,
                _ => continue,
            };

            match String::from_der(ext.extn_value.as_bytes()) {
                Ok(value) => *slot = value,
                Err(e) => debug!(oid = %ext.extn_id, error = %e, "skipping undecodable extension"),
            }
        }

        if !out.source_ref.is_empty() {
            out.resolved_ref = Some(out.source_ref.clone());
        }

        Ok(out)
    }

    /// Canonical-schema fragment merged into converted provenance.
    pub fn to_provenance_override(&self) -> ProvenancePredicateV1 {
        let mut dependency = ResourceDescriptor {
            uri: self.source_repo_url.clone(),
            digest: BTreeMap::from([("gitCommit".to_string(), self.source_commit_digest.clone())]),
            ..Default::default()
        };

        if let Some(git_ref) = &self.resolved_ref {
            dependency.annotations = Some(BTreeMap::from([(
                "ref".to_string(),
                Value::String(git_ref.clone()),
            )]));
        }

        let mut predicate = ProvenancePredicateV1::default();
        predicate.build_definition.internal_parameters = json!({
            "trigger": self.build_trigger,
            "invocationUri": self.invocation_uri,
        });
        predicate.build_definition.resolved_dependencies = vec![dependency];
        predicate.run_details.builder.id = ENRICHED_BUILDER_ID.to_string();
        predicate
    }
}

fn decode_certificate(bytes: &[u8]) -> TrustResult<Certificate> {
    let trimmed = bytes.trim_ascii_start();
    let result = if trimmed.starts_with(b"-----BEGIN") {
        Certificate::from_pem(trimmed)
    } else {
        Certificate::from_der(bytes)
    };

    result.map_err(|e| TrustError::InvalidCertificate {
        reason: e.to_string(),
    })
}

fn has_extensions(bytes: &[u8]) -> bool {
    decode_certificate(bytes)
        .map(|c| {
            c.tbs_certificate
                .extensions
                .as_ref()
                .is_some_and(|exts| !exts.is_empty())
        })
        .unwrap_or(false)
}

/// Finds the signer certificate of an image and extracts its source facts.
#[derive(Clone)]
pub struct CertificateExtractor {
    source: Arc<dyn SignatureSource>,
}

impl CertificateExtractor {
    pub fn new(source: Arc<dyn SignatureSource>) -> Self {
        Self { source }
    }

    /// Bundle certificates are tried first; legacy signatures are the fallback.
    pub async fn extract(&self, image: &ImageReference) -> TrustResult<CertificateOverride> {
        let bundle_certs = match self.source.fetch_bundle_certificates(image).await {
            Ok(certs) => certs,
            Err(e) => {
                debug!(image = %image, error = %e, "error fetching bundles");
                Vec::new()
            }
        };

        if let Some(cert) = bundle_certs.iter().find(|c| has_extensions(c)) {
            debug!(image = %image, "using certificate from signature bundle");
            return CertificateOverride::from_certificate(cert);
        }

        let legacy_certs = self.source.fetch_legacy_certificates(image).await?;
        if let Some(cert) = legacy_certs.iter().find(|c| has_extensions(c)) {
            debug!(image = %image, "using certificate from legacy signature");
            return CertificateOverride::from_certificate(cert);
        }

        Err(TrustError::NoCertificateFound {
            image: image.to_string(),
        })
    }
}

impl std::fmt::Debug for CertificateExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateExtractor").finish_non_exhaustive()
    }
}
