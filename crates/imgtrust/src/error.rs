//! Error types for image trust resolution and verification.

use std::fmt;
use std::time::Duration;

/// A single failed verification attempt, tagged with the domain that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainFailure {
    /// Trust domain name (e.g. `obs`, `gha`).
    pub domain: String,

    /// Error message as reported by the domain.
    pub message: String,
}

impl fmt::Display for DomainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.domain, self.message)
    }
}

/// Trust errors.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// Image reference is too short or malformed.
    #[error("invalid image name: {image:?}: {reason}")]
    InvalidImageName { image: String, reason: String },

    /// Image reference carries no tag where one is required.
    #[error("missing image tag: {image:?}")]
    MissingImageTag { image: String },

    /// Image reference shape cannot be mapped to a source repository.
    #[error("unsupported image name: {image:?}")]
    UnsupportedImageName { image: String },

    /// A domain was asked to verify an image it does not cover.
    #[error("invalid image {image:?} for domain {domain}")]
    InvalidImage { image: String, domain: String },

    /// No trust domain matched the image.
    #[error("no verifier found for image: {image:?}")]
    NoVerifierFound { image: String },

    /// No signature is attached to the image for the attempted domain(s).
    #[error("no signatures found for image: {image:?}")]
    NoSignatureFound { image: String },

    /// A single verification attempt was rejected.
    #[error("signature verification failed: {reason}")]
    SignatureRejected { reason: String },

    /// Every matched domain failed and at least one failure was not a missing signature.
    #[error("verification failed for image {image:?}: {}", join_failures(.failures))]
    VerificationFailed {
        image: String,
        failures: Vec<DomainFailure>,
    },

    /// Mutable tag whose signer certificate does not name the source ref.
    #[error("missing provenance ref for image {image:?}: {reason}")]
    MissingProvenanceRef { image: String, reason: String },

    /// Neither a signature bundle nor a legacy signature yielded a certificate.
    #[error("no signature or bundle found for image: {image:?}")]
    NoCertificateFound { image: String },

    /// Certificate bytes could not be decoded.
    #[error("invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    /// Provenance document is not valid JSON for the expected schema.
    #[error("invalid provenance: {message}")]
    InvalidProvenance { message: String },

    /// Provenance document has no predicate for the requested platform.
    #[error("platform not supported: {platform:?}")]
    UnsupportedPlatform { platform: String },

    /// Provenance build type cannot be enriched.
    #[error("image buildType not supported: {build_type:?}")]
    UnsupportedBuildType { build_type: String },

    /// Registry object not found.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Registry rejected the credentials.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Registry content does not hash to the digest it was addressed by.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Registry answered with a document that could not be parsed.
    #[error("invalid registry response: {message}")]
    InvalidResponse { message: String },

    /// Rate limit exceeded.
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Network error.
    #[error("network error: {message}")]
    Network { message: String },

    /// Verification did not finish before the deadline.
    #[error("verification of {image:?} timed out after {after:?}")]
    Timeout { image: String, after: Duration },

    /// The upstream verifier could not be run.
    #[error("upstream verifier error: {message}")]
    Upstream { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

fn join_failures(failures: &[DomainFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl TrustError {
    /// Exit code for CLI front-ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Input / routing / config
            Self::InvalidImageName { .. } => 1,
            Self::MissingImageTag { .. } => 1,
            Self::UnsupportedImageName { .. } => 1,
            Self::InvalidImage { .. } => 1,
            Self::NoVerifierFound { .. } => 1,
            Self::Config { .. } => 1,

            // Auth
            Self::Unauthorized { .. } => 2,

            Self::NoSignatureFound { .. } => 3,

            // Security failures
            Self::SignatureRejected { .. } => 4,
            Self::VerificationFailed { .. } => 4,

            // Transient
            Self::RateLimited { .. } => 5,
            Self::Network { .. } => 5,
            Self::Timeout { .. } => 5,

            // Data
            Self::MissingProvenanceRef { .. } => 6,
            Self::NoCertificateFound { .. } => 6,
            Self::InvalidCertificate { .. } => 6,
            Self::InvalidProvenance { .. } => 6,
            Self::UnsupportedPlatform { .. } => 6,
            Self::UnsupportedBuildType { .. } => 6,
            Self::NotFound { .. } => 6,
            Self::DigestMismatch { .. } => 6,
            Self::InvalidResponse { .. } => 6,
            Self::Upstream { .. } => 6,
        }
    }

    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network { .. })
    }

    /// Whether the error means "no signature attached" rather than a rejection.
    pub fn is_missing_signature(&self) -> bool {
        matches!(self, Self::NoSignatureFound { .. })
    }

    pub(crate) fn invalid_image_name(image: &str, reason: impl Into<String>) -> Self {
        Self::InvalidImageName {
            image: image.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for TrustError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for trust operations.
pub type TrustResult<T> = Result<T, TrustError>;
