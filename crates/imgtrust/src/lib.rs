//! Trust resolution and verification for container images.
//!
//! This crate decides who is allowed to have signed an image and checks it:
//!
//! - Image reference parsing and per-repository mapping tables
//! - Trust domains (OBS, AppCo, GCP, GitHub Actions) with their signing criteria
//! - Signer identity resolution, including mutable tags resolved through the
//!   signing certificate's source-ref extension
//! - Verification orchestration over every matched domain, alone or in batches
//! - BuildKit SLSA v0.2 provenance retrieval and conversion to SLSA v1
//!
//! # Quick Start
//!
//! ```no_run
//! use imgtrust::ImageVerifier;
//!
//! # async fn example() -> imgtrust::TrustResult<()> {
//! let verifier = ImageVerifier::from_env()?;
//!
//! verifier.verify_image("rancher/rke2-runtime:v1.31.14-rke2r1").await?;
//! println!(
//!     "{}",
//!     verifier.resolve_identity("rancher/rke2-runtime:v1.31.14-rke2r1").await?
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `IMGTRUST_TIMEOUT` | Per-image deadline in seconds (default: 45) |
//! | `IMGTRUST_REKOR_URL` | Transparency log URL (default: `https://rekor.sigstore.dev`) |
//! | `IMGTRUST_COSIGN_BIN` | cosign executable (default: `cosign`) |
//! | `IMGTRUST_MAX_WORKERS` | Batch concurrency (default: 4) |
//! | `IMGTRUST_REGISTRY_TIMEOUT` | Registry request timeout in seconds (default: 30) |
//! | `IMGTRUST_REGISTRY_MAX_RETRIES` | Max retries for transient failures (default: 3) |
//! | `IMGTRUST_INSECURE_REGISTRIES` | Comma-separated hosts reached over HTTP |
//! | `IMGTRUST_REGISTRY_USERNAME` | Username for registry token exchange |
//! | `IMGTRUST_REGISTRY_PASSWORD` | Password for registry token exchange |
//! | `IMGTRUST_REGISTRY_TOKEN` | Static registry bearer token |

pub mod auth;
pub mod batch;
pub mod certificate;
pub mod config;
pub mod cosign;
pub mod domain;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod oci;
pub mod provenance;
pub mod reference;
pub mod verifier;

// Re-export main types
pub use auth::{Challenge, Credentials, RegistryAuth};
pub use batch::{parse_image_list, summarize, BatchEntry, BatchSummary, ClassSummary, ImageClass};
pub use certificate::{CertificateExtractor, CertificateOverride, SignatureSource};
pub use config::{RegistryConfig, TrustConfig, DEFAULT_REKOR_URL};
pub use cosign::CosignCli;
pub use domain::{DomainContext, TrustDomain, UpstreamVerifier, VerifyCriteria};
pub use error::{DomainFailure, TrustError, TrustResult};
pub use identity::{IdentityResolver, StaticIdentity};
pub use oci::OciClient;
pub use provenance::{
    convert_provenance, convert_v02_to_v1, BuildKitProvenance, ImageProvenance,
    ProvenanceFetcher, ProvenanceFormat, ProvenancePredicateV02, ProvenancePredicateV1,
};
pub use reference::ImageReference;
pub use verifier::ImageVerifier;
