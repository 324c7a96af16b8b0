//! Trust domains and the criteria each one verifies signatures against.
//!
//! | Domain | Scheme | Applies to |
//! |--------|--------|------------|
//! | `obs` | static key | `registry.suse.com`, BCI and Elemental images |
//! | `appco` | static key | `dp.apps.rancher.io`, `rancher/appco-*` |
//! | `gcp` | keyless, fixed identity | `registry.k8s.io`, mirrored sig-storage images |
//! | `gha` | keyless, derived identity | every image |

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{TrustError, TrustResult};
use crate::identity::IdentityResolver;
use crate::reference::ImageReference;

pub const OBS_KEY: &str = "https://ftp.suse.com/pub/projects/security/keys/container-key.pem";
pub const APPCO_KEY: &str = "https://apps.rancher.io/ap-pubkey.pem";
pub const GCP_IDENTITY: &str = "krel-trust@k8s-releng-prod.iam.gserviceaccount.com";
pub const GCP_ISSUER: &str = "https://accounts.google.com";
pub const GHA_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// What a signature must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyCriteria {
    /// Signed with a long-lived key.
    Key { key_ref: String, rekor_url: String },

    /// Signed keylessly by a certificate with this identity and issuer.
    Keyless {
        identity_regexp: String,
        issuer: String,
        rekor_url: String,
        new_bundle_format: bool,
    },
}

impl VerifyCriteria {
    pub fn rekor_url(&self) -> &str {
        match self {
            Self::Key { rekor_url, .. } | Self::Keyless { rekor_url, .. } => rekor_url,
        }
    }

    /// Annotations and claims in the signed payload are always checked.
    pub fn check_claims(&self) -> bool {
        true
    }
}

/// Performs cryptographic signature verification.
///
/// Implementations must report an image without signatures as
/// [`TrustError::NoSignatureFound`], distinct from a rejected signature.
#[async_trait]
pub trait UpstreamVerifier: Send + Sync {
    async fn verify(&self, image: &str, criteria: &VerifyCriteria) -> TrustResult<()>;
}

/// Static membership rules of a trust domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainMatcher {
    pub registries: &'static [&'static str],
    pub repositories: &'static [&'static str],
    pub prefixes: &'static [&'static str],
    pub catch_all: bool,
}

impl DomainMatcher {
    pub fn matches(&self, image: &ImageReference) -> bool {
        if self.catch_all {
            return true;
        }

        if let Some(registry) = &image.registry {
            if self.registries.contains(&registry.as_str()) {
                return true;
            }
        }

        let repo = image.repository.as_str();
        self.repositories.contains(&repo) || self.prefixes.iter().any(|p| repo.starts_with(p))
    }
}

const OBS_MATCHER: DomainMatcher = DomainMatcher {
    registries: &["registry.suse.com"],
    repositories: &[
        "rancher/elemental-operator",
        "rancher/seedimage-builder",
        "rancher/elemental-channel/sl-micro",
        "rancher/elemental-operator-crds-chart",
        "rancher/elemental-operator-chart",
    ],
    prefixes: &["bci/", "suse/", "rancher/mirrored-bci", "rancher/mirrored-elemental"],
    catch_all: false,
};

const APPCO_MATCHER: DomainMatcher = DomainMatcher {
    registries: &["dp.apps.rancher.io"],
    repositories: &[],
    prefixes: &["rancher/appco-"],
    catch_all: false,
};

const GCP_MATCHER: DomainMatcher = DomainMatcher {
    registries: &["registry.k8s.io"],
    repositories: &[
        "sig-storage/snapshot-controller",
        "sig-storage/snapshot-validation-webhook",
        "rancher/mirrored-sig-storage-csi-node-driver-registrar",
        "rancher/mirrored-sig-storage-csi-attacher",
        "rancher/mirrored-sig-storage-csi-provisioner",
        "rancher/mirrored-sig-storage-csi-resizer",
        "rancher/mirrored-sig-storage-csi-snapshotter",
        "rancher/mirrored-sig-storage-livenessprobe",
        "rancher/mirrored-sig-storage-snapshot-controller",
        "rancher/mirrored-kube-state-metrics-kube-state-metrics",
        "rancher/mirrored-cluster-api-controller",
    ],
    prefixes: &[],
    catch_all: false,
};

const GHA_MATCHER: DomainMatcher = DomainMatcher {
    registries: &[],
    repositories: &[],
    prefixes: &[],
    catch_all: true,
};

/// Collaborators a domain needs to verify an image.
#[derive(Clone)]
pub struct DomainContext {
    pub upstream: Arc<dyn UpstreamVerifier>,
    pub resolver: IdentityResolver,
    pub rekor_url: String,
}

impl fmt::Debug for DomainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainContext")
            .field("resolver", &self.resolver)
            .field("rekor_url", &self.rekor_url)
            .finish_non_exhaustive()
    }
}

/// A signing authority and the images it is trusted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustDomain {
    /// SUSE Open Build Service, static key.
    Obs,

    /// SUSE Application Collection, static key.
    AppCo,

    /// Kubernetes release images signed through Google Cloud.
    Gcp,

    /// Images signed by their own GitHub Actions release workflow.
    GitHubActions,
}

impl TrustDomain {
    /// The domains tried for every image, in order.
    pub fn defaults() -> &'static [TrustDomain] {
        &[Self::Obs, Self::AppCo, Self::Gcp, Self::GitHubActions]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Obs => "obs",
            Self::AppCo => "appco",
            Self::Gcp => "gcp",
            Self::GitHubActions => "gha",
        }
    }

    pub fn matcher(&self) -> &'static DomainMatcher {
        match self {
            Self::Obs => &OBS_MATCHER,
            Self::AppCo => &APPCO_MATCHER,
            Self::Gcp => &GCP_MATCHER,
            Self::GitHubActions => &GHA_MATCHER,
        }
    }

    pub fn matches(&self, image: &ImageReference) -> bool {
        self.matcher().matches(image)
    }

    /// Whether the domain applies to a raw image string; unparseable images never match.
    pub fn matches_str(&self, image: &str) -> bool {
        ImageReference::parse(image)
            .map(|parsed| self.matches(&parsed))
            .unwrap_or(false)
    }

    /// Criteria a signature on `image` must satisfy in this domain.
    pub async fn criteria(&self, image: &str, ctx: &DomainContext) -> TrustResult<VerifyCriteria> {
        let rekor_url = ctx.rekor_url.clone();

        let criteria = match self {
            Self::Obs => VerifyCriteria::Key {
                key_ref: OBS_KEY.to_string(),
                rekor_url,
            },
            Self::AppCo => VerifyCriteria::Key {
                key_ref: APPCO_KEY.to_string(),
                rekor_url,
            },
            Self::Gcp => VerifyCriteria::Keyless {
                identity_regexp: GCP_IDENTITY.to_string(),
                issuer: GCP_ISSUER.to_string(),
                rekor_url,
                new_bundle_format: false,
            },
            Self::GitHubActions => VerifyCriteria::Keyless {
                identity_regexp: ctx.resolver.resolve(image).await?,
                issuer: GHA_ISSUER.to_string(),
                rekor_url,
                new_bundle_format: true,
            },
        };

        Ok(criteria)
    }

    /// Verify `image` against this domain's criteria.
    pub async fn verify(&self, image: &str, ctx: &DomainContext) -> TrustResult<()> {
        let parsed = ImageReference::parse(image)?;
        if !self.matches(&parsed) {
            return Err(TrustError::InvalidImage {
                image: image.to_string(),
                domain: self.name().to_string(),
            });
        }

        let criteria = self.criteria(image, ctx).await?;
        debug!(image = image, domain = self.name(), criteria = ?criteria, "verifying signature");

        ctx.upstream.verify(image, &criteria).await
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
