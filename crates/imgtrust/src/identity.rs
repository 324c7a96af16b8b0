//! Signer identity resolution for images built by GitHub Actions.
//!
//! An image `rancher/rke2:v1.31.14-rke2r1` is expected to be signed by the
//! release workflow of `github.com/rancher/rke2` running for the Git tag
//! `v1.31.14+rke2r1`. The resolver derives that identity as a regular
//! expression understood by the upstream verifier.

use tracing::debug;

use crate::certificate::CertificateExtractor;
use crate::error::{TrustError, TrustResult};
use crate::mapping::{
    extra_suffixes, identity_overrides, is_mutable, override_repo, ARCH_SUFFIXES,
    SEPARATOR_REWRITES, VERSION_PREFIX_FAMILIES,
};
use crate::reference::ImageReference;

/// Result of the table-driven part of identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticIdentity {
    /// Complete identity pattern.
    Identity(String),

    /// The tag is mutable; the ref must be read from the signer certificate.
    NeedsCertificate {
        image: ImageReference,
        repo: String,
    },
}

/// Resolves the expected signer identity of an image.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    extractor: Option<CertificateExtractor>,
}

impl IdentityResolver {
    /// Resolver that reads signer certificates for mutable tags.
    pub fn new(extractor: CertificateExtractor) -> Self {
        Self {
            extractor: Some(extractor),
        }
    }

    /// Resolver without a certificate source; mutable tags fail to resolve.
    pub fn offline() -> Self {
        Self::default()
    }

    /// Resolve an identity from the image name and static tables only.
    pub fn resolve_static(image: &str) -> TrustResult<StaticIdentity> {
        let parsed = ImageReference::parse(image)?;
        let (repo, tag) = repo_and_ref(image, &parsed)?;

        if is_mutable(&repo, &tag) {
            return Ok(StaticIdentity::NeedsCertificate { image: parsed, repo });
        }

        let git_ref = rewrite_ref(&repo, &tag);
        let source_repo = override_repo(&repo);

        Ok(StaticIdentity::Identity(compose(
            source_repo,
            &format!("refs/tags/{}", git_ref),
        )))
    }

    /// Resolve the identity, consulting the signer certificate for mutable tags.
    pub async fn resolve(&self, image: &str) -> TrustResult<String> {
        match Self::resolve_static(image)? {
            StaticIdentity::Identity(identity) => Ok(identity),
            StaticIdentity::NeedsCertificate { image: parsed, repo } => {
                self.resolve_mutable(&parsed, &repo).await
            }
        }
    }

    async fn resolve_mutable(&self, image: &ImageReference, repo: &str) -> TrustResult<String> {
        let Some(extractor) = &self.extractor else {
            return Err(TrustError::MissingProvenanceRef {
                image: image.to_string(),
                reason: "no certificate source configured".to_string(),
            });
        };

        let data = extractor.extract(image).await?;
        let git_ref = match data.resolved_ref.as_deref() {
            Some(r) if !r.is_empty() => r,
            _ => {
                return Err(TrustError::MissingProvenanceRef {
                    image: image.to_string(),
                    reason: "signer certificate does not name a source ref".to_string(),
                })
            }
        };

        debug!(image = %image, git_ref = git_ref, "resolved mutable tag from certificate");

        let escaped = regex::escape(git_ref);
        let full_ref = if escaped.starts_with("refs/") {
            escaped
        } else {
            format!("refs/tags/{}", escaped)
        };

        Ok(compose(override_repo(repo), &full_ref))
    }
}

/// `(org/repo, tag)` of an image, keeping the last two repository segments.
fn repo_and_ref(image: &str, parsed: &ImageReference) -> TrustResult<(String, String)> {
    let tag = parsed.require_tag()?.to_string();

    let path = parsed
        .repository
        .strip_prefix("library/")
        .unwrap_or(&parsed.repository);
    let segments: Vec<&str> = path.split('/').collect();

    if segments.len() < 2 {
        return Err(TrustError::UnsupportedImageName {
            image: image.to_string(),
        });
    }

    let repo = segments[segments.len() - 2..].join("/");
    Ok((repo, tag))
}

fn rewrite_ref(repo: &str, tag: &str) -> String {
    let mut git_ref = tag.to_string();

    if let Some(rule) = SEPARATOR_REWRITES
        .iter()
        .find(|r| repo.starts_with(r.repo_prefix))
    {
        git_ref = git_ref.replacen(rule.needle, rule.replacement, 1);
    }

    if VERSION_PREFIX_FAMILIES.iter().any(|f| repo.contains(f)) {
        git_ref.insert(0, 'v');
    }

    for suffix in ARCH_SUFFIXES.iter().chain(extra_suffixes(repo)) {
        if let Some(len) = git_ref.strip_suffix(suffix).map(str::len) {
            git_ref.truncate(len);
        }
    }

    git_ref
}

fn compose(source_repo: &str, full_ref: &str) -> String {
    if let Some(identity) = identity_overrides().get(source_repo) {
        return (*identity).to_string();
    }

    format!(
        "^https://github.com/{}/.github/workflows/release.(yml|yaml)@{}$",
        source_repo, full_ref
    )
}
