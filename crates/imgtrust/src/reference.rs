//! Container image reference parsing.
//!
//! Supports the usual reference shapes:
//! - `nginx:1.27` → default registry, single-segment repository
//! - `rancher/rke2:v1.31.14-rke2r1` → default registry, `org/repo`
//! - `registry.suse.com/bci/bci-base:15.6` → explicit registry
//! - `localhost:5000/foo/bar:v0.0.7` → registry with port
//! - `rancher/foo:v1@sha256:abc...` → tag pinned to a digest

use std::fmt;

use crate::error::{TrustError, TrustResult};

/// Registry host reported for references without an explicit registry.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const MIN_IMAGE_LEN: usize = 5;
const MAX_TAG_LEN: usize = 128;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host (with optional port), if given explicitly.
    pub registry: Option<String>,

    /// Repository path as written (may be multi-segment).
    pub repository: String,

    /// Tag, if present.
    pub tag: Option<String>,

    /// Digest (`algorithm:hex`), if present.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgtrust::ImageReference;
    ///
    /// let image = ImageReference::parse("registry.suse.com/bci/bci-base:15.6").unwrap();
    /// assert_eq!(image.registry_host(), "registry.suse.com");
    /// assert_eq!(image.repository, "bci/bci-base");
    /// assert_eq!(image.tag.as_deref(), Some("15.6"));
    ///
    /// let hub = ImageReference::parse("nginx:1.27").unwrap();
    /// assert_eq!(hub.repository_path(), "library/nginx");
    /// ```
    pub fn parse(raw: &str) -> TrustResult<Self> {
        let raw = raw.trim();

        if raw.len() < MIN_IMAGE_LEN {
            return Err(TrustError::invalid_image_name(raw, "image name too short"));
        }

        let (name, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                validate_digest(raw, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // The tag delimiter is the last ':' after the last '/', so that
        // `localhost:5000/foo` is not mistaken for a tag.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(pos) => {
                let colon = last_slash + pos;
                let tag = &name[colon + 1..];
                if tag.is_empty() {
                    return Err(TrustError::MissingImageTag {
                        image: raw.to_string(),
                    });
                }
                validate_tag(raw, tag)?;
                (&name[..colon], Some(tag.to_string()))
            }
            None => (name, None),
        };

        let (registry, repository) = split_registry(name);
        validate_repository(raw, repository)?;

        Ok(Self {
            registry: registry.map(String::from),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Registry host used for routing; the Docker Hub host when none was given.
    pub fn registry_host(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    /// Whether the reference points at the default registry.
    pub fn is_default_registry(&self) -> bool {
        match self.registry.as_deref() {
            None => true,
            Some(host) => matches!(host, "docker.io" | "index.docker.io" | "registry-1.docker.io"),
        }
    }

    /// Repository path as stored by the registry.
    ///
    /// Single-segment names on the default registry live under `library/`.
    pub fn repository_path(&self) -> String {
        if self.is_default_registry() && !self.repository.contains('/') {
            format!("library/{}", self.repository)
        } else {
            self.repository.clone()
        }
    }

    /// The tag, or `MissingImageTag` when the reference has none.
    pub fn require_tag(&self) -> TrustResult<&str> {
        self.tag.as_deref().ok_or_else(|| TrustError::MissingImageTag {
            image: self.to_string(),
        })
    }

    /// Tag if present, otherwise digest. Used to address manifests.
    pub fn manifest_reference(&self) -> Option<&str> {
        self.digest.as_deref().or(self.tag.as_deref())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn split_registry(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, name),
    }
}

fn validate_repository(raw: &str, repository: &str) -> TrustResult<()> {
    if repository.is_empty() {
        return Err(TrustError::invalid_image_name(raw, "empty repository"));
    }

    for segment in repository.split('/') {
        if segment.is_empty() {
            return Err(TrustError::invalid_image_name(
                raw,
                "repository contains an empty path segment",
            ));
        }

        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        {
            return Err(TrustError::invalid_image_name(
                raw,
                "repository may only contain lowercase letters, digits, '.', '_' and '-'",
            ));
        }
    }

    Ok(())
}

fn validate_tag(raw: &str, tag: &str) -> TrustResult<()> {
    if tag.len() > MAX_TAG_LEN {
        return Err(TrustError::invalid_image_name(raw, "tag longer than 128 characters"));
    }

    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);

    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(TrustError::invalid_image_name(
            raw,
            "tag may only contain letters, digits, '_', '.' and '-'",
        ));
    }

    Ok(())
}

fn validate_digest(raw: &str, digest: &str) -> TrustResult<()> {
    let valid = match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'))
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    };

    if !valid {
        return Err(TrustError::invalid_image_name(
            raw,
            "digest must have the form <algorithm>:<hex>",
        ));
    }

    Ok(())
}
