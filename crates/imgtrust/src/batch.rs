//! Image lists and per-image batch results.
//!
//! Image lists are the plain-text files products publish with each release
//! (`rancher-images.txt` and friends): one image per line, `#` comments.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TrustError, TrustResult};
use crate::reference::ImageReference;

/// Image lists are read up to this many bytes.
pub const MAX_LIST_BYTES: usize = 5 * (1 << 20);

const THIRD_PARTY_MARKER: &str = "rancher/mirrored";

/// Outcome of verifying one image of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub image: String,

    #[serde(default)]
    pub signed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEntry {
    pub fn from_result(image: impl Into<String>, result: &TrustResult<()>) -> Self {
        Self {
            image: image.into(),
            signed: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

/// Parse an image list, prefixing Docker Hub images with `registry` when given.
///
/// Blank lines and `#` comments are skipped and a leading `docker.io/` is dropped.
pub fn parse_image_list(content: &str, registry: Option<&str>) -> TrustResult<Vec<String>> {
    let prefix = registry
        .map(|r| r.trim().trim_end_matches('/'))
        .filter(|r| !r.is_empty());

    let mut images = Vec::new();
    let mut consumed = 0usize;

    for line in content.lines() {
        consumed += line.len() + 1;
        if consumed > MAX_LIST_BYTES {
            debug!(limit = MAX_LIST_BYTES, "image list truncated");
            break;
        }

        let image = line.trim();
        if image.is_empty() || image.starts_with('#') {
            continue;
        }

        let image = image.strip_prefix("docker.io/").unwrap_or(image);
        let parsed = ImageReference::parse(image)?;

        match prefix {
            Some(registry) if parsed.registry.is_none() => {
                images.push(format!("{}/{}", registry, image))
            }
            _ => images.push(image.to_string()),
        }
    }

    if images.is_empty() {
        return Err(TrustError::NotFound {
            what: "images in image list".to_string(),
        });
    }

    Ok(images)
}

/// Who publishes an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageClass {
    Official,
    ThirdParty,
}

impl ImageClass {
    pub fn of(image: &str) -> Self {
        if image.contains(THIRD_PARTY_MARKER) {
            Self::ThirdParty
        } else {
            Self::Official
        }
    }
}

impl fmt::Display for ImageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Official => f.write_str("official"),
            Self::ThirdParty => f.write_str("third-party"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassSummary {
    pub count: usize,
    pub signed: usize,
    pub errors: usize,
}

/// Per-class counts over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub official: ClassSummary,
    pub third_party: ClassSummary,
}

impl BatchSummary {
    pub fn class(&self, class: ImageClass) -> &ClassSummary {
        match class {
            ImageClass::Official => &self.official,
            ImageClass::ThirdParty => &self.third_party,
        }
    }

    pub fn total(&self) -> ClassSummary {
        ClassSummary {
            count: self.official.count + self.third_party.count,
            signed: self.official.signed + self.third_party.signed,
            errors: self.official.errors + self.third_party.errors,
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12}  {:>5}  {:>6}  {:>6}", "Image Type", "Count", "Signed", "Errors")?;
        for class in [ImageClass::Official, ImageClass::ThirdParty] {
            let s = self.class(class);
            if s.count == 0 {
                continue;
            }
            writeln!(
                f,
                "{:<12}  {:>5}  {:>6}  {:>6}",
                class.to_string(),
                s.count,
                s.signed,
                s.errors
            )?;
        }
        Ok(())
    }
}

pub fn summarize(entries: &[BatchEntry]) -> BatchSummary {
    let mut summary = BatchSummary::default();

    for entry in entries {
        let slot = match ImageClass::of(&entry.image) {
            ImageClass::Official => &mut summary.official,
            ImageClass::ThirdParty => &mut summary.third_party,
        };

        slot.count += 1;
        if entry.signed {
            slot.signed += 1;
        }
        if entry.error.is_some() {
            slot.errors += 1;
        }
    }

    summary
}
