//! SLSA provenance predicates and v0.2 → v1 conversion.
//!
//! JSON field names follow the SLSA Provenance v0.2 and v1 schemas. BuildKit
//! publishes v0.2 predicates, either one per platform
//! (`{"linux/amd64": {"SLSA": ...}}`) or as a single `{"SLSA": ...}` document.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{TrustError, TrustResult};
use crate::reference::ImageReference;

/// Build type BuildKit records in its provenance.
pub const BUILDKIT_BUILD_TYPE: &str = "https://mobyproject.org/buildkit@v1";

/// Predicate type of SLSA v0.2 provenance.
pub const SLSA_V02_PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v0.2";

/// Predicate type of SLSA v1 provenance.
pub const SLSA_V1_PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v1";

/// Source of BuildKit provenance documents.
#[async_trait]
pub trait ProvenanceFetcher: Send + Sync {
    /// Provenance of `image`, shaped like BuildKit's `{{json .Provenance}}` output.
    async fn fetch_build_provenance(&self, image: &ImageReference) -> TrustResult<Vec<u8>>;
}

fn is_null(value: &Value) -> bool {
    value.is_null()
}

/// Explicit `null` reads as the zero value, the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

// ----------------------------------------------------------------------------
// SLSA v0.2
// ----------------------------------------------------------------------------

/// SLSA v0.2 provenance predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenancePredicateV02 {
    #[serde(default, deserialize_with = "null_as_default")]
    pub builder: BuilderV02,

    #[serde(default, deserialize_with = "null_as_default")]
    pub build_type: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub invocation: Invocation,

    #[serde(default, skip_serializing_if = "is_null")]
    pub build_config: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataV02>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub materials: Vec<Material>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderV02 {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default, deserialize_with = "null_as_default")]
    pub config_source: ConfigSource,

    #[serde(default, skip_serializing_if = "is_null")]
    pub parameters: Value,

    #[serde(default, skip_serializing_if = "is_null")]
    pub environment: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub uri: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub digest: BTreeMap<String, String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub entry_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataV02 {
    #[serde(
        rename = "buildInvocationID",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub build_invocation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_started_on: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_finished_on: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub completeness: Completeness,

    #[serde(default, deserialize_with = "null_as_default")]
    pub reproducible: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completeness {
    #[serde(default, deserialize_with = "null_as_default")]
    pub parameters: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub environment: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub materials: bool,
}

/// A build input recorded by a v0.2 predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub uri: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub digest: BTreeMap<String, String>,
}

// ----------------------------------------------------------------------------
// SLSA v1
// ----------------------------------------------------------------------------

/// SLSA v1 provenance predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenancePredicateV1 {
    #[serde(default, deserialize_with = "null_as_default")]
    pub build_definition: BuildDefinition,

    #[serde(default, deserialize_with = "null_as_default")]
    pub run_details: RunDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDefinition {
    #[serde(default, deserialize_with = "null_as_default")]
    pub build_type: String,

    #[serde(default)]
    pub external_parameters: Value,

    #[serde(default, skip_serializing_if = "is_null")]
    pub internal_parameters: Value,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resolved_dependencies: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    #[serde(default, deserialize_with = "null_as_default")]
    pub builder: BuilderV1,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: BuildMetadata,

    #[serde(default, deserialize_with = "null_as_default")]
    pub byproducts: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderV1 {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub version: BTreeMap<String, String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub builder_dependencies: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub invocation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_on: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<DateTime<Utc>>,
}

/// In-toto resource descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub uri: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub digest: BTreeMap<String, String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub name: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub download_location: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub media_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, Value>>,
}

// ----------------------------------------------------------------------------
// Conversion
// ----------------------------------------------------------------------------

/// Convert a v0.2 predicate to v1, optionally merging an override.
///
/// Merge rules for the override:
/// - its resolved dependencies are appended after the converted materials;
/// - its builder ID is used only when non-empty;
/// - its internal parameters replace the converted ones when non-null.
pub fn convert_v02_to_v1(
    legacy: &ProvenancePredicateV02,
    override_predicate: Option<&ProvenancePredicateV1>,
) -> ProvenancePredicateV1 {
    let resolved_dependencies = legacy
        .materials
        .iter()
        .map(|m| ResourceDescriptor {
            uri: m.uri.clone(),
            digest: m.digest.clone(),
            ..Default::default()
        })
        .collect();

    let metadata = legacy
        .metadata
        .as_ref()
        .map(|m| BuildMetadata {
            invocation_id: m.build_invocation_id.clone(),
            started_on: m.build_started_on,
            finished_on: m.build_finished_on,
        })
        .unwrap_or_default();

    let mut predicate = ProvenancePredicateV1 {
        build_definition: BuildDefinition {
            build_type: legacy.build_type.clone(),
            external_parameters: legacy.invocation.parameters.clone(),
            internal_parameters: legacy.invocation.environment.clone(),
            resolved_dependencies,
        },
        run_details: RunDetails {
            builder: BuilderV1 {
                id: legacy.invocation.config_source.uri.clone(),
                ..Default::default()
            },
            metadata,
            byproducts: Vec::new(),
        },
    };

    if let Some(ov) = override_predicate {
        predicate
            .build_definition
            .resolved_dependencies
            .extend(ov.build_definition.resolved_dependencies.iter().cloned());

        if !ov.run_details.builder.id.is_empty() {
            predicate.run_details.builder.id = ov.run_details.builder.id.clone();
        }

        if !ov.build_definition.internal_parameters.is_null() {
            predicate.build_definition.internal_parameters =
                ov.build_definition.internal_parameters.clone();
        }
    }

    predicate
}

/// Parse a v0.2 predicate from JSON and convert it to v1.
pub fn convert_provenance(
    legacy_bytes: &[u8],
    override_predicate: Option<&ProvenancePredicateV1>,
) -> TrustResult<ProvenancePredicateV1> {
    let legacy: ProvenancePredicateV02 =
        serde_json::from_slice(legacy_bytes).map_err(|e| TrustError::InvalidProvenance {
            message: format!("failed to parse v0.2 predicate: {}", e),
        })?;

    Ok(convert_v02_to_v1(&legacy, override_predicate))
}

// ----------------------------------------------------------------------------
// BuildKit documents
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct SlsaEnvelope {
    #[serde(rename = "SLSA")]
    slsa: ProvenancePredicateV02,
}

/// BuildKit provenance document, as rendered by `{{json .Provenance}}`.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildKitProvenance {
    /// Single-platform image.
    Single(ProvenancePredicateV02),

    /// Multi-platform image, keyed by `os/arch[/variant]`.
    PerPlatform(BTreeMap<String, ProvenancePredicateV02>),
}

impl BuildKitProvenance {
    pub fn parse(bytes: &[u8]) -> TrustResult<Self> {
        let doc: Value = serde_json::from_slice(bytes).map_err(|e| TrustError::InvalidProvenance {
            message: format!("failed to parse provenance document: {}", e),
        })?;

        let invalid = |e: serde_json::Error| TrustError::InvalidProvenance {
            message: format!("unexpected provenance document shape: {}", e),
        };

        if doc.get("SLSA").is_some() {
            let env: SlsaEnvelope = serde_json::from_value(doc).map_err(invalid)?;
            return Ok(Self::Single(env.slsa));
        }

        let platforms: BTreeMap<String, SlsaEnvelope> =
            serde_json::from_value(doc).map_err(invalid)?;

        Ok(Self::PerPlatform(
            platforms.into_iter().map(|(k, v)| (k, v.slsa)).collect(),
        ))
    }

    /// Predicate for `platform` (case-insensitive).
    ///
    /// Single-platform documents are returned whatever platform is asked for.
    pub fn select(&self, platform: &str) -> TrustResult<&ProvenancePredicateV02> {
        match self {
            Self::Single(predicate) => Ok(predicate),
            Self::PerPlatform(platforms) => platforms
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(platform))
                .map(|(_, predicate)| predicate)
                .ok_or_else(|| {
                    debug!(
                        platform = platform,
                        available = ?platforms.keys().collect::<Vec<_>>(),
                        "platform not in provenance document"
                    );
                    TrustError::UnsupportedPlatform {
                        platform: platform.to_string(),
                    }
                }),
        }
    }
}

/// Output format for image provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvenanceFormat {
    /// The predicate as recorded by BuildKit.
    #[default]
    SlsaV02,

    /// Converted and enriched with signer certificate facts.
    SlsaV1,
}

impl fmt::Display for ProvenanceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlsaV02 => write!(f, "slsav0.2"),
            Self::SlsaV1 => write!(f, "slsav1"),
        }
    }
}

impl FromStr for ProvenanceFormat {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slsav0.2" | "" => Ok(Self::SlsaV02),
            "slsav1" => Ok(Self::SlsaV1),
            other => Err(TrustError::Config {
                message: format!("unsupported provenance format: {:?}", other),
            }),
        }
    }
}

/// Provenance predicate in the requested format.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageProvenance {
    V02(ProvenancePredicateV02),
    V1(ProvenancePredicateV1),
}

impl ImageProvenance {
    pub fn predicate_type(&self) -> &'static str {
        match self {
            Self::V02(_) => SLSA_V02_PREDICATE_TYPE,
            Self::V1(_) => SLSA_V1_PREDICATE_TYPE,
        }
    }

    pub fn to_json_pretty(&self) -> TrustResult<String> {
        let out = match self {
            Self::V02(p) => serde_json::to_string_pretty(p),
            Self::V1(p) => serde_json::to_string_pretty(p),
        };
        out.map_err(|e| TrustError::InvalidProvenance {
            message: format!("failed to serialize predicate: {}", e),
        })
    }
}
