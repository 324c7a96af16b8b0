//! Verification orchestrator.
//!
//! Every trust domain whose matcher accepts an image is tried in order. A
//! domain answering "no signature" is skipped; the first success wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::batch::BatchEntry;
use crate::certificate::{CertificateExtractor, SignatureSource};
use crate::config::{TrustConfig, DEFAULT_REKOR_URL};
use crate::cosign::CosignCli;
use crate::domain::{DomainContext, TrustDomain, UpstreamVerifier};
use crate::error::{DomainFailure, TrustError, TrustResult};
use crate::identity::IdentityResolver;
use crate::oci::OciClient;
use crate::provenance::{
    convert_v02_to_v1, BuildKitProvenance, ImageProvenance, ProvenanceFetcher, ProvenanceFormat,
    BUILDKIT_BUILD_TYPE,
};
use crate::reference::ImageReference;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_WORKERS: usize = 4;

/// Verifies container images against their trust domains.
#[derive(Clone)]
pub struct ImageVerifier {
    domains: Vec<TrustDomain>,
    ctx: DomainContext,
    extractor: CertificateExtractor,
    provenance: Option<Arc<dyn ProvenanceFetcher>>,
    timeout: Duration,
    max_workers: usize,
}

impl ImageVerifier {
    pub fn new(upstream: Arc<dyn UpstreamVerifier>, signatures: Arc<dyn SignatureSource>) -> Self {
        let extractor = CertificateExtractor::new(signatures);

        Self {
            domains: TrustDomain::defaults().to_vec(),
            ctx: DomainContext {
                upstream,
                resolver: IdentityResolver::new(extractor.clone()),
                rekor_url: DEFAULT_REKOR_URL.to_string(),
            },
            extractor,
            provenance: None,
            timeout: DEFAULT_TIMEOUT,
            max_workers: DEFAULT_WORKERS,
        }
    }

    /// Build a verifier backed by the registry client and the cosign CLI.
    pub fn from_config(config: &TrustConfig) -> TrustResult<Self> {
        let oci = Arc::new(OciClient::new(config.registry.clone())?);
        let cosign = Arc::new(CosignCli::new(&config.cosign_bin));

        let mut verifier = Self::new(cosign, oci.clone()).with_provenance_fetcher(oci);
        verifier.ctx.rekor_url = config.rekor_url.clone();
        verifier.timeout = config.timeout();
        verifier.max_workers = config.max_workers.max(1);
        Ok(verifier)
    }

    pub fn from_env() -> TrustResult<Self> {
        Self::from_config(&TrustConfig::from_env())
    }

    /// Restrict or reorder the trust domains that are tried.
    pub fn with_domains(mut self, domains: impl Into<Vec<TrustDomain>>) -> Self {
        self.domains = domains.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rekor_url(mut self, url: impl Into<String>) -> Self {
        self.ctx.rekor_url = url.into();
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_provenance_fetcher(mut self, fetcher: Arc<dyn ProvenanceFetcher>) -> Self {
        self.provenance = Some(fetcher);
        self
    }

    pub fn domains(&self) -> &[TrustDomain] {
        &self.domains
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Verify the signature of `image`.
    ///
    /// Errors:
    /// - `NoVerifierFound` when no domain covers the image (nothing is fetched);
    /// - `NoSignatureFound` when every matched domain found no signature;
    /// - `VerificationFailed` when some domain rejected the image, listing every attempt;
    /// - `Timeout` when the deadline expires.
    pub async fn verify_image(&self, image: &str) -> TrustResult<()> {
        match tokio::time::timeout(self.timeout, self.verify_matched(image)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(image = image, timeout_ms = self.timeout.as_millis(), "verification timed out");
                Err(TrustError::Timeout {
                    image: image.to_string(),
                    after: self.timeout,
                })
            }
        }
    }

    async fn verify_matched(&self, image: &str) -> TrustResult<()> {
        let parsed = ImageReference::parse(image)?;

        let matched: Vec<TrustDomain> = self
            .domains
            .iter()
            .copied()
            .filter(|d| d.matches(&parsed))
            .collect();

        if matched.is_empty() {
            return Err(TrustError::NoVerifierFound {
                image: image.to_string(),
            });
        }

        let mut failures = Vec::new();
        let mut rejected = false;

        for domain in matched {
            match domain.verify(image, &self.ctx).await {
                Ok(()) => {
                    info!(image = image, domain = domain.name(), "signature verified");
                    return Ok(());
                }
                Err(e) => {
                    debug!(image = image, domain = domain.name(), error = %e, "domain verification failed");
                    rejected |= !e.is_missing_signature();
                    failures.push(DomainFailure {
                        domain: domain.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if rejected {
            Err(TrustError::VerificationFailed {
                image: image.to_string(),
                failures,
            })
        } else {
            Err(TrustError::NoSignatureFound {
                image: image.to_string(),
            })
        }
    }

    /// Verify many images with at most `workers` in flight.
    ///
    /// Returns one entry per image, in input order.
    pub async fn verify_images<I, S>(&self, images: I, workers: usize) -> Vec<BatchEntry>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let images: Vec<String> = images.into_iter().map(Into::into).collect();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        let mut entries: Vec<BatchEntry> = images
            .iter()
            .map(|image| BatchEntry {
                image: image.clone(),
                signed: false,
                error: Some("verification task did not complete".to_string()),
            })
            .collect();

        for (index, image) in images.into_iter().enumerate() {
            let verifier = self.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => verifier.verify_image(&image).await,
                    Err(e) => Err(TrustError::Upstream {
                        message: format!("worker pool closed: {}", e),
                    }),
                };
                (index, BatchEntry::from_result(image, &result))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, entry)) => entries[index] = entry,
                Err(e) => warn!(error = %e, "verification task failed"),
            }
        }

        entries
    }

    /// Expected signer identity of a GitHub Actions built image.
    pub async fn resolve_identity(&self, image: &str) -> TrustResult<String> {
        self.ctx.resolver.resolve(image).await
    }

    /// BuildKit provenance of `image` for `platform`.
    ///
    /// `SlsaV1` converts the predicate and enriches it with facts from the
    /// signer certificate; only BuildKit-built images are supported.
    pub async fn image_provenance(
        &self,
        image: &str,
        platform: &str,
        format: ProvenanceFormat,
    ) -> TrustResult<ImageProvenance> {
        let parsed = ImageReference::parse(image)?;
        let fetcher = self.provenance.as_ref().ok_or_else(|| TrustError::Config {
            message: "no provenance source configured".to_string(),
        })?;

        let raw = fetcher.fetch_build_provenance(&parsed).await?;
        let document = BuildKitProvenance::parse(&raw)?;
        let legacy = document.select(platform)?;

        match format {
            ProvenanceFormat::SlsaV02 => Ok(ImageProvenance::V02(legacy.clone())),
            ProvenanceFormat::SlsaV1 => {
                if legacy.build_type != BUILDKIT_BUILD_TYPE {
                    return Err(TrustError::UnsupportedBuildType {
                        build_type: legacy.build_type.clone(),
                    });
                }

                let certificate = self.extractor.extract(&parsed).await?;
                let enrichment = certificate.to_provenance_override();
                Ok(ImageProvenance::V1(convert_v02_to_v1(legacy, Some(&enrichment))))
            }
        }
    }
}

impl std::fmt::Debug for ImageVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageVerifier")
            .field("domains", &self.domains)
            .field("ctx", &self.ctx)
            .field("has_provenance", &self.provenance.is_some())
            .field("timeout", &self.timeout)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}
