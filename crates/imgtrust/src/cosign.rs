//! Upstream verification through the `cosign` command line.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{UpstreamVerifier, VerifyCriteria};
use crate::error::{TrustError, TrustResult};

const NO_SIGNATURE_MARKERS: &[&str] = &["no signatures found"];

/// Runs `cosign verify` as a child process.
///
/// Output is captured, so concurrent verifications do not interleave on the
/// terminal. The child is killed if the verification future is dropped.
#[derive(Debug, Clone)]
pub struct CosignCli {
    bin: String,
}

impl CosignCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub(crate) fn args(image: &str, criteria: &VerifyCriteria) -> Vec<String> {
        let mut args = vec!["verify".to_string()];

        match criteria {
            VerifyCriteria::Key { key_ref, rekor_url } => {
                args.extend(["--key".to_string(), key_ref.clone()]);
                args.extend(["--rekor-url".to_string(), rekor_url.clone()]);
            }
            VerifyCriteria::Keyless {
                identity_regexp,
                issuer,
                rekor_url,
                new_bundle_format,
            } => {
                args.extend([
                    "--certificate-identity-regexp".to_string(),
                    identity_regexp.clone(),
                ]);
                args.extend(["--certificate-oidc-issuer".to_string(), issuer.clone()]);
                args.extend(["--rekor-url".to_string(), rekor_url.clone()]);
                if *new_bundle_format {
                    args.push("--new-bundle-format".to_string());
                }
            }
        }

        args.push(format!("--check-claims={}", criteria.check_claims()));
        args.extend(["--output".to_string(), "json".to_string()]);
        args.push(image.to_string());
        args
    }
}

fn classify(image: &str, success: bool, stdout: &[u8], stderr: &[u8]) -> TrustResult<()> {
    if success {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);
    let combined = format!("{}\n{}", stdout, stderr).to_ascii_lowercase();

    if NO_SIGNATURE_MARKERS.iter().any(|m| combined.contains(m)) {
        return Err(TrustError::NoSignatureFound {
            image: image.to_string(),
        });
    }

    let reason = match stderr.trim() {
        "" => "cosign exited with an error".to_string(),
        trimmed => trimmed.to_string(),
    };

    Err(TrustError::SignatureRejected { reason })
}

#[async_trait]
impl UpstreamVerifier for CosignCli {
    async fn verify(&self, image: &str, criteria: &VerifyCriteria) -> TrustResult<()> {
        let args = Self::args(image, criteria);
        debug!(bin = %self.bin, args = ?args, "running cosign");

        let output = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TrustError::Upstream {
                message: format!("failed to run {}: {}", self.bin, e),
            })?;

        debug!(
            image = image,
            status = ?output.status.code(),
            "cosign finished"
        );

        classify(image, output.status.success(), &output.stdout, &output.stderr)
    }
}
