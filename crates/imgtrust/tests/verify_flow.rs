//! End-to-end verification through the public API with a scripted cosign.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use imgtrust::{
    parse_image_list, summarize, ImageClass, ImageVerifier, TrustConfig, TrustError,
};
use serial_test::serial;

/// A cosign stand-in: logs its arguments, then fails for images it was told to.
fn scripted_cosign(dir: &Path) -> String {
    let log = dir.join("calls.log");
    let script = format!(
        r#"#!/bin/sh
echo "$@" >> {log}
for arg in "$@"; do image="$arg"; done
case "$image" in
  *unsigned*) echo "Error: no signatures found" >&2; exit 1 ;;
  *tampered*) echo "Error: invalid signature when validating ASN.1 encoded signature" >&2; exit 1 ;;
esac
echo '[{{"critical":{{}}}}]'
exit 0
"#,
        log = log.display()
    );

    let path = dir.join("cosign");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

fn verifier(dir: &Path) -> ImageVerifier {
    let config = TrustConfig::default()
        .with_cosign_bin(scripted_cosign(dir))
        .with_rekor_url("https://rekor.example.test");
    ImageVerifier::from_config(&config).expect("failed to build verifier")
}

#[tokio::test]
#[serial]
async fn test_static_key_domain_verifies_first() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = verifier(dir.path());

    verifier
        .verify_image("registry.suse.com/bci/bci-base:15.6")
        .await
        .expect("verification failed");

    let calls = calls(dir.path());
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("--key https://ftp.suse.com/pub/projects/security/keys/container-key.pem"));
    assert!(calls[0].contains("--rekor-url https://rekor.example.test"));
}

#[tokio::test]
#[serial]
async fn test_keyless_identity_passed_to_cosign() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = verifier(dir.path());

    verifier
        .verify_image("rancher/rke2-runtime:v1.31.14-rke2r1")
        .await
        .unwrap();

    let calls = calls(dir.path());
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains(
        "--certificate-identity-regexp ^https://github.com/rancher/rke2/.github/workflows/release"
    ));
    assert!(calls[0].contains("--certificate-oidc-issuer https://token.actions.githubusercontent.com"));
    assert!(calls[0].contains("--new-bundle-format"));
    assert!(calls[0].ends_with("rancher/rke2-runtime:v1.31.14-rke2r1"));
}

#[tokio::test]
#[serial]
async fn test_missing_and_rejected_signatures() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = verifier(dir.path());

    let missing = verifier.verify_image("rancher/unsigned:v1.0.0").await;
    assert!(matches!(missing, Err(TrustError::NoSignatureFound { .. })));
    assert_eq!(missing.unwrap_err().exit_code(), 3);

    match verifier.verify_image("rancher/tampered:v1.0.0").await {
        Err(TrustError::VerificationFailed { failures, .. }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].domain, "gha");
            assert!(failures[0].message.contains("invalid signature"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
#[serial]
async fn test_image_list_batch() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = verifier(dir.path());

    let list = "\
# rancher images
rancher/rancher:v2.10.3
rancher/unsigned:v1.0.0
rancher/mirrored-tampered:v1.0.0
Not A Valid Image
";
    assert!(parse_image_list(list, None).is_err());

    let images = parse_image_list(&list.replace("Not A Valid Image\n", ""), None).unwrap();
    let entries = verifier.verify_images(images, 2).await;

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].image, "rancher/rancher:v2.10.3");
    assert!(entries[0].signed);
    assert!(!entries[1].signed);
    assert!(entries[1].error.as_deref().unwrap().contains("no signatures found"));
    assert!(!entries[2].signed);

    let summary = summarize(&entries);
    assert_eq!(summary.class(ImageClass::Official).count, 2);
    assert_eq!(summary.class(ImageClass::Official).signed, 1);
    assert_eq!(summary.class(ImageClass::ThirdParty).errors, 1);
}
