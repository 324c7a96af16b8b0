//! Integration tests for OciClient.
//!
//! Uses wiremock for HTTP mocking. Tests cover digest resolution, legacy
//! signature tags, sigstore bundles via referrers, bearer challenges, status
//! mapping, digest checks and BuildKit provenance attestations.

use std::sync::Arc;

use async_trait::async_trait;
use imgtrust::certificate::SignatureSource;
use imgtrust::provenance::SLSA_V02_PREDICATE_TYPE;
use imgtrust::{
    BuildKitProvenance, CertificateExtractor, ImageProvenance, ImageReference, ImageVerifier,
    OciClient, ProvenanceFetcher, ProvenanceFormat, RegistryConfig, TrustError, TrustResult,
    UpstreamVerifier, VerifyCriteria,
};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use serde_json::json;
use sha2::{Digest, Sha256};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use x509_cert::der::Encode;

const EMPTY_CONFIG_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

const SOURCE_URI: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 12];
const SOURCE_DIGEST: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 13];
const SOURCE_REF: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 14];

fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn host(mock_server: &MockServer) -> String {
    mock_server.address().to_string()
}

fn create_test_client(mock_server: &MockServer) -> OciClient {
    let config = RegistryConfig::default()
        .with_insecure_registry(host(mock_server))
        .with_max_retries(1);
    OciClient::new(config).expect("failed to create client")
}

fn image(mock_server: &MockServer, rest: &str) -> ImageReference {
    ImageReference::parse(&format!("{}/{}", host(mock_server), rest)).unwrap()
}

fn signing_cert(git_ref: &str) -> rcgen::Certificate {
    let utf8 = |v: &str| {
        x509_cert::der::asn1::Utf8StringRef::new(v)
            .unwrap()
            .to_der()
            .unwrap()
    };

    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    for (oid, value) in [
        (SOURCE_URI, "https://github.com/rancher/rke2"),
        (SOURCE_DIGEST, "0123456789abcdef0123456789abcdef01234567"),
        (SOURCE_REF, git_ref),
    ] {
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(oid, utf8(value)));
    }
    let key_pair = KeyPair::generate().unwrap();
    params.self_signed(&key_pair).unwrap()
}

fn manifest_with_layers(layers: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": EMPTY_CONFIG_DIGEST,
            "size": 2
        },
        "layers": layers
    }))
    .unwrap()
}

async fn mount_digest(mock_server: &MockServer, repo: &str, tag: &str, digest: &str) {
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/{}", repo, tag)))
        .respond_with(ResponseTemplate::new(200).insert_header("docker-content-digest", digest))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_resolve_digest_from_header() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"index");
    mount_digest(&mock_server, "rancher/rke2", "v1.31.14-rke2r1", &digest).await;

    let client = create_test_client(&mock_server);
    let resolved = client
        .resolve_digest(&image(&mock_server, "rancher/rke2:v1.31.14-rke2r1"))
        .await
        .expect("resolve failed");

    assert_eq!(resolved, digest);
}

#[tokio::test]
async fn test_resolve_digest_hashes_body_without_header() {
    let mock_server = MockServer::start().await;
    let body = br#"{"schemaVersion":2,"manifests":[]}"#;

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let resolved = client
        .resolve_digest(&image(&mock_server, "rancher/rke2:v1.0.0"))
        .await
        .expect("resolve failed");

    assert_eq!(resolved, digest_of(body));
}

#[tokio::test]
async fn test_resolve_digest_pinned_reference_skips_registry() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"pinned");

    let client = create_test_client(&mock_server);
    let resolved = client
        .resolve_digest(&image(&mock_server, &format!("rancher/rke2:v1@{}", digest)))
        .await
        .unwrap();

    assert_eq!(resolved, digest);
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manifest_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/missing/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .resolve_digest(&image(&mock_server, "rancher/missing:v1.0.0"))
        .await;

    assert!(matches!(result, Err(TrustError::NotFound { .. })));
}

#[tokio::test]
async fn test_forbidden_maps_to_unauthorized() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/private/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .resolve_digest(&image(&mock_server, "rancher/private:v1.0.0"))
        .await;

    assert!(matches!(result, Err(TrustError::Unauthorized { .. })));
}

#[tokio::test]
async fn test_rate_limit_retried() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"index");

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    mount_digest(&mock_server, "rancher/rke2", "v1.0.0", &digest).await;

    let client = create_test_client(&mock_server);
    let resolved = client
        .resolve_digest(&image(&mock_server, "rancher/rke2:v1.0.0"))
        .await
        .expect("expected retry to succeed");

    assert_eq!(resolved, digest);
}

#[tokio::test]
async fn test_server_error_exhausts_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .resolve_digest(&image(&mock_server, "rancher/rke2:v1.0.0"))
        .await;

    assert!(matches!(result, Err(TrustError::Network { .. })));
}

#[tokio::test]
async fn test_bearer_challenge_exchanges_token() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"index");

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .and(header("authorization", "Bearer registry-token"))
        .respond_with(ResponseTemplate::new(200).insert_header("docker-content-digest", digest.as_str()))
        .mount(&mock_server)
        .await;

    let challenge = format!(
        r#"Bearer realm="{}/token",service="test-registry",scope="repository:rancher/rke2:pull""#,
        mock_server.uri()
    );
    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "test-registry"))
        .and(query_param("scope", "repository:rancher/rke2:pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "registry-token",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let reference = image(&mock_server, "rancher/rke2:v1.0.0");

    assert_eq!(client.resolve_digest(&reference).await.unwrap(), digest);
    // Second call reuses the cached token.
    assert_eq!(client.resolve_digest(&reference).await.unwrap(), digest);
}

#[tokio::test]
async fn test_token_reused_when_challenge_scope_differs() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"index");

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .and(header("authorization", "Bearer wide-token"))
        .respond_with(ResponseTemplate::new(200).insert_header("docker-content-digest", digest.as_str()))
        .mount(&mock_server)
        .await;

    let challenge = format!(
        r#"Bearer realm="{}/token",service="test-registry",scope="repository:rancher/rke2:pull,push""#,
        mock_server.uri()
    );
    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("scope", "repository:rancher/rke2:pull,push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "wide-token",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let reference = image(&mock_server, "rancher/rke2:v1.0.0");

    for _ in 0..3 {
        assert_eq!(client.resolve_digest(&reference).await.unwrap(), digest);
    }
}

#[tokio::test]
async fn test_static_token_sent() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"index");

    Mock::given(method("HEAD"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .and(header("authorization", "Bearer static-token"))
        .respond_with(ResponseTemplate::new(200).insert_header("docker-content-digest", digest.as_str()))
        .mount(&mock_server)
        .await;

    let config = RegistryConfig::default()
        .with_insecure_registry(host(&mock_server))
        .with_token("static-token");
    let client = OciClient::new(config).unwrap();

    let resolved = client
        .resolve_digest(&image(&mock_server, "rancher/rke2:v1.0.0"))
        .await
        .unwrap();
    assert_eq!(resolved, digest);
}

#[tokio::test]
async fn test_legacy_signature_certificate() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"rke2 index");
    mount_digest(&mock_server, "rancher/rke2", "v1.31.14-rke2r1", &digest).await;

    let cert = signing_cert("refs/tags/v1.31.14+rke2r1");
    let signature_manifest = manifest_with_layers(json!([{
        "mediaType": "application/vnd.dev.cosign.simplesigning.v1+json",
        "digest": digest_of(b"payload"),
        "size": 7,
        "annotations": {
            "dev.cosignproject.cosign/signature": "MEUCIQ==",
            "dev.sigstore.cosign/certificate": cert.pem()
        }
    }]));

    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/rancher/rke2/manifests/{}.sig",
            digest.replace(':', "-")
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(signature_manifest))
        .mount(&mock_server)
        .await;

    // No referrers: 404 is an empty list.
    Mock::given(method("GET"))
        .and(path(format!("/v2/rancher/rke2/referrers/{}", digest)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = Arc::new(create_test_client(&mock_server));
    let reference = image(&mock_server, "rancher/rke2:v1.31.14-rke2r1");

    assert!(client.fetch_bundle_certificates(&reference).await.unwrap().is_empty());

    let extracted = CertificateExtractor::new(client)
        .extract(&reference)
        .await
        .expect("extract failed");
    assert_eq!(extracted.source_repo_url, "https://github.com/rancher/rke2");
    assert_eq!(extracted.source_ref, "refs/tags/v1.31.14+rke2r1");
}

#[tokio::test]
async fn test_legacy_signature_tag_missing() {
    let mock_server = MockServer::start().await;
    let digest = digest_of(b"unsigned");
    mount_digest(&mock_server, "rancher/unsigned", "v1.0.0", &digest).await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/rancher/unsigned/manifests/{}.sig",
            digest.replace(':', "-")
        )))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let certs = client
        .fetch_legacy_certificates(&image(&mock_server, "rancher/unsigned:v1.0.0"))
        .await
        .unwrap();
    assert!(certs.is_empty());
}

#[tokio::test]
async fn test_bundle_certificate_via_referrers() {
    use base64::Engine as _;

    let mock_server = MockServer::start().await;
    let digest = digest_of(b"neuvector index");
    mount_digest(&mock_server, "neuvector/scanner", "6", &digest).await;

    let cert = signing_cert("refs/tags/v6.0.1");
    let bundle = serde_json::to_vec(&json!({
        "mediaType": "application/vnd.dev.sigstore.bundle.v0.3+json",
        "verificationMaterial": {
            "certificate": {
                "rawBytes": base64::engine::general_purpose::STANDARD.encode(cert.der())
            }
        },
        "messageSignature": {}
    }))
    .unwrap();
    let bundle_digest = digest_of(&bundle);

    let bundle_manifest = manifest_with_layers(json!([{
        "mediaType": "application/vnd.dev.sigstore.bundle.v0.3+json",
        "digest": bundle_digest,
        "size": bundle.len()
    }]));
    let bundle_manifest_digest = digest_of(&bundle_manifest);

    Mock::given(method("GET"))
        .and(path(format!("/v2/neuvector/scanner/referrers/{}", digest)))
        .and(query_param(
            "artifactType",
            "application/vnd.dev.sigstore.bundle.v0.3+json",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "artifactType": "application/vnd.dev.sigstore.bundle.v0.3+json",
                "digest": bundle_manifest_digest,
                "size": bundle_manifest.len()
            }]
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/neuvector/scanner/manifests/{}",
            bundle_manifest_digest
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bundle_manifest))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/neuvector/scanner/blobs/{}", bundle_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bundle))
        .mount(&mock_server)
        .await;

    let client = Arc::new(create_test_client(&mock_server));
    let reference = image(&mock_server, "neuvector/scanner:6");

    let certs = client.fetch_bundle_certificates(&reference).await.unwrap();
    assert_eq!(certs, vec![cert.der().to_vec()]);

    // The bundle wins, so the legacy tag is never asked for.
    let extracted = CertificateExtractor::new(client)
        .extract(&reference)
        .await
        .unwrap();
    assert_eq!(extracted.resolved_ref.as_deref(), Some("refs/tags/v6.0.1"));
}

#[tokio::test]
async fn test_blob_digest_mismatch() {
    let mock_server = MockServer::start().await;
    let expected = digest_of(b"original");

    Mock::given(method("GET"))
        .and(path(format!("/v2/rancher/rke2/blobs/{}", expected)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .fetch_blob(&image(&mock_server, "rancher/rke2:v1.0.0"), &expected)
        .await;

    match result {
        Err(TrustError::DigestMismatch { expected: e, actual }) => {
            assert_eq!(e, expected);
            assert_eq!(actual, digest_of(b"tampered"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

fn buildkit_statement() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "_type": "https://in-toto.io/Statement/v0.1",
        "predicateType": SLSA_V02_PREDICATE_TYPE,
        "subject": [{ "name": "pkg:docker/rancher/rke2@v1.0.0", "digest": { "sha256": "00" } }],
        "predicate": {
            "builder": { "id": "https://github.com/rancher/rke2/actions/runs/1" },
            "buildType": "https://mobyproject.org/buildkit@v1",
            "invocation": {
                "configSource": { "entryPoint": "Dockerfile" },
                "parameters": { "frontend": "dockerfile.v0" }
            },
            "materials": [
                { "uri": "pkg:docker/alpine@3.20", "digest": { "sha256": "abc" } }
            ]
        }
    }))
    .unwrap()
}

/// Mounts a two-platform index whose amd64 image carries an attestation.
async fn mount_attested_index(mock_server: &MockServer) {
    let statement = buildkit_statement();
    let statement_digest = digest_of(&statement);

    let attestation = manifest_with_layers(json!([
        {
            "mediaType": "application/vnd.in-toto+json",
            "digest": digest_of(b"sbom"),
            "size": 4,
            "annotations": { "in-toto.io/predicate-type": "https://spdx.dev/Document" }
        },
        {
            "mediaType": "application/vnd.in-toto+json",
            "digest": statement_digest,
            "size": statement.len(),
            "annotations": { "in-toto.io/predicate-type": SLSA_V02_PREDICATE_TYPE }
        }
    ]));
    let attestation_digest = digest_of(&attestation);
    let amd64 = digest_of(b"amd64 image");
    let arm64 = digest_of(b"arm64 image");

    Mock::given(method("GET"))
        .and(path("/v2/rancher/rke2/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": amd64,
                    "size": 100,
                    "platform": { "architecture": "amd64", "os": "linux" }
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": arm64,
                    "size": 100,
                    "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": attestation_digest,
                    "size": attestation.len(),
                    "platform": { "architecture": "unknown", "os": "unknown" },
                    "annotations": {
                        "vnd.docker.reference.type": "attestation-manifest",
                        "vnd.docker.reference.digest": amd64
                    }
                }
            ]
        })))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/rancher/rke2/manifests/{}", attestation_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(attestation))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/rancher/rke2/blobs/{}", statement_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(statement))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_build_provenance_per_platform() {
    let mock_server = MockServer::start().await;
    mount_attested_index(&mock_server).await;

    let client = create_test_client(&mock_server);
    let raw = client
        .fetch_build_provenance(&image(&mock_server, "rancher/rke2:v1.0.0"))
        .await
        .expect("fetch failed");

    let document = BuildKitProvenance::parse(&raw).unwrap();
    let predicate = document.select("linux/amd64").unwrap();
    assert_eq!(predicate.build_type, "https://mobyproject.org/buildkit@v1");
    assert_eq!(predicate.materials[0].uri, "pkg:docker/alpine@3.20");

    assert!(matches!(
        document.select("linux/arm64/v8"),
        Err(TrustError::UnsupportedPlatform { .. })
    ));
}

#[tokio::test]
async fn test_build_provenance_missing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/rancher/plain/manifests/v1.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest_with_layers(json!([]))))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .fetch_build_provenance(&image(&mock_server, "rancher/plain:v1.0.0"))
        .await;

    assert!(matches!(result, Err(TrustError::NotFound { .. })));
}

struct NoUpstream;

#[async_trait]
impl UpstreamVerifier for NoUpstream {
    async fn verify(&self, _image: &str, _criteria: &VerifyCriteria) -> TrustResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_image_provenance_slsa_v1_from_registry() {
    let mock_server = MockServer::start().await;
    mount_attested_index(&mock_server).await;

    let digest = digest_of(b"rke2 index");
    mount_digest(&mock_server, "rancher/rke2", "v1.0.0", &digest).await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/rancher/rke2/referrers/{}", digest)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let cert = signing_cert("refs/tags/v1.0.0");
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/rancher/rke2/manifests/{}.sig",
            digest.replace(':', "-")
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest_with_layers(json!([{
            "mediaType": "application/vnd.dev.cosign.simplesigning.v1+json",
            "digest": digest_of(b"payload"),
            "size": 7,
            "annotations": { "dev.sigstore.cosign/certificate": cert.pem() }
        }]))))
        .mount(&mock_server)
        .await;

    let client = Arc::new(create_test_client(&mock_server));
    let verifier = ImageVerifier::new(Arc::new(NoUpstream), client.clone())
        .with_provenance_fetcher(client);

    let reference = format!("{}/rancher/rke2:v1.0.0", host(&mock_server));
    let provenance = verifier
        .image_provenance(&reference, "linux/amd64", ProvenanceFormat::SlsaV1)
        .await
        .expect("provenance failed");

    let ImageProvenance::V1(predicate) = provenance else {
        panic!("expected SLSA v1");
    };
    let deps = &predicate.build_definition.resolved_dependencies;
    assert_eq!(deps[0].uri, "pkg:docker/alpine@3.20");
    let source = deps.last().unwrap();
    assert_eq!(source.uri, "https://github.com/rancher/rke2");
    assert_eq!(
        source.digest.get("gitCommit").map(String::as_str),
        Some("0123456789abcdef0123456789abcdef01234567")
    );
}
