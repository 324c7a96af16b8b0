//! Static naming tables used to map container images to their source repositories.
//!
//! Every table is process-wide, read-only and initialised on first use.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Architecture/platform suffixes trimmed from image tags, in trimming order.
pub const ARCH_SUFFIXES: &[&str] = &[
    "-linux-amd64",
    "-linux-arm64",
    "-windows-amd64",
    "-windows-arm64",
    "-amd64",
    "-arm64",
    "-s390x",
];

/// Image tag separator rewrite: images tagged `<version>-rke2r1` come from
/// Git tags `<version>+rke2r1`, historically published as `&#43;`.
#[derive(Debug, Clone, Copy)]
pub struct SeparatorRewrite {
    /// Repository prefix the rewrite applies to.
    pub repo_prefix: &'static str,

    /// Text searched for in the image tag (first occurrence only).
    pub needle: &'static str,

    /// Regex fragment that replaces the needle.
    pub replacement: &'static str,
}

pub const SEPARATOR_REWRITES: &[SeparatorRewrite] = &[
    SeparatorRewrite {
        repo_prefix: "rancher/rke2",
        needle: "-rke2",
        replacement: r"(\+|&#43;)rke2",
    },
    SeparatorRewrite {
        repo_prefix: "rancher/system-agent-installer-rke2",
        needle: "-rke2",
        replacement: r"(\+|&#43;)rke2",
    },
    SeparatorRewrite {
        repo_prefix: "rancher/system-agent-installer-k3s",
        needle: "-k3s",
        replacement: r"(\+|&#43;)k3s",
    },
];

/// Repository name fragments whose image tags drop the `v` prefix of their Git tags.
pub const VERSION_PREFIX_FAMILIES: &[&str] = &["neuvector"];

/// Container repository → source code repository.
pub fn repo_overrides() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("rancher/rancher-csp-adapter", "rancher/csp-adapter"),
            ("rancher/fleet-agent", "rancher/fleet"),
            ("rancher/rke2-runtime", "rancher/rke2"),
            ("rancher/rke2-cloud-provider", "rancher/image-build-rke2-cloud-provider"),
            ("rancher/hardened-addon-resizer", "rancher/image-build-addon-resizer"),
            ("rancher/hardened-calico", "rancher/image-build-calico"),
            (
                "rancher/hardened-cluster-autoscaler",
                "rancher/image-build-cluster-proportional-autoscaler",
            ),
            ("rancher/hardened-whereabouts", "rancher/image-build-whereabouts"),
            (
                "rancher/hardened-node-feature-discovery",
                "rancher/image-build-node-feature-discovery",
            ),
            ("rancher/hardened-multus-cni", "rancher/image-build-multus"),
            (
                "rancher/hardened-multus-dynamic-networks-controller",
                "rancher/image-build-multus-dynamic-networks-controller",
            ),
            ("rancher/hardened-kubernetes", "rancher/image-build-kubernetes"),
            ("rancher/hardened-k8s-metrics-server", "rancher/image-build-k8s-metrics-server"),
            ("rancher/hardened-flannel", "rancher/image-build-flannel"),
            ("rancher/hardened-etcd", "rancher/image-build-etcd"),
            ("rancher/hardened-dns-node-cache", "rancher/image-build-dns-nodecache"),
            ("rancher/hardened-coredns", "rancher/image-build-coredns"),
            ("rancher/hardened-cni-plugins", "rancher/image-build-cni-plugins"),
            ("rancher/nginx-ingress-controller", "rancher/ingress-nginx"),
            ("rancher/rancher", "rancher/rancher-prime"),
            ("rancher/neuvector-manager", "neuvector/manager"),
            ("rancher/neuvector-controller", "neuvector/neuvector"),
            ("rancher/neuvector-enforcer", "neuvector/neuvector"),
            ("rancher/neuvector-scanner", "neuvector/scanner"),
            ("rancher/neuvector-prometheus-exporter", "neuvector/prometheus-exporter"),
            ("rancher/neuvector-registry-adapter", "neuvector/registry-adapter"),
            ("rancher/neuvector-updater", "neuvector/updater"),
            ("rancher/neuvector-compliance-config", "neuvector/compliance-config"),
        ])
    })
}

/// Source repository → complete identity pattern, for repos whose release
/// workflow name or ref convention differs from `release.(yml|yaml)@refs/tags/<ref>`.
pub fn identity_overrides() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            (
                "rancher/cluster-api-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/core.yaml@refs/heads/main$",
            ),
            (
                "rancher/cluster-api-aws-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/aws.yaml@refs/heads/main$",
            ),
            (
                "rancher/cluster-api-azure-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/azure.yaml@refs/heads/main$",
            ),
            (
                "rancher/cluster-api-gcp-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/gcp.yaml@refs/heads/main$",
            ),
            (
                "rancher/cluster-api-vsphere-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/vsphere.yaml@refs/heads/main$",
            ),
            (
                "rancher/cluster-api-metal3-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/metal3.yaml@refs/heads/main$",
            ),
            (
                "rancher/cluster-api-metal3-ipam-controller",
                "^https://github.com/rancher/clusterapi-forks/.github/workflows/metal3-ipam.yaml@refs/heads/main$",
            ),
            (
                "rancher/image-build-etcd",
                "^https://github.com/rancher/image-build-etcd/.github/workflows/(image-push|release).yml@refs/tags/v",
            ),
            (
                "rancher/mirrored-cilium-cilium",
                "^https://github.com/cilium/cilium/.github/workflows/build-images-releases.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-cilium-envoy",
                "^https://github.com/cilium/proxy/.github/workflows/build-envoy-images-release.yaml@refs/heads/v",
            ),
            (
                "rancher/mirrored-cilium-clustermesh-apiserver",
                "^https://github.com/cilium/cilium/.github/workflows/build-images-releases.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-cilium-hubble-relay",
                "^https://github.com/cilium/cilium/.github/workflows/build-images-releases.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-cilium-operator-aws",
                "^https://github.com/cilium/cilium/.github/workflows/build-images-releases.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-cilium-operator-azure",
                "^https://github.com/cilium/cilium/.github/workflows/build-images-releases.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-cilium-operator-generic",
                "^https://github.com/cilium/cilium/.github/workflows/build-images-releases.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-prometheus-operator-prometheus-config-reloader",
                "^https://github.com/prometheus-operator/prometheus-operator/.github/workflows/publish.yaml@refs/tags/v",
            ),
            (
                "rancher/mirrored-kube-logging-logging-operator",
                "^https://github.com/kube-logging/logging-operator/.github/workflows/artifacts.yaml@refs/tags/",
            ),
        ])
    })
}

/// `repo:tag` pairs whose content is republished under the same tag.
pub fn mutable_tags() -> &'static HashSet<&'static str> {
    static TABLE: OnceLock<HashSet<&'static str>> = OnceLock::new();
    TABLE.get_or_init(|| HashSet::from(["rancher/neuvector-scanner:6"]))
}

/// Extra tag suffixes trimmed for specific repositories, after [`ARCH_SUFFIXES`].
pub fn extra_suffixes(repo: &str) -> &'static [&'static str] {
    match repo {
        "rancher/hardened-multus-cni" => &["-arch"],
        _ => &[],
    }
}

/// Canonical source repository for a container repository.
pub fn override_repo(repo: &str) -> &str {
    repo_overrides().get(repo).copied().unwrap_or(repo)
}

/// Whether `repo:tag` is republished in place.
pub fn is_mutable(repo: &str, tag: &str) -> bool {
    mutable_tags().contains(format!("{}:{}", repo, tag).as_str())
}
