//! Microservices platform topology
//!
//! Materializes the descriptor set for the full platform from a validated
//! [`PlatformConfig`]:
//!
//! ```text
//! vpc -> cluster -> workers -> namespaces -> releases -> manifests
//! ```
//!
//! In-cluster nodes consume the cluster kubeconfig and their namespace's
//! name as data inputs, and wait for the node pool through an explicit edge.
//! Network policies are fault tolerant: a failed policy never blocks the
//! rest of the platform.

use crate::config::PlatformConfig;
use crate::error::PlatformError;
use serde_json::{json, Value};
use std::time::Duration;
use strata_core::descriptor::{DescriptorBuilder, HelmRelease, ResourceDescriptor};
use strata_core::graph::{self, DependencyGraph};
use strata_core::probe::{ProbePolicy, ReadinessSignal};
use strata_core::{ConfigurationError, NodeKey, ResourceKind};

const ISTIO_VERSION: &str = "1.24.2";
const ELASTIC_VERSION: &str = "8.5.1";

const ISTIO_REPO: &str = "https://istio-release.storage.googleapis.com/charts";
const ELASTIC_REPO: &str = "https://helm.elastic.co";
const FLUENT_REPO: &str = "https://fluent.github.io/helm-charts";
const JAEGER_REPO: &str = "https://jaegertracing.github.io/helm-charts";
const KONG_REPO: &str = "https://charts.konghq.com";
const JETSTACK_REPO: &str = "https://charts.jetstack.io";
const PROMETHEUS_REPO: &str = "https://prometheus-community.github.io/helm-charts";
const ARGO_REPO: &str = "https://argoproj.github.io/argo-helm";

/// Namespaces created on the cluster, in declaration order
pub const NAMESPACES: [&str; 7] = [
    "istio-system",
    "logging",
    "observability",
    "kong",
    "cert-manager",
    "monitoring",
    "argocd",
];

/// Namespaces whose workloads get an Istio sidecar
const MESH_NAMESPACES: [&str; 3] = ["logging", "observability", "kong"];

pub fn network() -> NodeKey {
    NodeKey::new(ResourceKind::Network, "vpc")
}

pub fn cluster() -> NodeKey {
    NodeKey::new(ResourceKind::Cluster, "cluster")
}

pub fn workers() -> NodeKey {
    NodeKey::new(ResourceKind::Nodegroup, "workers")
}

pub fn namespace(name: &str) -> NodeKey {
    NodeKey::new(ResourceKind::GenericManifest, name)
}

/// Every descriptor of the platform, dependencies declared before dependents.
pub fn descriptors(config: &PlatformConfig) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
    let layers = Layers { config };
    let mut all = layers.infrastructure()?;
    all.extend(layers.namespaces()?);
    all.extend(layers.service_mesh()?);
    all.extend(layers.logging()?);
    all.extend(layers.distributed_tracing()?);
    all.extend(layers.api_gateway()?);
    all.extend(layers.certificates()?);
    all.extend(layers.network_policies()?);
    all.extend(layers.monitoring()?);
    all.extend(layers.gitops()?);
    tracing::debug!(nodes = all.len(), "platform descriptors materialized");
    Ok(all)
}

/// Validate `config` and assemble the platform graph.
pub fn build(config: &PlatformConfig) -> Result<DependencyGraph, PlatformError> {
    config.validate()?;
    Ok(graph::build(descriptors(config)?)?)
}

struct Layers<'a> {
    config: &'a PlatformConfig,
}

impl Layers<'_> {
    fn policy(&self, timeout: Duration) -> ProbePolicy {
        let interval = self.config.readiness.poll_interval();
        ProbePolicy::new(timeout, interval).with_backoff(1.5, interval.max(Duration::from_secs(30)))
    }

    fn infrastructure_policy(&self) -> ProbePolicy {
        self.policy(self.config.readiness.infrastructure_timeout())
    }

    fn release_policy(&self) -> ProbePolicy {
        self.policy(self.config.readiness.release_timeout())
    }

    fn tags(&self, name: &str) -> Value {
        json!({
            "Name": name,
            "Project": "microservices-platform",
            "ManagedBy": "strata",
        })
    }

    fn infrastructure(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let c = self.config;
        let vpc = ResourceDescriptor::builder(ResourceKind::Network, network().name)
            .input("cidr_block", c.vpc_cidr.as_str())
            .input("availability_zones", c.availability_zones())
            .input("nat_gateway_strategy", "single")
            .input(
                "subnets",
                json!([
                    { "type": "private", "cidr_mask": 19, "tags": { "kubernetes.io/role/internal-elb": "1" } },
                    { "type": "public", "cidr_mask": 22, "tags": { "kubernetes.io/role/elb": "1" } },
                ]),
            )
            .input("tags", self.tags("microservices-vpc"))
            .readiness(ReadinessSignal::status_ready(self.infrastructure_policy()))
            .build()?;

        let net = network();
        let eks = ResourceDescriptor::builder(ResourceKind::Cluster, cluster().name)
            .input("cluster_name", c.cluster_name.as_str())
            .input("version", c.k8s_version.as_str())
            .input_ref("vpc_id", net.output("vpc_id"))
            .input_ref("public_subnet_ids", net.output("public_subnet_ids"))
            .input_ref("private_subnet_ids", net.output("private_subnet_ids"))
            .input(
                "enabled_log_types",
                json!(["api", "audit", "authenticator", "controllerManager", "scheduler"]),
            )
            .input("create_oidc_provider", true)
            .input("endpoint_private_access", true)
            .input("endpoint_public_access", true)
            .input("tags", self.tags(&c.cluster_name))
            .readiness(ReadinessSignal::status_ready(self.infrastructure_policy()))
            .build()?;

        let pool = ResourceDescriptor::builder(ResourceKind::Nodegroup, workers().name)
            .input("instance_type", c.node_instance_type.as_str())
            .input("desired_size", c.desired_capacity)
            .input("min_size", c.min_size)
            .input("max_size", c.max_size)
            .input_ref("cluster_name", cluster().output("cluster_name"))
            .input_ref("subnet_ids", net.output("private_subnet_ids"))
            .readiness(ReadinessSignal::conditions(
                "Ready",
                c.min_size as usize,
                self.infrastructure_policy(),
            ))
            .build()?;

        Ok(vec![vpc, eks, pool])
    }

    /// Anything installed into the cluster; waits for the node pool.
    fn in_cluster(&self, kind: ResourceKind, name: &str) -> DescriptorBuilder {
        ResourceDescriptor::builder(kind, name)
            .input_ref("kubeconfig", cluster().output("kubeconfig"))
            .depends_on(workers())
            .readiness(ReadinessSignal::status_ready(self.release_policy()))
    }

    fn release(&self, kind: ResourceKind, name: &str, ns: &str, chart: HelmRelease) -> DescriptorBuilder {
        self.in_cluster(kind, name)
            .input_ref("namespace", namespace(ns).output("name"))
            .helm_release(chart)
    }

    fn namespaces(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        NAMESPACES
            .iter()
            .map(|name| {
                let mut labels = json!({ "name": name });
                if MESH_NAMESPACES.contains(name) {
                    labels["istio-injection"] = json!("enabled");
                }
                self.in_cluster(ResourceKind::GenericManifest, name)
                    .input(
                        "manifest",
                        json!({
                            "apiVersion": "v1",
                            "kind": "Namespace",
                            "metadata": { "name": name, "labels": labels },
                        }),
                    )
                    .build()
            })
            .collect()
    }

    fn service_mesh(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let base = self
            .release(
                ResourceKind::MeshControlPlane,
                "istio-base",
                "istio-system",
                HelmRelease::new("base", ISTIO_VERSION, ISTIO_REPO),
            )
            .build()?;

        let istiod = self
            .release(
                ResourceKind::MeshControlPlane,
                "istiod",
                "istio-system",
                HelmRelease::new("istiod", ISTIO_VERSION, ISTIO_REPO).with_values(json!({
                    "global": { "hub": "docker.io/istio", "tag": ISTIO_VERSION },
                    "pilot": { "resources": { "requests": { "cpu": "500m", "memory": "2048Mi" } } },
                    "meshConfig": {
                        "enableTracing": true,
                        "defaultConfig": { "tracing": { "sampling": 100.0 } },
                    },
                })),
            )
            .depends_on(base.key.clone())
            .build()?;

        let ingress = self
            .release(
                ResourceKind::Gateway,
                "istio-ingress",
                "istio-system",
                HelmRelease::new("gateway", ISTIO_VERSION, ISTIO_REPO).with_values(json!({
                    "service": {
                        "type": "LoadBalancer",
                        "annotations": { "service.beta.kubernetes.io/aws-load-balancer-type": "nlb" },
                    },
                })),
            )
            .depends_on(istiod.key.clone())
            .readiness(ReadinessSignal::output_present(
                "load_balancer_hostname",
                self.release_policy(),
            ))
            .build()?;

        Ok(vec![base, istiod, ingress])
    }

    fn logging(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let elasticsearch = self
            .release(
                ResourceKind::LogPipeline,
                "elasticsearch",
                "logging",
                HelmRelease::new("elasticsearch", ELASTIC_VERSION, ELASTIC_REPO).with_values(json!({
                    "replicas": 3,
                    "minimumMasterNodes": 2,
                    "resources": {
                        "requests": { "cpu": "1000m", "memory": "2Gi" },
                        "limits": { "cpu": "2000m", "memory": "4Gi" },
                    },
                    "volumeClaimTemplate": {
                        "accessModes": ["ReadWriteOnce"],
                        "resources": { "requests": { "storage": "30Gi" } },
                    },
                })),
            )
            .readiness(ReadinessSignal::output_present(
                "service_endpoint",
                self.release_policy(),
            ))
            .build()?;
        let es_endpoint = elasticsearch.key.output("service_endpoint");

        let kibana = self
            .release(
                ResourceKind::LogPipeline,
                "kibana",
                "logging",
                HelmRelease::new("kibana", ELASTIC_VERSION, ELASTIC_REPO).with_values(json!({
                    "resources": {
                        "requests": { "cpu": "500m", "memory": "1Gi" },
                        "limits": { "cpu": "1000m", "memory": "2Gi" },
                    },
                    "service": { "type": "LoadBalancer" },
                })),
            )
            .input_ref("elasticsearch_host", es_endpoint.clone())
            .build()?;

        let fluent_bit = self
            .release(
                ResourceKind::LogPipeline,
                "fluent-bit",
                "logging",
                HelmRelease::new("fluent-bit", "0.47.10", FLUENT_REPO).with_values(json!({
                    "config": {
                        "outputs": "[OUTPUT]\n    Name es\n    Match *\n    Port 9200\n    Logstash_Format On\n    Logstash_Prefix kubernetes\n    Retry_Limit False\n",
                    },
                    "resources": {
                        "requests": { "cpu": "100m", "memory": "128Mi" },
                        "limits": { "cpu": "200m", "memory": "256Mi" },
                    },
                })),
            )
            .input_ref("elasticsearch_host", es_endpoint)
            .build()?;

        Ok(vec![elasticsearch, kibana, fluent_bit])
    }

    fn distributed_tracing(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let operator = self
            .release(
                ResourceKind::TracingBackend,
                "jaeger-operator",
                "observability",
                HelmRelease::new("jaeger-operator", "2.57.0", JAEGER_REPO)
                    .with_values(json!({ "rbac": { "create": true } })),
            )
            .build()?;

        let instance = self
            .in_cluster(ResourceKind::TracingBackend, "jaeger")
            .input_ref("namespace", namespace("observability").output("name"))
            .input_ref(
                "elasticsearch_host",
                NodeKey::new(ResourceKind::LogPipeline, "elasticsearch").output("service_endpoint"),
            )
            .input(
                "manifest",
                json!({
                    "apiVersion": "jaegertracing.io/v1",
                    "kind": "Jaeger",
                    "metadata": { "name": "jaeger", "namespace": "observability" },
                    "spec": {
                        "strategy": "production",
                        "storage": {
                            "type": "elasticsearch",
                            "options": { "es": { "index-prefix": "jaeger" } },
                        },
                        "ingress": { "enabled": true },
                        "query": { "serviceType": "LoadBalancer" },
                    },
                }),
            )
            .depends_on(operator.key.clone())
            .build()?;

        Ok(vec![operator, instance])
    }

    fn api_gateway(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let log_env: serde_json::Map<String, Value> = [
            ("proxy_access_log", "/dev/stdout"),
            ("admin_access_log", "/dev/stdout"),
            ("admin_gui_access_log", "/dev/stdout"),
            ("portal_api_access_log", "/dev/stdout"),
            ("proxy_error_log", "/dev/stderr"),
            ("admin_error_log", "/dev/stderr"),
            ("admin_gui_error_log", "/dev/stderr"),
            ("portal_api_error_log", "/dev/stderr"),
            ("database", "off"),
            ("nginx_worker_processes", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();

        let kong = self
            .release(
                ResourceKind::Gateway,
                "kong",
                "kong",
                HelmRelease::new("kong", "2.45.0", KONG_REPO).with_values(json!({
                    "ingressController": { "enabled": true, "installCRDs": false },
                    "proxy": {
                        "type": "LoadBalancer",
                        "annotations": { "service.beta.kubernetes.io/aws-load-balancer-type": "nlb" },
                    },
                    "env": log_env,
                    "resources": {
                        "requests": { "cpu": "500m", "memory": "512Mi" },
                        "limits": { "cpu": "1000m", "memory": "1Gi" },
                    },
                })),
            )
            .readiness(ReadinessSignal::output_present(
                "load_balancer_hostname",
                self.release_policy(),
            ))
            .build()?;

        Ok(vec![kong])
    }

    fn certificates(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let cert_manager = self
            .release(
                ResourceKind::CertificateAuthority,
                "cert-manager",
                "cert-manager",
                HelmRelease::new("cert-manager", "v1.16.2", JETSTACK_REPO).with_values(json!({
                    "crds": { "enabled": true },
                    "global": { "leaderElection": { "namespace": "cert-manager" } },
                    "resources": {
                        "requests": { "cpu": "100m", "memory": "128Mi" },
                        "limits": { "cpu": "200m", "memory": "256Mi" },
                    },
                })),
            )
            .build()?;

        let kong = NodeKey::new(ResourceKind::Gateway, "kong");
        let issuer = |name: &str, server: &str| {
            self.in_cluster(ResourceKind::CertificateAuthority, name)
                .input(
                    "manifest",
                    json!({
                        "apiVersion": "cert-manager.io/v1",
                        "kind": "ClusterIssuer",
                        "metadata": { "name": name },
                        "spec": {
                            "acme": {
                                "server": server,
                                "email": self.config.letsencrypt_email,
                                "privateKeySecretRef": { "name": name },
                                "solvers": [{ "http01": { "ingress": { "class": "kong" } } }],
                            },
                        },
                    }),
                )
                .depends_on(cert_manager.key.clone())
                .depends_on(kong.clone())
                .build()
        };

        let staging = issuer(
            "letsencrypt-staging",
            "https://acme-staging-v02.api.letsencrypt.org/directory",
        )?;
        let prod = issuer("letsencrypt-prod", "https://acme-v02.api.letsencrypt.org/directory")?;

        Ok(vec![cert_manager, staging, prod])
    }

    fn network_policies(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let allow_from = |pod_labels: Value, port: Option<u16>| {
            let mut rule = json!({ "from": [{ "podSelector": { "matchLabels": pod_labels } }] });
            if let Some(port) = port {
                rule["ports"] = json!([{ "protocol": "TCP", "port": port }]);
            }
            rule
        };

        let policies = [
            ("logging-deny-ingress", "logging", "deny-all-ingress", json!({}), None),
            (
                "logging-allow-fluent-to-es",
                "logging",
                "allow-fluent-to-elasticsearch",
                json!({ "app": "elasticsearch-master" }),
                Some(allow_from(json!({ "app.kubernetes.io/name": "fluent-bit" }), Some(9200))),
            ),
            (
                "logging-allow-kibana-to-es",
                "logging",
                "allow-kibana-to-elasticsearch",
                json!({ "app": "elasticsearch-master" }),
                Some(allow_from(json!({ "app": "kibana" }), Some(9200))),
            ),
            ("observability-deny-ingress", "observability", "deny-all-ingress", json!({}), None),
            (
                "observability-allow-istio-to-jaeger",
                "observability",
                "allow-istio-to-jaeger",
                json!({ "app": "jaeger" }),
                Some(json!({
                    "from": [{ "namespaceSelector": { "matchLabels": { "istio-injection": "enabled" } } }],
                })),
            ),
        ];

        let settle = ReadinessSignal::FixedDelay {
            delay: self.config.readiness.policy_settle(),
            policy: self.release_policy(),
        };

        policies
            .into_iter()
            .map(|(node, ns, policy_name, selector, ingress)| {
                let pod_selector = if selector.as_object().is_some_and(|m| m.is_empty()) {
                    json!({})
                } else {
                    json!({ "matchLabels": selector })
                };
                let mut spec = json!({
                    "podSelector": pod_selector,
                    "policyTypes": ["Ingress"],
                });
                if let Some(rule) = ingress {
                    spec["ingress"] = json!([rule]);
                }
                self.in_cluster(ResourceKind::GenericManifest, node)
                    .input_ref("namespace", namespace(ns).output("name"))
                    .input(
                        "manifest",
                        json!({
                            "apiVersion": "networking.k8s.io/v1",
                            "kind": "NetworkPolicy",
                            "metadata": { "name": policy_name, "namespace": ns },
                            "spec": spec,
                        }),
                    )
                    .readiness(settle.clone())
                    .fault_tolerant()
                    .build()
            })
            .collect()
    }

    fn monitoring(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let stack = self
            .release(
                ResourceKind::MetricsStack,
                "kube-prometheus-stack",
                "monitoring",
                HelmRelease::new("kube-prometheus-stack", "67.7.0", PROMETHEUS_REPO).with_values(
                    json!({
                        "prometheus": {
                            "prometheusSpec": {
                                "retention": "30d",
                                "resources": {
                                    "requests": { "cpu": "500m", "memory": "2Gi" },
                                    "limits": { "cpu": "1000m", "memory": "4Gi" },
                                },
                                "storageSpec": {
                                    "volumeClaimTemplate": {
                                        "spec": {
                                            "accessModes": ["ReadWriteOnce"],
                                            "resources": { "requests": { "storage": "50Gi" } },
                                        },
                                    },
                                },
                                "serviceMonitorSelectorNilUsesHelmValues": false,
                                "podMonitorSelectorNilUsesHelmValues": false,
                            },
                        },
                        "grafana": {
                            "enabled": true,
                            "service": { "type": "LoadBalancer" },
                            "resources": {
                                "requests": { "cpu": "250m", "memory": "512Mi" },
                                "limits": { "cpu": "500m", "memory": "1Gi" },
                            },
                        },
                        "alertmanager": { "enabled": true },
                    }),
                ),
            )
            .build()?;
        Ok(vec![stack])
    }

    fn gitops(&self) -> Result<Vec<ResourceDescriptor>, ConfigurationError> {
        let resources = |cpu: &str, memory: &str, cpu_limit: &str, memory_limit: &str| {
            json!({
                "requests": { "cpu": cpu, "memory": memory },
                "limits": { "cpu": cpu_limit, "memory": memory_limit },
            })
        };
        let argocd = self
            .release(
                ResourceKind::GitopsController,
                "argocd",
                "argocd",
                HelmRelease::new("argo-cd", "7.7.12", ARGO_REPO).with_values(json!({
                    "server": {
                        "service": { "type": "LoadBalancer" },
                        "extraArgs": ["--insecure"],
                        "resources": resources("250m", "512Mi", "500m", "1Gi"),
                    },
                    "controller": { "resources": resources("500m", "1Gi", "1000m", "2Gi") },
                    "repoServer": { "resources": resources("250m", "512Mi", "500m", "1Gi") },
                    "dex": { "enabled": false },
                    "configs": { "params": { "server.insecure": true } },
                })),
            )
            .build()?;
        Ok(vec![argocd])
    }
}
