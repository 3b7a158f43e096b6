//! Builders for the Kubernetes and Istio objects the styles emit
//!
//! Everything here is pure: the builders take the federation objects and
//! return fully formed desired state. Persisting it is up to the style.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::istio::{
    ClientTlsSettings, Destination, DestinationRule, DestinationRuleSpec, Gateway, GatewaySpec,
    HttpMatchRequest, HttpRewrite, HttpRoute, PortSelector, PortTrafficPolicy, RouteDestination,
    Server, ServerPort, ServerTlsSettings, ServiceEntry, ServiceEntryPort, ServiceEntrySpec,
    StringMatch, Subset, TlsMatchAttributes, TlsRoute, TrafficPolicy, VirtualService,
    VirtualServiceSpec, WorkloadEntry, TLS_MODE_ISTIO_MUTUAL, TLS_MODE_MUTUAL,
};
use crate::crd::{Direction, Labels, MeshFedConfig, ServiceBinding, ServiceExposition};
use crate::error::{Error, Result};
use crate::store::StoreObject;

/// Where the gateway workloads find the federation certificates
pub const CERT_DIR: &str = "/etc/istio/mesh/certs/";
pub const CERT_CHAIN: &str = "/etc/istio/mesh/certs/tls.crt";
pub const CERT_KEY: &str = "/etc/istio/mesh/certs/tls.key";
pub const CERT_CA: &str = "/etc/istio/mesh/certs/ca.crt";

/// Port local workloads use to reach the egress gateway
pub const EGRESS_TLS_PORT: u16 = 443;

pub const MANAGED_BY: &str = "mesh-federation";

/// Label tying routing objects to the ServiceBinding they serve
pub const BINDING_LABEL: &str = "mm.ibm.istio.io/binding";

/// Longest Service name (DNS-1035 label) and label value
const MAX_NAME_LEN: usize = 63;

/// `name` if it fits in 63 characters, otherwise a truncated prefix plus
/// a hash of the full name
pub fn bounded_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let suffix = &digest[..8];
    let prefix: String = name.chars().take(MAX_NAME_LEN - suffix.len() - 1).collect();
    format!("{}-{}", prefix.trim_end_matches(['-', '.']), suffix)
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference<K: StoreObject>(owner: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels stamped on every object the controller creates
pub fn standard_labels(mfc: &MeshFedConfig, component: &str) -> Labels {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/part-of".to_string(),
        bounded_name(&mfc.name_any()),
    );
    labels.insert("app.kubernetes.io/component".to_string(), component.to_string());
    labels
}

fn object_meta(name: &str, namespace: &str, labels: Labels, owner: OwnerReference) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: Some(vec![owner]),
        ..Default::default()
    }
}

pub fn fqdn(name: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", name, namespace)
}

/// Split an `ip:port` endpoint
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr> {
    endpoint
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| Error::InvalidEndpoint(endpoint.to_string()))
}

/// Keep the cluster IP the API server allocated when overwriting a Service
pub fn keep_cluster_ip(current: &Service, desired: &mut Service) {
    if let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_mut()) {
        desired.cluster_ip = current.cluster_ip.clone();
        desired.cluster_ips = current.cluster_ips.clone();
    }
}

// ============================================================================
// Gateway workload (MeshFedConfig)
// ============================================================================

pub fn gateway_service_name(mfc: &MeshFedConfig, direction: Direction) -> String {
    bounded_name(&format!(
        "istio-{}-{}-{}",
        mfc.name_any(),
        direction.as_str(),
        mfc.spec.gateway_port(direction)
    ))
}

fn gateway_workload_name(mfc: &MeshFedConfig, direction: Direction) -> String {
    format!("istio-{}-{}", mfc.name_any(), direction.as_str())
}

pub fn gateway_service_account_name(mfc: &MeshFedConfig, direction: Direction) -> String {
    format!("{}-service-account", gateway_workload_name(mfc, direction))
}

/// Service in front of a gateway workload; ingress is published through a
/// load balancer so partner meshes can reach it
pub fn gateway_service(mfc: &MeshFedConfig, direction: Direction) -> Service {
    let port = mfc.spec.gateway_port(direction);
    let service_type = match direction {
        Direction::Ingress => "LoadBalancer",
        Direction::Egress => "ClusterIP",
    };

    Service {
        metadata: object_meta(
            &gateway_service_name(mfc, direction),
            &mfc.namespace().unwrap_or_default(),
            standard_labels(mfc, &format!("{}-gateway", direction.as_str())),
            owner_reference(mfc),
        ),
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(mfc.spec.gateway_selector(direction)),
            ports: Some(vec![ServicePort {
                name: Some(format!("tls-{}", port)),
                port: port as i32,
                target_port: Some(IntOrString::Int(port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn gateway_service_account(mfc: &MeshFedConfig, direction: Direction) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(
            &gateway_service_account_name(mfc, direction),
            &mfc.namespace().unwrap_or_default(),
            standard_labels(mfc, &format!("{}-gateway", direction.as_str())),
            owner_reference(mfc),
        ),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Gateway proxy running in router mode with the federation certificates
/// from `tls_secret` mounted under [`CERT_DIR`]
pub fn gateway_deployment(
    mfc: &MeshFedConfig,
    direction: Direction,
    proxy_image: &str,
    tls_secret: &str,
) -> Result<Deployment> {
    let name = gateway_workload_name(mfc, direction);
    let selector = mfc.spec.gateway_selector(direction);
    let port = mfc.spec.gateway_port(direction);

    let mut pod_labels = standard_labels(mfc, &format!("{}-gateway", direction.as_str()));
    pod_labels.extend(selector.clone());

    let env = vec![
        field_env("NODE_NAME", "spec.nodeName"),
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
        field_env("INSTANCE_IP", "status.podIP"),
        field_env("HOST_IP", "status.hostIP"),
        field_env("SERVICE_ACCOUNT", "spec.serviceAccountName"),
        value_env("ISTIO_META_WORKLOAD_NAME", name.clone()),
        value_env("ISTIO_META_ROUTER_MODE", "sni-dnat"),
        value_env("ISTIO_METAJSON_LABELS", serde_json::to_string(&selector)?),
    ];

    let args: Vec<String> = [
        "proxy",
        "router",
        "--domain",
        "$(POD_NAMESPACE).svc.cluster.local",
        "--proxyLogLevel=warning",
        "--proxyComponentLogLevel=misc:error",
        "--log_output_level=default:info",
        "--serviceCluster",
        name.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    Ok(Deployment {
        metadata: object_meta(
            &name,
            &mfc.namespace().unwrap_or_default(),
            pod_labels.clone(),
            owner_reference(mfc),
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(gateway_service_account_name(mfc, direction)),
                    containers: vec![Container {
                        name: "istio-proxy".to_string(),
                        image: Some(proxy_image.to_string()),
                        args: Some(args),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            container_port: port as i32,
                            name: Some(format!("tls-{}", port)),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "mesh-certs".to_string(),
                            mount_path: CERT_DIR.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "mesh-certs".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(tls_secret.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

// ============================================================================
// Exposure (ServiceExposition, boundary style)
// ============================================================================

pub fn exposure_name(mfc: &MeshFedConfig, se: &ServiceExposition) -> String {
    format!("{}-{}-ingress", mfc.name_any(), se.spec.exposed_name())
}

fn mutual_server_tls() -> ServerTlsSettings {
    ServerTlsSettings {
        mode: TLS_MODE_MUTUAL.to_string(),
        server_certificate: Some(CERT_CHAIN.to_string()),
        private_key: Some(CERT_KEY.to_string()),
        ca_certificates: Some(CERT_CA.to_string()),
    }
}

fn mutual_client_tls(sni: String) -> ClientTlsSettings {
    ClientTlsSettings {
        mode: TLS_MODE_MUTUAL.to_string(),
        client_certificate: Some(CERT_CHAIN.to_string()),
        private_key: Some(CERT_KEY.to_string()),
        ca_certificates: Some(CERT_CA.to_string()),
        sni: Some(sni),
    }
}

fn istio_mutual(sni: Option<String>) -> ClientTlsSettings {
    ClientTlsSettings {
        mode: TLS_MODE_ISTIO_MUTUAL.to_string(),
        sni,
        ..Default::default()
    }
}

/// Gateway accepting partner traffic on the ingress workload
pub fn exposure_gateway(mfc: &MeshFedConfig, se: &ServiceExposition) -> Gateway {
    let port = mfc.spec.gateway_port(Direction::Ingress);
    let mut gateway = Gateway::new(
        &exposure_name(mfc, se),
        GatewaySpec {
            selector: mfc.spec.gateway_selector(Direction::Ingress),
            servers: vec![Server {
                port: ServerPort {
                    number: port,
                    name: format!("https-{}", port),
                    protocol: "HTTPS".to_string(),
                },
                hosts: vec!["*".to_string()],
                tls: Some(mutual_server_tls()),
            }],
        },
    );
    gateway.metadata = object_meta(
        &exposure_name(mfc, se),
        &se.namespace().unwrap_or_default(),
        standard_labels(mfc, "exposure"),
        owner_reference(se),
    );
    gateway
}

/// Path prefix partners use to address an exposed service
pub fn exposure_prefix(namespace: &str, exposed_name: &str) -> String {
    format!("/{}/{}/", namespace, exposed_name)
}

pub fn exposure_virtual_service(mfc: &MeshFedConfig, se: &ServiceExposition) -> VirtualService {
    let namespace = se.namespace().unwrap_or_default();
    let name = exposure_name(mfc, se);
    let mut vs = VirtualService::new(
        &name,
        VirtualServiceSpec {
            hosts: vec!["*".to_string()],
            gateways: vec![name.clone()],
            http: vec![HttpRoute {
                match_: vec![HttpMatchRequest {
                    uri: Some(StringMatch::prefix(exposure_prefix(
                        &namespace,
                        se.spec.exposed_name(),
                    ))),
                    ..Default::default()
                }],
                rewrite: Some(HttpRewrite {
                    uri: "/".to_string(),
                }),
                route: vec![RouteDestination {
                    destination: Destination {
                        host: fqdn(&se.spec.name, &namespace),
                        subset: se.spec.subset.clone().filter(|s| !s.is_empty()),
                        port: Some(PortSelector {
                            number: se.spec.port,
                        }),
                    },
                }],
            }],
            ..Default::default()
        },
    );
    vs.metadata = object_meta(
        &name,
        &namespace,
        standard_labels(mfc, "exposure"),
        owner_reference(se),
    );
    vs
}

// ============================================================================
// Binding (ServiceBinding, boundary style)
// ============================================================================

/// Names of the objects backing one binding relationship
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingNames {
    /// `<mfc>-<local name>-<binding namespace>`
    pub relationship: String,
    pub remote: String,
    pub egress: String,
    pub local: String,
    pub mfc_namespace: String,
    pub binding_namespace: String,
    /// Value of [`BINDING_LABEL`] on every object of the relationship
    pub binding: String,
}

impl BindingNames {
    pub fn new(mfc: &MeshFedConfig, sb: &ServiceBinding) -> Self {
        let binding_namespace = sb.namespace().unwrap_or_default();
        let local = sb.spec.local_name().to_string();
        let relationship = format!("{}-{}-{}", mfc.name_any(), local, binding_namespace);
        Self {
            remote: bounded_name(&format!("{}-remote", relationship)),
            egress: bounded_name(&format!("{}-egress", relationship)),
            relationship,
            local,
            mfc_namespace: mfc.namespace().unwrap_or_default(),
            binding: binding_label_value(sb),
            binding_namespace,
        }
    }

    /// Selects every object created for this binding, whatever its name
    pub fn selector(&self) -> Labels {
        Labels::from([(BINDING_LABEL.to_string(), self.binding.clone())])
    }

    fn labels(&self, mfc: &MeshFedConfig) -> Labels {
        let mut labels = standard_labels(mfc, "binding");
        labels.extend(self.selector());
        labels
    }

    pub fn remote_host(&self) -> String {
        fqdn(&self.remote, &self.mfc_namespace)
    }

    pub fn egress_host(&self) -> String {
        fqdn(&self.egress, &self.mfc_namespace)
    }

    pub fn local_host(&self) -> String {
        fqdn(&self.local, &self.binding_namespace)
    }
}

/// (a) ExternalName Service standing in for the partner's ingress
pub fn remote_ingress_service(
    mfc: &MeshFedConfig,
    names: &BindingNames,
    remote: SocketAddr,
) -> Service {
    Service {
        metadata: object_meta(
            &names.remote,
            &names.mfc_namespace,
            names.labels(mfc),
            owner_reference(mfc),
        ),
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(remote.ip().to_string()),
            ports: Some(vec![ServicePort {
                name: Some("tls".to_string()),
                port: remote.port() as i32,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// (b) mutual TLS toward the partner's ingress on the cross-mesh port
pub fn remote_destination_rule(
    mfc: &MeshFedConfig,
    names: &BindingNames,
    remote: SocketAddr,
) -> DestinationRule {
    let mut rule = DestinationRule::new(
        &names.remote,
        DestinationRuleSpec {
            host: names.remote_host(),
            export_to: vec![".".to_string()],
            traffic_policy: Some(TrafficPolicy {
                port_level_settings: vec![PortTrafficPolicy {
                    port: PortSelector {
                        number: remote.port(),
                    },
                    tls: Some(mutual_client_tls(names.remote_host())),
                }],
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    rule.metadata = object_meta(
        &names.remote,
        &names.mfc_namespace,
        names.labels(mfc),
        owner_reference(mfc),
    );
    rule
}

/// (c) the Service local clients call
pub fn local_facade_service(mfc: &MeshFedConfig, names: &BindingNames, sb: &ServiceBinding) -> Service {
    Service {
        metadata: object_meta(
            &names.local,
            &names.binding_namespace,
            names.labels(mfc),
            owner_reference(sb),
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: sb.spec.port as i32,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// (d) per-relationship Service in front of the egress workload
pub fn local_egress_service(mfc: &MeshFedConfig, names: &BindingNames) -> Service {
    Service {
        metadata: object_meta(
            &names.egress,
            &names.mfc_namespace,
            names.labels(mfc),
            owner_reference(mfc),
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(mfc.spec.gateway_selector(Direction::Egress)),
            ports: Some(vec![ServicePort {
                name: Some("tls".to_string()),
                port: EGRESS_TLS_PORT as i32,
                target_port: Some(IntOrString::Int(
                    mfc.spec.gateway_port(Direction::Egress) as i32,
                )),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// (e) egress Gateway accepting mesh-internal mutual TLS for the relationship
pub fn egress_gateway(mfc: &MeshFedConfig, names: &BindingNames) -> Gateway {
    let mut gateway = Gateway::new(
        &names.egress,
        GatewaySpec {
            selector: mfc.spec.gateway_selector(Direction::Egress),
            servers: vec![Server {
                port: ServerPort {
                    number: EGRESS_TLS_PORT,
                    name: format!("tls-{}", names.relationship),
                    protocol: "TLS".to_string(),
                },
                hosts: vec![names.egress_host()],
                tls: Some(ServerTlsSettings {
                    mode: TLS_MODE_ISTIO_MUTUAL.to_string(),
                    ..Default::default()
                }),
            }],
        },
    );
    gateway.metadata = object_meta(
        &names.egress,
        &names.mfc_namespace,
        names.labels(mfc),
        owner_reference(mfc),
    );
    gateway
}

/// (f) subset selecting the egress workload for this relationship
pub fn egress_destination_rule(mfc: &MeshFedConfig, names: &BindingNames) -> DestinationRule {
    let mut rule = DestinationRule::new(
        &names.egress,
        DestinationRuleSpec {
            host: names.egress_host(),
            subsets: vec![Subset {
                name: names.relationship.clone(),
                labels: Labels::new(),
                traffic_policy: Some(TrafficPolicy {
                    port_level_settings: vec![PortTrafficPolicy {
                        port: PortSelector {
                            number: EGRESS_TLS_PORT,
                        },
                        tls: Some(istio_mutual(Some(names.egress_host()))),
                    }],
                    ..Default::default()
                }),
            }],
            ..Default::default()
        },
    );
    rule.metadata = object_meta(
        &names.egress,
        &names.mfc_namespace,
        names.labels(mfc),
        owner_reference(mfc),
    );
    rule
}

/// (g) SNI route from the egress Gateway to the partner's ingress
pub fn egress_virtual_service(
    mfc: &MeshFedConfig,
    names: &BindingNames,
    remote: SocketAddr,
) -> VirtualService {
    let mut vs = VirtualService::new(
        &names.egress,
        VirtualServiceSpec {
            hosts: vec![names.egress_host()],
            gateways: vec![names.egress.clone()],
            tls: vec![TlsRoute {
                match_: vec![TlsMatchAttributes {
                    sni_hosts: vec![names.egress_host()],
                    gateways: vec![names.egress.clone()],
                    port: Some(EGRESS_TLS_PORT),
                }],
                route: vec![RouteDestination {
                    destination: Destination {
                        host: names.remote_host(),
                        subset: None,
                        port: Some(PortSelector {
                            number: remote.port(),
                        }),
                    },
                }],
            }],
            ..Default::default()
        },
    );
    vs.metadata = object_meta(
        &names.egress,
        &names.mfc_namespace,
        names.labels(mfc),
        owner_reference(mfc),
    );
    vs
}

/// (h) namespace-local route sending facade traffic into the egress subset
pub fn local_virtual_service(
    mfc: &MeshFedConfig,
    names: &BindingNames,
    sb: &ServiceBinding,
) -> VirtualService {
    let mut vs = VirtualService::new(
        &names.local,
        VirtualServiceSpec {
            hosts: vec![names.local_host()],
            export_to: vec![".".to_string()],
            http: vec![HttpRoute {
                rewrite: Some(HttpRewrite {
                    uri: exposure_prefix(&names.binding_namespace, &sb.spec.name),
                }),
                route: vec![RouteDestination {
                    destination: Destination {
                        host: names.egress_host(),
                        subset: Some(names.relationship.clone()),
                        port: Some(PortSelector {
                            number: EGRESS_TLS_PORT,
                        }),
                    },
                }],
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    vs.metadata = object_meta(
        &names.local,
        &names.binding_namespace,
        names.labels(mfc),
        owner_reference(sb),
    );
    vs
}

// ============================================================================
// Binding (ServiceBinding, passthrough style)
// ============================================================================

/// `<namespace>.<name>` of the binding, bounded to a valid label value
pub fn binding_label_value(sb: &ServiceBinding) -> String {
    bounded_name(&format!(
        "{}.{}",
        sb.namespace().unwrap_or_default(),
        sb.name_any()
    ))
}

pub fn binding_selector(sb: &ServiceBinding) -> Labels {
    Labels::from([(BINDING_LABEL.to_string(), binding_label_value(sb))])
}

fn passthrough_labels(mfc: &MeshFedConfig, sb: &ServiceBinding) -> Labels {
    let mut labels = standard_labels(mfc, "binding");
    labels.extend(binding_selector(sb));
    labels
}

/// Static MESH_EXTERNAL entry resolving the local name to the partner endpoint
pub fn passthrough_service_entry(
    mfc: &MeshFedConfig,
    sb: &ServiceBinding,
    remote: SocketAddr,
) -> ServiceEntry {
    let namespace = sb.namespace().unwrap_or_default();
    let local = sb.spec.local_name();
    let mut entry = ServiceEntry::new(
        local,
        ServiceEntrySpec {
            hosts: vec![fqdn(local, &namespace)],
            ports: vec![ServiceEntryPort {
                number: sb.spec.port,
                name: "tls".to_string(),
                protocol: "TLS".to_string(),
            }],
            location: "MESH_EXTERNAL".to_string(),
            resolution: "STATIC".to_string(),
            endpoints: vec![WorkloadEntry {
                address: remote.ip().to_string(),
                ports: BTreeMap::from([("tls".to_string(), remote.port())]),
            }],
        },
    );
    entry.metadata = object_meta(
        local,
        &namespace,
        passthrough_labels(mfc, sb),
        owner_reference(sb),
    );
    entry
}

pub fn passthrough_destination_rule(mfc: &MeshFedConfig, sb: &ServiceBinding) -> DestinationRule {
    let namespace = sb.namespace().unwrap_or_default();
    let local = sb.spec.local_name();
    let mut rule = DestinationRule::new(
        local,
        DestinationRuleSpec {
            host: fqdn(local, &namespace),
            traffic_policy: Some(TrafficPolicy {
                tls: Some(mutual_client_tls(fqdn(&sb.spec.name, &namespace))),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    rule.metadata = object_meta(
        local,
        &namespace,
        passthrough_labels(mfc, sb),
        owner_reference(sb),
    );
    rule
}

pub fn passthrough_service(mfc: &MeshFedConfig, sb: &ServiceBinding) -> Service {
    let namespace = sb.namespace().unwrap_or_default();
    Service {
        metadata: object_meta(
            sb.spec.local_name(),
            &namespace,
            passthrough_labels(mfc, sb),
            owner_reference(sb),
        ),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("tls".to_string()),
                port: sb.spec.port as i32,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
