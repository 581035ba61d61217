//! istiod, its ingress gateways and the network policies around them, deployed into the seed
//! as one ManagedResource.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
    NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::json;
use tracing::*;

use super::managedresources;
use super::{
    apply, delete_ignore_not_found, label_selector, object_meta, DeployWaiter, Registry,
    LABEL_APP, LABEL_GARDEN_ROLE,
};
use crate::{is_not_found, Result};

pub const MANAGED_RESOURCE_NAME: &str = "istio";
pub const MANAGED_RESOURCE_NAME_ISTIO_SYSTEM: &str = "istio-system";
pub const ISTIO_SYSTEM_NAMESPACE: &str = "istio-system";

/// Names of the ManagedResources making up an istio installation
pub fn managed_resource_names(istiod_enabled: bool) -> Vec<&'static str> {
    if istiod_enabled {
        vec![MANAGED_RESOURCE_NAME, MANAGED_RESOURCE_NAME_ISTIO_SYSTEM]
    } else {
        vec![MANAGED_RESOURCE_NAME_ISTIO_SYSTEM]
    }
}

const ISTIOD_NAME: &str = "istiod";
const ISTIOD_PORT_WEBHOOK_SERVER: i32 = 10250;
const ISTIOD_PORT_XDS: i32 = 15012;
const ISTIOD_PORT_METRICS: i32 = 15014;

const INGRESS_GATEWAY_NAME: &str = "istio-ingressgateway";
const INGRESS_GATEWAY_PORT_TLS: i32 = 9443;
const INGRESS_GATEWAY_PORT_STATUS: i32 = 15021;

pub const LABEL_ISTIO_OPERATOR_MANAGED: &str = "istio-operator-managed";
pub const LABEL_ISTIO_INJECTION: &str = "istio-injection";
pub const LABEL_EXPOSURE_CLASS_HANDLER_NAME: &str = "handler.exposureclass.gardener.cloud/name";
pub const LABEL_DEFAULT_ZONE_KEY: &str = "istio";
pub const GARDEN_ROLE_EXPOSURE_CLASS_HANDLER: &str = "exposureclass-handler";

pub const LABEL_HA_CONSIDER: &str = "high-availability-config.resources.gardener.cloud/consider";
pub const ANNOTATION_HA_ZONES: &str = "high-availability-config.resources.gardener.cloud/zones";
pub const ANNOTATION_HA_ZONE_PINNING: &str =
    "high-availability-config.resources.gardener.cloud/zone-pinning";

/// EnvoyFilters from older istio versions; rotate on every istio upgrade
const LEGACY_ENVOY_FILTERS: &[&str] = &[
    "tcp-stats-filter-1.11",
    "stats-filter-1.11",
    "tcp-stats-filter-1.12",
    "stats-filter-1.12",
];

#[derive(Clone, Debug, Default)]
pub struct IstiodValues {
    pub trust_domain: String,
    pub image: String,
    pub node_local_ipvs_address: Option<String>,
    pub dns_server_address: Option<String>,
    pub zones: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct IngressGateway {
    pub namespace: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Overrides the istiod zones when set
    pub zones: Vec<String>,
}

/// Gateway namespace that accepts the PROXY protocol when API server SNI is enabled
#[derive(Clone, Debug, Default)]
pub struct ProxyProtocol {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

pub struct Istio {
    client: Client,
    namespace: String,
    values: IstiodValues,
    ingress_gateways: Vec<IngressGateway>,
    proxy_protocol: Vec<ProxyProtocol>,
    sni_enabled: bool,
    /// istiod is left out when another party (the garden) manages it
    istiod_enabled: bool,
}

impl Istio {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        values: IstiodValues,
        ingress_gateways: Vec<IngressGateway>,
        proxy_protocol: Vec<ProxyProtocol>,
        sni_enabled: bool,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            values,
            ingress_gateways,
            proxy_protocol,
            sni_enabled,
            istiod_enabled: true,
        }
    }

    pub fn with_istiod_enabled(mut self, enabled: bool) -> Self {
        self.istiod_enabled = enabled;
        self
    }

    pub fn istiod_enabled(&self) -> bool {
        self.istiod_enabled
    }

    fn istiod_namespace(&self) -> Namespace {
        let labels = BTreeMap::from([
            (LABEL_ISTIO_OPERATOR_MANAGED.into(), "Reconcile".into()),
            (LABEL_ISTIO_INJECTION.into(), "disabled".into()),
            (LABEL_HA_CONSIDER.into(), "true".into()),
        ]);
        let mut metadata = object_meta(&self.namespace, "", labels);
        metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_HA_ZONES.into(),
            self.values.zones.join(","),
        )]));
        Namespace {
            metadata,
            ..Default::default()
        }
    }

    fn gateway_namespace(&self, gateway: &IngressGateway) -> Namespace {
        let mut labels = BTreeMap::from([
            (LABEL_ISTIO_OPERATOR_MANAGED.to_string(), "Reconcile".to_string()),
            (LABEL_ISTIO_INJECTION.into(), "disabled".into()),
            (LABEL_HA_CONSIDER.into(), "true".into()),
        ]);
        if let Some(role) = gateway.labels.get(LABEL_GARDEN_ROLE) {
            if role.starts_with(GARDEN_ROLE_EXPOSURE_CLASS_HANDLER) {
                labels.insert(LABEL_GARDEN_ROLE.into(), role.clone());
            }
        }
        for key in [LABEL_EXPOSURE_CLASS_HANDLER_NAME, LABEL_DEFAULT_ZONE_KEY] {
            if let Some(value) = gateway.labels.get(key) {
                labels.insert(key.into(), value.clone());
            }
        }

        let zones = if gateway.zones.is_empty() {
            &self.values.zones
        } else {
            &gateway.zones
        };
        let mut annotations = BTreeMap::from([(ANNOTATION_HA_ZONES.into(), zones.join(","))]);
        if zones.len() == 1 {
            annotations.insert(ANNOTATION_HA_ZONE_PINNING.into(), "true".into());
        }

        let mut metadata = object_meta(&gateway.namespace, "", labels);
        metadata.annotations = Some(annotations);
        Namespace {
            metadata,
            ..Default::default()
        }
    }

    fn istiod_labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.into(), ISTIOD_NAME.into()),
            ("istio".into(), "pilot".into()),
        ])
    }

    fn istiod_service(&self) -> Service {
        let port = |name: &str, port: i32, target_port: i32| ServicePort {
            name: Some(name.into()),
            port,
            target_port: Some(IntOrString::Int(target_port)),
            protocol: Some("TCP".into()),
            ..Default::default()
        };
        Service {
            metadata: object_meta(ISTIOD_NAME, &self.namespace, Self::istiod_labels()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(Self::istiod_labels()),
                ports: Some(vec![
                    port("https-webhook", 443, ISTIOD_PORT_WEBHOOK_SERVER),
                    port("grpc-xds", ISTIOD_PORT_XDS, ISTIOD_PORT_XDS),
                    port("metrics", ISTIOD_PORT_METRICS, ISTIOD_PORT_METRICS),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn istiod_deployment(&self) -> Deployment {
        let args = [
            "discovery".to_string(),
            format!("--monitoringAddr=:{ISTIOD_PORT_METRICS}"),
            "--grpcAddr=".to_string(),
            format!("--httpsAddr=:{ISTIOD_PORT_WEBHOOK_SERVER}"),
            "--domain".to_string(),
            self.values.trust_domain.clone(),
        ];
        Deployment {
            metadata: object_meta(ISTIOD_NAME, &self.namespace, Self::istiod_labels()),
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                selector: label_selector(Self::istiod_labels()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(Self::istiod_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        priority_class_name: Some(ISTIOD_NAME.into()),
                        service_account_name: Some(ISTIOD_NAME.into()),
                        containers: vec![Container {
                            name: "discovery".into(),
                            image: Some(self.values.image.clone()),
                            args: Some(args.to_vec()),
                            ports: Some(
                                [ISTIOD_PORT_WEBHOOK_SERVER, ISTIOD_PORT_XDS, ISTIOD_PORT_METRICS]
                                    .map(|p| ContainerPort {
                                        container_port: p,
                                        protocol: Some("TCP".into()),
                                        ..Default::default()
                                    })
                                    .to_vec(),
                            ),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ingress_gateway_service(gateway: &IngressGateway) -> Service {
        let mut metadata = object_meta(INGRESS_GATEWAY_NAME, &gateway.namespace, gateway.labels.clone());
        metadata.annotations = (!gateway.annotations.is_empty()).then(|| gateway.annotations.clone());
        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                selector: Some(gateway.labels.clone()),
                ports: Some(vec![
                    ServicePort {
                        name: Some("tcp".into()),
                        port: 443,
                        target_port: Some(IntOrString::Int(INGRESS_GATEWAY_PORT_TLS)),
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("status-port".into()),
                        port: INGRESS_GATEWAY_PORT_STATUS,
                        target_port: Some(IntOrString::Int(INGRESS_GATEWAY_PORT_STATUS)),
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ingress_gateway_deployment(gateway: &IngressGateway) -> Deployment {
        Deployment {
            metadata: object_meta(INGRESS_GATEWAY_NAME, &gateway.namespace, gateway.labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                selector: label_selector(gateway.labels.clone()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(gateway.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(INGRESS_GATEWAY_NAME.into()),
                        containers: vec![Container {
                            name: INGRESS_GATEWAY_NAME.into(),
                            image: Some(gateway.image.clone()),
                            args: Some(vec![
                                "proxy".into(),
                                "router".into(),
                                "--domain".into(),
                                format!("{}.svc.cluster.local", gateway.namespace),
                            ]),
                            ports: Some(
                                [INGRESS_GATEWAY_PORT_TLS, INGRESS_GATEWAY_PORT_STATUS]
                                    .map(|p| ContainerPort {
                                        container_port: p,
                                        protocol: Some("TCP".into()),
                                        ..Default::default()
                                    })
                                    .to_vec(),
                            ),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// EnvoyFilter making the gateway listener accept the PROXY protocol
    fn proxy_protocol_envoy_filter(proxy: &ProxyProtocol) -> DynamicObject {
        let mut filter = DynamicObject::new("proxy-protocol", &envoy_filter_resource())
            .within(&proxy.namespace)
            .data(json!({
                "spec": {
                    "workloadSelector": {"labels": proxy.labels},
                    "configPatches": [{
                        "applyTo": "LISTENER",
                        "match": {"context": "GATEWAY", "listener": {"portNumber": 8443}},
                        "patch": {
                            "operation": "MERGE",
                            "value": {
                                "listener_filters": [{
                                    "name": "envoy.filters.listener.proxy_protocol",
                                }]
                            }
                        }
                    }]
                }
            }));
        filter.metadata.labels = (!proxy.labels.is_empty()).then(|| proxy.labels.clone());
        filter
    }

    /// DNS egress restricted to the cluster DNS and node-local DNS addresses, if known
    fn dns_egress(&self) -> NetworkPolicyEgressRule {
        let to = [
            self.values.dns_server_address.as_deref(),
            self.values.node_local_ipvs_address.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(|address| NetworkPolicyPeer {
            ip_block: Some(IPBlock {
                cidr: format!("{address}/32"),
                except: None,
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

        NetworkPolicyEgressRule {
            to: (!to.is_empty()).then_some(to),
            ports: Some(
                ["UDP", "TCP"]
                    .map(|protocol| NetworkPolicyPort {
                        protocol: Some(protocol.into()),
                        port: Some(IntOrString::Int(53)),
                        ..Default::default()
                    })
                    .to_vec(),
            ),
        }
    }

    fn network_policy(
        name: &str,
        namespace: &str,
        pod_selector: BTreeMap<String, String>,
        ingress: Option<Vec<NetworkPolicyIngressRule>>,
        egress: Option<Vec<NetworkPolicyEgressRule>>,
    ) -> NetworkPolicy {
        let mut policy_types = Vec::new();
        if ingress.is_some() {
            policy_types.push("Ingress".to_string());
        }
        if egress.is_some() {
            policy_types.push("Egress".to_string());
        }
        NetworkPolicy {
            metadata: object_meta(name, namespace, BTreeMap::new()),
            spec: Some(NetworkPolicySpec {
                pod_selector: label_selector(pod_selector),
                ingress,
                egress,
                policy_types: Some(policy_types),
            }),
        }
    }

    fn istio_system_network_policies(&self) -> Vec<NetworkPolicy> {
        let port = |port: i32| NetworkPolicyPort {
            protocol: Some("TCP".into()),
            port: Some(IntOrString::Int(port)),
            ..Default::default()
        };
        vec![
            Self::network_policy(
                "allow-to-istiod-webhook-server-port",
                &self.namespace,
                Self::istiod_labels(),
                Some(vec![NetworkPolicyIngressRule {
                    ports: Some(vec![port(ISTIOD_PORT_WEBHOOK_SERVER)]),
                    from: None,
                }]),
                None,
            ),
            Self::network_policy(
                "allow-from-istio-ingress",
                &self.namespace,
                Self::istiod_labels(),
                Some(vec![NetworkPolicyIngressRule {
                    ports: Some(vec![port(ISTIOD_PORT_XDS)]),
                    from: Some(vec![NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                LABEL_ISTIO_OPERATOR_MANAGED.into(),
                                "Reconcile".into(),
                            )])),
                            ..Default::default()
                        }),
                        pod_selector: Some(LabelSelector::default()),
                        ..Default::default()
                    }]),
                }]),
                None,
            ),
            Self::network_policy(
                "allow-to-dns",
                &self.namespace,
                Self::istiod_labels(),
                None,
                Some(vec![self.dns_egress()]),
            ),
        ]
    }

    fn ingress_network_policies(&self, gateway: &IngressGateway) -> Vec<NetworkPolicy> {
        vec![
            Self::network_policy(
                "allow-to-istiod",
                &gateway.namespace,
                gateway.labels.clone(),
                None,
                Some(vec![NetworkPolicyEgressRule {
                    to: Some(vec![NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "kubernetes.io/metadata.name".into(),
                                self.namespace.clone(),
                            )])),
                            ..Default::default()
                        }),
                        pod_selector: Some(label_selector(Self::istiod_labels())),
                        ..Default::default()
                    }]),
                    ports: Some(vec![NetworkPolicyPort {
                        protocol: Some("TCP".into()),
                        port: Some(IntOrString::Int(ISTIOD_PORT_XDS)),
                        ..Default::default()
                    }]),
                }]),
            ),
            Self::network_policy(
                "allow-to-dns",
                &gateway.namespace,
                gateway.labels.clone(),
                None,
                Some(vec![self.dns_egress()]),
            ),
        ]
    }

    /// istiod, the ingress gateways and their envoy filters
    fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        registry.add(&self.istiod_service())?;
        registry.add(&self.istiod_deployment())?;

        for gateway in &self.ingress_gateways {
            registry.add(&Self::ingress_gateway_service(gateway))?;
            registry.add(&Self::ingress_gateway_deployment(gateway))?;
        }

        if self.sni_enabled {
            for proxy in &self.proxy_protocol {
                registry.add(&Self::proxy_protocol_envoy_filter(proxy))?;
            }
        }

        Ok(registry)
    }

    /// Network policies of istio-system and the gateway namespaces
    fn istio_system_registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        registry.add_all(&self.istio_system_network_policies())?;
        for gateway in &self.ingress_gateways {
            registry.add_all(&self.ingress_network_policies(gateway))?;
        }
        Ok(registry)
    }
}

fn envoy_filter_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "networking.istio.io",
        "v1alpha3",
        "EnvoyFilter",
    ))
}

impl DeployWaiter for Istio {
    async fn deploy(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        apply(&namespaces, &self.istiod_namespace()).await?;

        let envoy_filters: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &envoy_filter_resource());
        for name in LEGACY_ENVOY_FILTERS {
            debug!("Deleting EnvoyFilter {} in namespace {}", name, self.namespace);
            match envoy_filters.delete(name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for gateway in &self.ingress_gateways {
            apply(&namespaces, &self.gateway_namespace(gateway)).await?;
        }

        info!("Deploying istio in namespace {}", self.namespace);
        if self.istiod_enabled {
            managedresources::create_for_seed(
                &self.client,
                &self.namespace,
                MANAGED_RESOURCE_NAME,
                false,
                self.registry()?.serialized_objects(),
            )
            .await?;
        }
        managedresources::create_for_seed(
            &self.client,
            &self.namespace,
            MANAGED_RESOURCE_NAME_ISTIO_SYSTEM,
            false,
            self.istio_system_registry()?.serialized_objects(),
        )
        .await
    }

    async fn destroy(&self) -> Result<()> {
        for name in managed_resource_names(self.istiod_enabled) {
            managedresources::delete_for_seed(&self.client, &self.namespace, name).await?;
        }
        if !self.istiod_enabled {
            return Ok(());
        }

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        delete_ignore_not_found(&namespaces, &self.namespace).await?;
        for gateway in &self.ingress_gateways {
            delete_ignore_not_found(&namespaces, &gateway.namespace).await?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        for name in managed_resource_names(self.istiod_enabled) {
            managedresources::wait_until_healthy(&self.client, &self.namespace, name).await?;
        }
        Ok(())
    }

    async fn wait_cleanup(&self) -> Result<()> {
        for name in managed_resource_names(self.istiod_enabled) {
            managedresources::wait_until_deleted(&self.client, &self.namespace, name).await?;
        }
        Ok(())
    }
}
