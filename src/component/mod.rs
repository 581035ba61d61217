use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::TypeMeta;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::*;

use crate::{is_not_found, Result, FIELD_MANAGER};

pub mod istio;
pub mod kubestatemetrics;
pub mod managedresources;
pub mod operatorgrafana;
pub mod prometheus_cache;
pub mod registry;
pub mod vali;

pub use registry::Registry;

pub const LABEL_GARDEN_ROLE: &str = "gardener.cloud/role";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_APP: &str = "app";
pub const LABEL_CARE_CONDITION_TYPE: &str = "care.gardener.cloud/condition-type";
pub const LABEL_NETWORK_POLICY_TO_DNS: &str = "networking.gardener.cloud/to-dns";
pub const LABEL_NETWORK_POLICY_TO_RUNTIME_APISERVER: &str =
    "networking.gardener.cloud/to-runtime-apiserver";
pub const LABEL_NETWORK_POLICY_ALLOWED: &str = "allowed";
pub const ANNOTATION_DELETE_ON_INVALID_UPDATE: &str =
    "resources.gardener.cloud/delete-on-invalid-update";

pub const GARDEN_NAMESPACE: &str = "garden";
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Kind of cluster a component is deployed for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterType {
    Seed,
    Shoot,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Seed => "seed",
            ClusterType::Shoot => "shoot",
        }
    }
}

/// Where a shoot component's object lives: in the shoot itself, or in its seed namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceClass {
    Application,
    Runtime,
}

/// One fully rendered object plus the class deciding how it is deployed
#[derive(Clone, Debug)]
pub struct ResourceConfig {
    pub class: ResourceClass,
    pub object: DynamicObject,
    pub resource: ApiResource,
}

impl ResourceConfig {
    pub fn new<K>(class: ResourceClass, obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut object: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        Ok(Self {
            class,
            object,
            resource,
        })
    }

    pub fn application<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Self::new(ResourceClass::Application, obj)
    }

    pub fn runtime<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Self::new(ResourceClass::Runtime, obj)
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    fn api(&self, client: Client, namespace: &str) -> Api<DynamicObject> {
        let namespace = self
            .object
            .namespace()
            .unwrap_or_else(|| namespace.to_string());
        Api::namespaced_with(client, &namespace, &self.resource)
    }
}

/// Deploys and waits for one component
#[allow(async_fn_in_trait)]
pub trait DeployWaiter {
    async fn deploy(&self) -> Result<()>;
    async fn destroy(&self) -> Result<()>;
    async fn wait(&self) -> Result<()>;
    async fn wait_cleanup(&self) -> Result<()>;
}

/// Submit `configs` for `cluster_type`. Seed components go into one ManagedResource of class
/// `seed`. Shoot components split: application objects go into a ManagedResource targeting the
/// shoot, runtime objects are applied directly into `namespace`.
pub async fn deploy_resource_configs(
    client: &Client,
    namespace: &str,
    cluster_type: ClusterType,
    managed_resource_name: &str,
    managed_resource_labels: BTreeMap<String, String>,
    configs: &[ResourceConfig],
) -> Result<()> {
    let mut registry = Registry::new();

    if cluster_type == ClusterType::Seed {
        registry.add_all(configs.iter().map(|c| &c.object))?;
        return managedresources::create_for_seed_with_labels(
            client,
            namespace,
            managed_resource_name,
            false,
            managed_resource_labels,
            registry.serialized_objects(),
        )
        .await;
    }

    registry.add_all(
        configs
            .iter()
            .filter(|c| c.class == ResourceClass::Application)
            .map(|c| &c.object),
    )?;
    apply_resource_configs(
        client,
        namespace,
        configs
            .iter()
            .filter(|c| c.class == ResourceClass::Runtime),
    )
    .await?;

    managedresources::create_for_shoot(
        client,
        namespace,
        managed_resource_name,
        managedresources::LABEL_VALUE_GARDENER,
        false,
        registry.serialized_objects(),
    )
    .await
}

/// Server-side apply each config directly, defaulting to `namespace` for namespaced objects
pub async fn apply_resource_configs<'a>(
    client: &Client,
    namespace: &str,
    configs: impl IntoIterator<Item = &'a ResourceConfig>,
) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let configs: Vec<&'a ResourceConfig> = configs.into_iter().collect();
    for config in configs {
        let api = config.api(client.clone(), namespace);
        let name = config.name();
        debug!(
            "Applying {} {} in namespace {}",
            config.kind(),
            name,
            namespace
        );
        api.patch(&name, &params, &Patch::Apply(&config.object))
            .await?;
    }
    Ok(())
}

/// Inverse of [`deploy_resource_configs`]; objects that are already gone are ignored
pub async fn destroy_resource_configs(
    client: &Client,
    namespace: &str,
    cluster_type: ClusterType,
    managed_resource_name: &str,
    configs: &[ResourceConfig],
) -> Result<()> {
    if cluster_type == ClusterType::Seed {
        return managedresources::delete_for_seed(client, namespace, managed_resource_name).await;
    }

    managedresources::delete_for_shoot(client, namespace, managed_resource_name).await?;

    for config in configs
        .iter()
        .filter(|c| c.class == ResourceClass::Runtime)
    {
        let api = config.api(client.clone(), namespace);
        match api.delete(&config.name(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Server-side apply `obj` with the gardenlet field manager
pub async fn apply<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug,
{
    let name = obj.name_any();
    debug!(
        "Applying {} {} in namespace {}",
        K::kind(&()),
        name,
        obj.namespace().unwrap_or_default()
    );
    let params = PatchParams::apply(FIELD_MANAGER).force();
    Ok(api.patch(&name, &params, &Patch::Apply(obj)).await?)
}

/// Delete `name`, treating NotFound as success
pub async fn delete_ignore_not_found<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    debug!("Deleting {} {}", K::kind(&()), name);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Type-erased reference to an object that should be removed
#[derive(Clone, Debug)]
pub struct ObjectKey {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster<K: Resource<DynamicType = ()>>(name: &str) -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespace: None,
            name: name.into(),
        }
    }

    pub fn dynamic(resource: ApiResource, namespace: &str, name: &str) -> Self {
        Self {
            resource,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

/// Delete every referenced object in order, treating NotFound as success
pub async fn delete_objects(client: &Client, keys: &[ObjectKey]) -> Result<()> {
    for key in keys {
        let api: Api<DynamicObject> = match &key.namespace {
            Some(namespace) => Api::namespaced_with(client.clone(), namespace, &key.resource),
            None => Api::all_with(client.clone(), &key.resource),
        };
        debug!("Deleting {} {}", key.resource.kind, key.name);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Delete all objects of kind `K` in the api's scope matching every label in `labels`
pub async fn delete_all_of<K>(api: &Api<K>, labels: &BTreeMap<String, String>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let selector = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    debug!("Deleting all {} with labels {}", K::kind(&()), selector);
    api.delete_collection(&DeleteParams::default(), &ListParams::default().labels(&selector))
        .await?;
    Ok(())
}

pub fn object_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: (!namespace.is_empty()).then(|| namespace.into()),
        labels: (!labels.is_empty()).then_some(labels),
        ..Default::default()
    }
}

pub fn label_selector(labels: BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels),
        match_expressions: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::api::rbac::v1::ClusterRole;

    use crate::fixtures::mock_client;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: object_meta(name, "shoot--foo--bar", BTreeMap::new()),
            ..Default::default()
        }
    }

    fn cluster_role(name: &str) -> ClusterRole {
        ClusterRole {
            metadata: object_meta(name, "", BTreeMap::new()),
            ..Default::default()
        }
    }

    #[test]
    fn resource_config_carries_type_information() {
        let config = ResourceConfig::runtime(&config_map("foo")).unwrap();
        assert_eq!(config.kind(), "ConfigMap");
        assert_eq!(config.name(), "foo");
        let types = config.object.types.unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "ConfigMap");
    }

    #[tokio::test]
    async fn shoot_runtime_objects_are_applied_directly() {
        let (client, mut server) = mock_client();
        let configs = vec![
            ResourceConfig::application(&cluster_role("gardener.cloud:foo")).unwrap(),
            ResourceConfig::runtime(&config_map("foo")).unwrap(),
        ];

        let server = tokio::spawn(async move {
            let applied = server
                .echo(
                    Method::PATCH,
                    "/api/v1/namespaces/shoot--foo--bar/configmaps/foo",
                )
                .await;
            assert_eq!(applied["kind"], "ConfigMap");

            let secret = server
                .echo(
                    Method::PATCH,
                    "/api/v1/namespaces/shoot--foo--bar/secrets/managedresource-foo",
                )
                .await;
            let keys: Vec<_> = secret["data"].as_object().unwrap().keys().cloned().collect();
            assert_eq!(keys, vec!["clusterrole____gardener.cloud_foo.yaml"]);

            let mr = server
                .echo(
                    Method::PATCH,
                    "/apis/resources.gardener.cloud/v1alpha1/namespaces/shoot--foo--bar/managedresources/foo",
                )
                .await;
            assert_eq!(mr["metadata"]["labels"]["origin"], "gardener");
            assert!(mr["spec"].get("class").is_none());
        });

        deploy_resource_configs(
            &client,
            "shoot--foo--bar",
            ClusterType::Shoot,
            "foo",
            BTreeMap::new(),
            &configs,
        )
        .await
        .unwrap();
        server.await.unwrap();
    }
}
