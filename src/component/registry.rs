use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Collects serialized manifests keyed by their file name within a ManagedResource secret
#[derive(Clone, Debug, Default)]
pub struct Registry {
    objects: BTreeMap<String, Vec<u8>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `obj` to YAML and register it. Objects must carry `kind` and `metadata.name`.
    pub fn add<T: Serialize>(&mut self, obj: &T) -> Result<()> {
        let value = serde_json::to_value(obj)?;
        let key = object_key(&value);
        self.objects.insert(key, serde_yaml::to_string(&value)?.into_bytes());
        Ok(())
    }

    pub fn add_all<'a, T: Serialize + 'a>(
        &mut self,
        objs: impl IntoIterator<Item = &'a T>,
    ) -> Result<()> {
        for obj in objs {
            self.add(obj)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// The registered manifests as secret data
    pub fn serialized_objects(&self) -> BTreeMap<String, ByteString> {
        self.objects
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.clone())))
            .collect()
    }
}

/// `<kind>__<namespace>__<name>.yaml` with the kind lower-cased and `:` in names replaced
fn object_key(value: &Value) -> String {
    let kind = value["kind"].as_str().unwrap_or_default().to_lowercase();
    let namespace = value["metadata"]["namespace"].as_str().unwrap_or_default();
    let name = value["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .replace(':', "_");
    format!("{kind}__{namespace}__{name}.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use kube::api::ObjectMeta;

    #[test]
    fn keys_follow_kind_namespace_name() {
        let mut registry = Registry::new();
        registry
            .add(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some("foo".into()),
                    namespace: Some("garden".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        registry
            .add(&ClusterRole {
                metadata: ObjectMeta {
                    name: Some("gardener.cloud:monitoring:kube-state-metrics".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            registry.keys().collect::<Vec<_>>(),
            vec![
                "clusterrole____gardener.cloud_monitoring_kube-state-metrics.yaml",
                "configmap__garden__foo.yaml",
            ]
        );
    }

    #[test]
    fn serialized_objects_are_yaml() {
        let mut registry = Registry::new();
        registry
            .add(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some("foo".into()),
                    namespace: Some("garden".into()),
                    ..Default::default()
                },
                data: Some([("key".to_string(), "value".to_string())].into()),
                ..Default::default()
            })
            .unwrap();

        let data = registry.serialized_objects();
        let manifest: ConfigMap =
            serde_yaml::from_slice(&data["configmap__garden__foo.yaml"].0).unwrap();
        assert_eq!(manifest.metadata.name.as_deref(), Some("foo"));
        assert_eq!(manifest.data.unwrap()["key"], "value");
    }
}
