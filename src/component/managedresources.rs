//! Creating, deleting and health-checking `ManagedResource` objects and their manifest secrets.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{LocalObjectReference, Secret};
use k8s_openapi::ByteString;
use kube::{Api, Client, ResourceExt};
use tracing::*;

use super::{apply, delete_ignore_not_found, object_meta, LABEL_GARDEN_ROLE};
use crate::resources::core::CONDITION_TRUE;
use crate::resources::managedresources::{
    ManagedResource, ManagedResourceSpec, CONDITION_RESOURCES_APPLIED,
    CONDITION_RESOURCES_HEALTHY, CONDITION_RESOURCES_PROGRESSING,
};
use crate::utils::polling::{Attempt, PollingConfig};
use crate::{Error, Result};

/// Timeout used while waiting for ManagedResources to become healthy or deleted
pub const TIMEOUT_WAIT_FOR_MANAGED_RESOURCE: Duration = Duration::from_secs(2 * 60);
pub const INTERVAL_WAIT_FOR_MANAGED_RESOURCE: Duration = Duration::from_secs(2);

pub const LABEL_ORIGIN: &str = "origin";
pub const LABEL_VALUE_GARDENER: &str = "gardener";
pub const LABEL_VALUE_SEED_SYSTEM_COMPONENT: &str = "seed-system-component";
pub const LABEL_NO_CLEANUP: &str = "shoot.gardener.cloud/no-cleanup";
pub const CLASS_SEED: &str = "seed";

pub fn secret_name(managed_resource_name: &str) -> String {
    format!("managedresource-{managed_resource_name}")
}

/// Create or update a ManagedResource applied into the seed itself
pub async fn create_for_seed(
    client: &Client,
    namespace: &str,
    name: &str,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    create_for_seed_with_labels(client, namespace, name, keep_objects, BTreeMap::new(), data).await
}

pub async fn create_for_seed_with_labels(
    client: &Client,
    namespace: &str,
    name: &str,
    keep_objects: bool,
    mut labels: BTreeMap<String, String>,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    labels.insert(
        LABEL_GARDEN_ROLE.into(),
        LABEL_VALUE_SEED_SYSTEM_COMPONENT.into(),
    );
    create(
        client,
        namespace,
        name,
        labels,
        ManagedResourceSpec {
            class: Some(CLASS_SEED.into()),
            keep_objects: Some(keep_objects),
            ..Default::default()
        },
        data,
    )
    .await
}

/// Create or update a ManagedResource applied into the shoot targeted by `namespace`
pub async fn create_for_shoot(
    client: &Client,
    namespace: &str,
    name: &str,
    origin: &str,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    create(
        client,
        namespace,
        name,
        BTreeMap::from([(LABEL_ORIGIN.into(), origin.into())]),
        ManagedResourceSpec {
            inject_labels: Some(BTreeMap::from([(LABEL_NO_CLEANUP.into(), "true".into())])),
            keep_objects: Some(keep_objects),
            ..Default::default()
        },
        data,
    )
    .await
}

async fn create(
    client: &Client,
    namespace: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    mut spec: ManagedResourceSpec,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret_name = secret_name(name);
    apply(
        &secrets,
        &Secret {
            metadata: object_meta(&secret_name, namespace, BTreeMap::new()),
            type_: Some("Opaque".into()),
            data: Some(data),
            ..Default::default()
        },
    )
    .await?;

    spec.secret_refs = vec![LocalObjectReference { name: secret_name }];
    let mut managed_resource = ManagedResource::new(name, spec);
    managed_resource.metadata = object_meta(name, namespace, labels);

    let mrs: Api<ManagedResource> = Api::namespaced(client.clone(), namespace);
    apply(&mrs, &managed_resource).await?;
    Ok(())
}

pub async fn delete_for_seed(client: &Client, namespace: &str, name: &str) -> Result<()> {
    delete(client, namespace, name).await
}

pub async fn delete_for_shoot(client: &Client, namespace: &str, name: &str) -> Result<()> {
    delete(client, namespace, name).await
}

async fn delete(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let mrs: Api<ManagedResource> = Api::namespaced(client.clone(), namespace);
    delete_ignore_not_found(&mrs, name).await?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    delete_ignore_not_found(&secrets, &secret_name(name)).await
}

/// Returns an error describing the first reason for which `mr` is not healthy yet
pub fn check_managed_resource(mr: &ManagedResource) -> Result<()> {
    let not_ready = |message: String, reason: &str| Error::NotReady {
        message,
        reason: reason.into(),
        requeue_after: None,
    };

    let generation = mr.metadata.generation.unwrap_or_default();
    let observed = mr
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or_default();
    if generation != observed {
        return Err(not_ready(
            format!(
                "observed generation of managed resource {}/{} outdated ({observed}/{generation})",
                mr.namespace().unwrap_or_default(),
                mr.name_any()
            ),
            "OutdatedGeneration",
        ));
    }

    for condition_type in [CONDITION_RESOURCES_APPLIED, CONDITION_RESOURCES_HEALTHY] {
        match mr.condition(condition_type) {
            None => {
                return Err(not_ready(
                    format!("condition {condition_type:?} is missing"),
                    "ConditionMissing",
                ))
            }
            Some(c) if c.status != CONDITION_TRUE => {
                return Err(not_ready(
                    format!(
                        "condition {:?} has invalid status {} (expected {CONDITION_TRUE}) due to {}: {}",
                        c.r#type,
                        c.status,
                        c.reason.as_deref().unwrap_or_default(),
                        c.message.as_deref().unwrap_or_default()
                    ),
                    c.reason.as_deref().unwrap_or(condition_type),
                ))
            }
            Some(_) => {}
        }
    }

    if let Some(c) = mr.condition(CONDITION_RESOURCES_PROGRESSING) {
        if c.status == CONDITION_TRUE {
            return Err(not_ready(
                format!(
                    "condition {:?} has invalid status {} (expected False) due to {}: {}",
                    c.r#type,
                    c.status,
                    c.reason.as_deref().unwrap_or_default(),
                    c.message.as_deref().unwrap_or_default()
                ),
                c.reason.as_deref().unwrap_or(CONDITION_RESOURCES_PROGRESSING),
            ));
        }
    }

    Ok(())
}

/// Wait until the ManagedResource is healthy, failing after [`TIMEOUT_WAIT_FOR_MANAGED_RESOURCE`]
pub async fn wait_until_healthy(client: &Client, namespace: &str, name: &str) -> Result<()> {
    wait_until_healthy_with(
        client,
        namespace,
        name,
        PollingConfig::new(
            TIMEOUT_WAIT_FOR_MANAGED_RESOURCE,
            INTERVAL_WAIT_FOR_MANAGED_RESOURCE,
            format!("ManagedResource {namespace}/{name} to become healthy"),
        ),
    )
    .await
}

pub async fn wait_until_healthy_with(
    client: &Client,
    namespace: &str,
    name: &str,
    polling: PollingConfig,
) -> Result<()> {
    let mrs = &Api::<ManagedResource>::namespaced(client.clone(), namespace);
    polling
        .poll(|| async move {
            let Some(mr) = mrs.get_opt(name).await? else {
                return Ok(Attempt::Retry(format!(
                    "managed resource {namespace}/{name} does not exist"
                )));
            };
            match check_managed_resource(&mr) {
                Ok(()) => Ok(Attempt::Ready(())),
                Err(Error::NotReady { message, .. }) => Ok(Attempt::Retry(message)),
                Err(err) => Err(err),
            }
        })
        .await?;
    info!("ManagedResource {namespace}/{name} is healthy");
    Ok(())
}

/// Wait until the ManagedResource is gone, failing after [`TIMEOUT_WAIT_FOR_MANAGED_RESOURCE`]
pub async fn wait_until_deleted(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let mrs = &Api::<ManagedResource>::namespaced(client.clone(), namespace);
    PollingConfig::new(
        TIMEOUT_WAIT_FOR_MANAGED_RESOURCE,
        INTERVAL_WAIT_FOR_MANAGED_RESOURCE,
        format!("ManagedResource {namespace}/{name} to be deleted"),
    )
    .poll(|| async move {
        Ok(match mrs.get_opt(name).await? {
            Some(_) => Attempt::Retry(format!("managed resource {namespace}/{name} still exists")),
            None => Attempt::Ready(()),
        })
    })
    .await
}
