//! Housekeeping the seed reconciliation runs before deploying its system components.

use std::cmp::Ordering;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::*;

use super::MigrationOptions;
use crate::component::vali::{NAME as VALI, PVC_NAME as VALI_PVC};
use crate::component::{delete_ignore_not_found, delete_objects, ObjectKey, GARDEN_NAMESPACE};
use crate::utils::polling::{Attempt, PollingConfig};
use crate::utils::quantity;
use crate::{is_not_found, Result};

/// PriorityClasses replaced by the `gardener-system-*` classes
const LEGACY_PRIORITY_CLASSES: &[&str] = &["reversed-vpn-auth-server", "fluent-bit"];

pub async fn cleanup_legacy_priority_classes(client: &Client) -> Result<()> {
    let keys: Vec<ObjectKey> = LEGACY_PRIORITY_CLASSES
        .iter()
        .map(|name| ObjectKey::cluster::<PriorityClass>(name))
        .collect();
    delete_objects(client, &keys).await
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

fn is_scaled_to_zero(sts: &StatefulSet) -> bool {
    let generation = sts.metadata.generation.unwrap_or_default();
    let status = sts.status.as_ref();
    status.and_then(|s| s.observed_generation).unwrap_or_default() >= generation
        && sts.spec.as_ref().and_then(|s| s.replicas) == Some(0)
        && status.map(|s| s.replicas).unwrap_or_default() == 0
}

/// Bring the garden Vali volume to `new_storage`.
///
/// Vali is scaled down first. A larger size is applied to the PVC in place, a smaller one
/// deletes the PVC so it is recreated from the StatefulSet's claim template. The StatefulSet is
/// deleted in both cases since its claim template is immutable.
pub async fn resize_or_delete_vali_data_volume(
    client: &Client,
    new_storage: &Quantity,
    options: &MigrationOptions,
) -> Result<()> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), GARDEN_NAMESPACE);
    let stateful_sets: Api<StatefulSet> = Api::namespaced(client.clone(), GARDEN_NAMESPACE);

    let Some(pvc) = pvcs.get_opt(VALI_PVC).await? else {
        return Ok(());
    };
    let current = storage_request(&pvc).cloned().unwrap_or_default();
    let ordering = quantity::compare(new_storage, &current)?;
    if ordering == Ordering::Equal {
        return Ok(());
    }

    info!(
        "Vali volume size changes from {} to {}, scaling down {GARDEN_NAMESPACE}/{VALI}",
        current.0, new_storage.0
    );
    let scaled_down = match stateful_sets
        .patch(
            VALI,
            &PatchParams::default(),
            &Patch::Merge(json!({"spec": {"replicas": 0}})),
        )
        .await
    {
        Ok(_) => true,
        Err(kube::Error::Api(e)) if e.code == 404 => false,
        Err(err) => return Err(err.into()),
    };

    if scaled_down {
        let stateful_sets = &stateful_sets;
        PollingConfig::new(
            options.timeout,
            options.interval,
            format!("StatefulSet {GARDEN_NAMESPACE}/{VALI} to be scaled to zero"),
        )
        .poll(|| async move {
            Ok(match stateful_sets.get_opt(VALI).await? {
                Some(sts) if !is_scaled_to_zero(&sts) => {
                    Attempt::Retry("replicas still running".into())
                }
                _ => Attempt::Ready(()),
            })
        })
        .await?;
    }

    if ordering == Ordering::Greater {
        info!("Patching storage of PVC {GARDEN_NAMESPACE}/{VALI_PVC} to {}", new_storage.0);
        let patch = json!({"spec": {"resources": {"requests": {"storage": new_storage}}}});
        match pvcs
            .patch(VALI_PVC, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    } else {
        info!("Deleting PVC {GARDEN_NAMESPACE}/{VALI_PVC} to shrink it to {}", new_storage.0);
        delete_ignore_not_found(&pvcs, VALI_PVC).await?;
    }

    delete_ignore_not_found(&stateful_sets, VALI).await
}
