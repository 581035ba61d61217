//! Hands the volume of a shoot's Loki over to Vali by re-binding its PV to a PVC with Vali's name.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::*;

use super::MigrationOptions;
use crate::component::delete_ignore_not_found;
use crate::component::vali::{LOKI_PVC_NAME, PVC_NAME};
use crate::utils::polling::{Attempt, PollingConfig};
use crate::{Error, Result};

const STEPS: usize = 9;

fn step(n: usize, what: &str) {
    info!("Step {n}/{STEPS}: {what}");
}

async fn patch_reclaim_policy(api: &Api<PersistentVolume>, name: &str, policy: &str) -> Result<()> {
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"persistentVolumeReclaimPolicy": policy}})),
    )
    .await?;
    Ok(())
}

/// The claim taking over the volume of `loki`; `loki` label values become `vali`
fn vali_pvc(loki: &PersistentVolumeClaim, namespace: &str) -> PersistentVolumeClaim {
    let labels = loki.metadata.labels.clone().map(|labels| {
        labels
            .into_iter()
            .map(|(k, v)| if v == "loki" { (k, "vali".into()) } else { (k, v) })
            .collect()
    });

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(PVC_NAME.into()),
            namespace: Some(namespace.into()),
            annotations: loki.metadata.annotations.clone(),
            labels,
            ..Default::default()
        },
        spec: loki.spec.clone(),
        status: None,
    }
}

/// Rename the PVC `loki-loki-0` in `namespace` to `vali-vali-0`, keeping the data.
///
/// PVC names are immutable, so the PV is switched to `Retain`, the old claim deleted, the PV
/// released and bound to a new claim with the Vali name. Does nothing without a Loki PVC. When the
/// PV is lost on the way the error says so, and the next run starts over with a fresh volume.
pub async fn rename_loki_pvc_to_vali_pvc(
    client: &Client,
    namespace: &str,
    options: &MigrationOptions,
) -> Result<()> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let pvs: Api<PersistentVolume> = Api::all(client.clone());

    step(1, "Get Loki PVC");
    let Some(loki_pvc) = pvcs.get_opt(LOKI_PVC_NAME).await? else {
        info!("Loki PVC not found in {namespace}, skipping rename");
        return Ok(());
    };
    info!("Renaming Loki PVC to Vali in {namespace}");

    step(2, "Get Loki PV");
    let pv_name = loki_pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .unwrap_or_default();
    pvs.get(&pv_name).await?;

    step(3, "Patch Loki PV's reclaim policy to Retain");
    patch_reclaim_policy(&pvs, &pv_name, "Retain").await?;

    // The reclaim policy change must be observed before the claim goes away, or the PV is deleted
    // along with it.
    step(4, "Wait for the reclaim policy change to settle");
    tokio::time::sleep(options.settle).await;

    step(5, "Delete Loki PVC");
    delete_ignore_not_found(&pvcs, LOKI_PVC_NAME).await?;

    step(6, "Wait until the Loki PVC is gone");
    {
        let pvcs = &pvcs;
        PollingConfig::new(
            options.timeout,
            options.interval,
            format!("deletion of PVC {namespace}/{LOKI_PVC_NAME}"),
        )
        .poll(|| async move {
            Ok(match pvcs.get_opt(LOKI_PVC_NAME).await? {
                Some(_) => Attempt::Retry("still exists".into()),
                None => Attempt::Ready(()),
            })
        })
        .await?;
    }

    match pvs.get_opt(&pv_name).await? {
        None => {
            info!("Loki PV {pv_name} not found, the PVC deletion was processed before the reclaim policy change");
            return Err(Error::VolumeLost(pv_name));
        }
        Some(pv) if pv.metadata.deletion_timestamp.is_some() => {
            return Err(Error::VolumeLost(pv_name));
        }
        Some(_) => {}
    }

    step(7, "Remove Loki PV's claimRef");
    pvs.patch(
        &pv_name,
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"claimRef": null}})),
    )
    .await?;

    step(8, "Create Vali PVC");
    if let Err(err) = pvcs
        .create(&PostParams::default(), &vali_pvc(&loki_pvc, namespace))
        .await
    {
        error!("Creating Vali PVC in {namespace} failed: {err}");
        return Err(err.into());
    }

    {
        let pvcs = &pvcs;
        PollingConfig::new(
            options.timeout,
            options.interval,
            format!("PVC {namespace}/{PVC_NAME} to be bound"),
        )
        .poll(|| async move {
            let phase = pvcs
                .get_opt(PVC_NAME)
                .await?
                .and_then(|pvc| pvc.status)
                .and_then(|s| s.phase)
                .unwrap_or_default();
            Ok(if phase == "Bound" {
                Attempt::Ready(())
            } else {
                Attempt::Retry(format!("phase is {phase:?}"))
            })
        })
        .await?;
    }

    // A deleted Vali PVC must not leak the PV
    step(9, "Patch Vali PV's reclaim policy to Delete");
    patch_reclaim_policy(&pvs, &pv_name, "Delete").await?;

    info!("Successfully renamed Loki PVC to Vali in {namespace}");
    Ok(())
}
