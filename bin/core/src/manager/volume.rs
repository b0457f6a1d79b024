//! Persistent volume manager: store CRUD, backend provisioning
//! and the purge safety rules.

use anyhow::{Context, anyhow};
use mungos::{find::find_collect, mongodb::bson::doc};
use pivot_client::entities::volume::{
  PersistentVolume, VolumeScope, VolumeState,
};
use reqwest::StatusCode;
use serror::AddStatusCodeError;

use crate::{
  backends::volume as volume_api,
  manager::container,
  state::db_client,
};

pub async fn get_local_volume(
  app_id: &str,
  vol_id: &str,
) -> serror::Result<PersistentVolume> {
  get_volume(doc! { "id": vol_id, "appliance": app_id }).await
}

pub async fn get_global_volume(
  vol_id: &str,
) -> serror::Result<PersistentVolume> {
  get_volume(doc! { "id": vol_id, "scope": "GLOBAL" }).await
}

async fn get_volume(
  filter: mungos::mongodb::bson::Document,
) -> serror::Result<PersistentVolume> {
  db_client()
    .volumes
    .find_one(filter.clone())
    .await
    .context("failed to query store for volume")?
    .with_context(|| {
      format!("Volume matching '{filter}' is not found")
    })
    .map_err(|e| e.status_code(StatusCode::NOT_FOUND))
}

pub async fn get_local_volumes(
  app_id: &str,
) -> serror::Result<Vec<PersistentVolume>> {
  let volumes = find_collect(
    &db_client().volumes,
    doc! { "appliance": app_id, "scope": "LOCAL" },
    None,
  )
  .await
  .context("failed to query store for volumes")?;
  Ok(volumes)
}

pub async fn get_global_volumes()
-> serror::Result<Vec<PersistentVolume>> {
  let volumes = find_collect(
    &db_client().volumes,
    doc! { "scope": "GLOBAL" },
    None,
  )
  .await
  .context("failed to query store for volumes")?;
  Ok(volumes)
}

/// Global volumes an appliance is subscribed to.
pub async fn get_global_volumes_used_by(
  app_id: &str,
) -> serror::Result<Vec<PersistentVolume>> {
  let volumes = find_collect(
    &db_client().volumes,
    doc! { "scope": "GLOBAL", "used_by": app_id },
    None,
  )
  .await
  .context("failed to query store for volumes")?;
  Ok(volumes)
}

/// Overlay the placement the volume backend reports, for reads.
/// Degrades to the stored record when the backend has no entry.
pub async fn read_deployment(
  mut vol: PersistentVolume,
) -> PersistentVolume {
  match volume_api::get_volume(&vol.external_name()).await {
    Ok(response) => {
      vol.deployment.placement = response.placement;
    }
    Err(e) => {
      debug!(
        "No backend deployment for volume '{}' | {:#}",
        vol.id, e.error
      );
    }
  }
  vol
}

pub async fn create_volume(
  vol: &PersistentVolume,
) -> serror::Result<()> {
  let exists = match vol.scope {
    VolumeScope::Local => {
      get_local_volume(&vol.appliance, &vol.id).await.is_ok()
    }
    VolumeScope::Global => {
      get_global_volume(&vol.id).await.is_ok()
    }
  };
  if exists {
    return Err(
      anyhow!("Volume '{}' already exists", vol.id)
        .status_code(StatusCode::CONFLICT),
    );
  }
  save_volume(vol).await
}

pub async fn save_volume(
  vol: &PersistentVolume,
) -> serror::Result<()> {
  let filter = match vol.scope {
    VolumeScope::Local => {
      doc! { "id": &vol.id, "appliance": &vol.appliance }
    }
    VolumeScope::Global => {
      doc! { "id": &vol.id, "scope": "GLOBAL" }
    }
  };
  db_client()
    .volumes
    .replace_one(filter, vol)
    .upsert(true)
    .await
    .context("failed to persist volume")?;
  Ok(())
}

/// Create the volume on the backend and mark it active. The
/// placement preference falls back to the user hints when the
/// scheduler set none.
pub async fn provision_volume(
  vol: &PersistentVolume,
) -> serror::Result<PersistentVolume> {
  let mut vol = vol.clone();
  if vol.sys_schedule_hints.placement.is_empty() {
    vol.sys_schedule_hints = vol.user_schedule_hints.clone();
  }
  let request = volume_api::volume_request(&vol);
  match volume_api::create_volume(&request).await {
    Ok(_) => {}
    Err(e) if e.status == StatusCode::CONFLICT => {
      debug!(
        "Volume '{}' already exists on the backend",
        vol.id
      );
    }
    Err(e) => return Err(e),
  }
  vol.state = VolumeState::Active;
  save_volume(&vol).await?;
  Ok(vol)
}

/// Detach the volume on the backend, keeping the data.
pub async fn deprovision_volume(
  vol: &PersistentVolume,
) -> serror::Result<PersistentVolume> {
  let mut vol = vol.clone();
  match volume_api::delete_volume(&vol.external_name(), false)
    .await
  {
    Ok(_) => {}
    Err(e) if e.status == StatusCode::NOT_FOUND => {}
    Err(e) => return Err(e),
  }
  vol.state = VolumeState::Inactive;
  save_volume(&vol).await?;
  Ok(vol)
}

/// Purge a global volume: refused while any appliance still
/// subscribes to it.
pub async fn purge_global_volume(
  vol_id: &str,
) -> serror::Result<String> {
  let vol = get_global_volume(vol_id).await?;
  if !vol.used_by.is_empty() {
    return Err(
      anyhow!(
        "Failed to delete the global persistent volume '{vol_id}': being used by appliance(s): {:?}",
        vol.used_by.iter().collect::<Vec<_>>()
      )
      .status_code(StatusCode::BAD_REQUEST),
    );
  }
  let vol = deprovision_volume(&vol).await?;
  purge_external(&vol).await?;
  db_client()
    .volumes
    .delete_one(doc! { "id": vol_id, "scope": "GLOBAL" })
    .await
    .context("failed to delete volume record")?;
  Ok(format!(
    "Global persistent volume '{vol_id}' has been purged"
  ))
}

/// Purge a local volume: refused while any container of its
/// appliance still mounts it.
pub async fn purge_local_volume(
  app_id: &str,
  vol_id: &str,
) -> serror::Result<String> {
  let vol = get_local_volume(app_id, vol_id).await?;
  let in_use = container::get_containers(app_id)
    .await?
    .into_iter()
    .filter(|contr| {
      contr.persistent_volumes().any(|v| v.src == vol_id)
    })
    .map(|contr| contr.id)
    .collect::<Vec<_>>();
  if !in_use.is_empty() {
    return Err(
      anyhow!(
        "Failed to delete the local persistent volume '{vol_id}': being used by container(s): {in_use:?}"
      )
      .status_code(StatusCode::BAD_REQUEST),
    );
  }
  purge_external(&vol).await?;
  db_client()
    .volumes
    .delete_one(doc! { "id": vol_id, "appliance": app_id })
    .await
    .context("failed to delete volume record")?;
  Ok(format!(
    "Local persistent volume '{vol_id}' has been purged"
  ))
}

async fn purge_external(
  vol: &PersistentVolume,
) -> serror::Result<()> {
  match volume_api::delete_volume(&vol.external_name(), true)
    .await
  {
    Ok(_) => Ok(()),
    Err(e) if e.status == StatusCode::NOT_FOUND => Ok(()),
    Err(e) => Err(e),
  }
}

pub async fn subscribe_global_volume(
  vol_id: &str,
  app_id: &str,
) -> serror::Result<PersistentVolume> {
  let mut vol = get_global_volume(vol_id).await?;
  vol.subscribe(app_id);
  save_volume(&vol).await?;
  Ok(vol)
}

/// Unsubscribe on appliance deletion. An already-gone volume is
/// not an error.
pub async fn unsubscribe_global_volume(
  vol_id: &str,
  app_id: &str,
) -> serror::Result<()> {
  let mut vol = match get_global_volume(vol_id).await {
    Ok(vol) => vol,
    Err(e) if e.status == StatusCode::NOT_FOUND => {
      return Ok(());
    }
    Err(e) => return Err(e),
  };
  vol.unsubscribe(app_id);
  save_volume(&vol).await
}
