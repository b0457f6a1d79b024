//! Appliance lifecycle: create with compensating rollback,
//! delete with backend deprovisioning, and the deletion enforcer
//! that waits out the backend before dropping the record.

use std::{collections::HashSet, time::Duration};

use anyhow::{Context, anyhow};
use mungos::{find::find_collect, mongodb::bson::doc};
use pivot_client::entities::{
  appliance::Appliance,
  volume::{PersistentVolume, VolumeScope},
};
use reqwest::StatusCode;
use serror::AddStatusCodeError;

use crate::{
  backends::marathon,
  config::core_config,
  dag::ContainerDag,
  manager::{container, volume},
  scheduler::appliance::spawn_appliance_scheduler,
  state::{db_client, global_scheduler},
};

pub async fn get_appliance(
  app_id: &str,
) -> serror::Result<Appliance> {
  let mut app = db_client()
    .appliances
    .find_one(doc! { "id": app_id })
    .await
    .context("failed to query store for appliance")?
    .with_context(|| {
      format!("Appliance '{app_id}' is not found")
    })
    .map_err(|e| e.status_code(StatusCode::NOT_FOUND))?;
  app.containers = container::get_containers(app_id).await?;
  // declared volumes carry the live state of their records
  if let Some(data_persistence) = &mut app.data_persistence {
    for vol in &mut data_persistence.volumes {
      let stored = match vol.scope {
        VolumeScope::Local => {
          volume::get_local_volume(app_id, &vol.id).await
        }
        VolumeScope::Global => {
          volume::get_global_volume(&vol.id).await
        }
      };
      if let Ok(stored) = stored {
        *vol = stored;
      }
    }
  }
  Ok(app)
}

pub async fn list_appliances() -> serror::Result<Vec<Appliance>>
{
  let appliances =
    find_collect(&db_client().appliances, None, None)
      .await
      .context("failed to query store for appliances")?;
  Ok(appliances)
}

/// Parse, validate and provision a new appliance, then start its
/// scheduler. Any failure rolls the partially created state back
/// before the error returns.
pub async fn create_appliance(
  body: serde_json::Value,
) -> serror::Result<Appliance> {
  let app = Appliance::parse(body)
    .map_err(|e| e.status_code(StatusCode::BAD_REQUEST))?;
  // dependency validity and cycles: 422
  ContainerDag::construct(app.containers.iter().cloned())?;
  if db_client()
    .appliances
    .find_one(doc! { "id": &app.id })
    .await
    .context("failed to query store for appliance")?
    .is_some()
  {
    return Err(
      anyhow!("Appliance '{}' already exists", app.id)
        .status_code(StatusCode::CONFLICT),
    );
  }
  match provision_appliance(&app).await {
    Ok(()) => {
      spawn_appliance_scheduler(&app)?;
      Ok(app)
    }
    Err(e) => {
      warn!(
        "Failed to create appliance '{}', rolling back | {:#}",
        app.id, e.error
      );
      rollback_appliance(&app).await;
      Err(e)
    }
  }
}

async fn provision_appliance(
  app: &Appliance,
) -> serror::Result<()> {
  let declared = app
    .volumes()
    .iter()
    .map(|vol| vol.id.clone())
    .collect::<HashSet<_>>();
  for vol in app.volumes() {
    match vol.scope {
      VolumeScope::Local => {
        match volume::get_local_volume(&app.id, &vol.id).await {
          Ok(_) => {}
          Err(e) if e.status == StatusCode::NOT_FOUND => {
            volume::create_volume(vol).await?;
          }
          Err(e) => return Err(e),
        }
      }
      VolumeScope::Global => {
        subscribe_or_create(vol, &app.id).await?;
      }
    }
  }
  // undeclared global mounts must already exist cluster-wide
  for contr in &app.containers {
    for mount in contr
      .persistent_volumes()
      .filter(|m| m.scope == VolumeScope::Global)
    {
      if declared.contains(&mount.src) {
        continue;
      }
      match volume::subscribe_global_volume(&mount.src, &app.id)
        .await
      {
        Ok(_) => {}
        Err(e) if e.status == StatusCode::NOT_FOUND => {
          return Err(
            anyhow!(
              "Volume '{}' mounted by container '{}' does not exist",
              mount.src,
              contr.id
            )
            .status_code(StatusCode::BAD_REQUEST),
          );
        }
        Err(e) => return Err(e),
      }
    }
  }
  for contr in &app.containers {
    container::create_container(contr).await?;
  }
  db_client()
    .appliances
    .replace_one(doc! { "id": &app.id }, app)
    .upsert(true)
    .await
    .context("failed to persist appliance")?;
  Ok(())
}

async fn subscribe_or_create(
  vol: &PersistentVolume,
  app_id: &str,
) -> serror::Result<()> {
  match volume::subscribe_global_volume(&vol.id, app_id).await {
    Ok(_) => Ok(()),
    Err(e) if e.status == StatusCode::NOT_FOUND => {
      let mut vol = vol.clone();
      vol.appliance = String::new();
      vol.subscribe(app_id);
      volume::create_volume(&vol).await
    }
    Err(e) => Err(e),
  }
}

/// Best effort removal of whatever a failed create left behind.
async fn rollback_appliance(app: &Appliance) {
  for contr in &app.containers {
    if let Err(e) = container::delete_container(contr).await {
      warn!(
        "Rollback of container '{}' failed | {:#}",
        contr.id, e.error
      );
    }
  }
  for vol in app.volumes() {
    let result = match vol.scope {
      VolumeScope::Local => {
        volume::purge_local_volume(&app.id, &vol.id).await
      }
      VolumeScope::Global => {
        volume::unsubscribe_global_volume(&vol.id, &app.id)
          .await
          .map(|_| String::new())
      }
    };
    if let Err(e) = result
      && e.status != StatusCode::NOT_FOUND
    {
      warn!(
        "Rollback of volume '{}' failed | {:#}",
        vol.id, e.error
      );
    }
  }
  if let Err(e) = db_client()
    .appliances
    .delete_one(doc! { "id": &app.id })
    .await
  {
    warn!(
      "Rollback of appliance '{}' failed | {e:#}",
      app.id
    );
  }
}

/// Stop the scheduler, deprovision containers and volumes, ask
/// the service backend to drop the group, and leave the record
/// deletion to the enforcer.
pub async fn delete_appliance(
  app_id: &str,
  purge_data: bool,
) -> serror::Result<String> {
  let app = get_appliance(app_id).await?;
  info!("Stop scheduling appliance '{app_id}'");
  if let Some(handle) = global_scheduler().deregister(app_id) {
    handle.cancel.cancel();
  }
  container::delete_containers(app_id).await.map_err(|e| {
    anyhow!(
      "Failed to deprovision containers of appliance '{app_id}' | {:#}",
      e.error
    )
    .status_code(StatusCode::BAD_REQUEST)
  })?;
  if app.data_persistence.is_some() {
    for vol in volume::get_local_volumes(app_id).await? {
      let result = if purge_data {
        volume::purge_local_volume(app_id, &vol.id)
          .await
          .map(|_| ())
      } else {
        volume::deprovision_volume(&vol).await.map(|_| ())
      };
      if let Err(e) = result
        && e.status != StatusCode::NOT_FOUND
      {
        error!(
          "Failed to deprovision volume '{}' of appliance '{app_id}' | {:#}",
          vol.id, e.error
        );
      }
    }
  }
  // the appliance no longer holds any global volume
  for vol in
    volume::get_global_volumes_used_by(app_id).await?
  {
    if let Err(e) =
      volume::unsubscribe_global_volume(&vol.id, app_id).await
    {
      error!(
        "Failed to unsubscribe appliance '{app_id}' from volume '{}' | {:#}",
        vol.id, e.error
      );
    }
  }
  match marathon::delete_group(app_id, true).await {
    Ok(_) => {}
    Err(e) if e.status == StatusCode::NOT_FOUND => {}
    Err(e) => {
      return Err(
        anyhow!(
          "Failed to deprovision appliance '{app_id}' | {:#}",
          e.error
        )
        .status_code(StatusCode::BAD_REQUEST),
      );
    }
  }
  spawn_deletion_enforcer(app_id.to_string());
  Ok(format!("Appliance '{app_id}' is being deleted"))
}

/// Poll the service backend until no deployment touches the
/// appliance anymore, then finish the teardown and stop.
fn spawn_deletion_enforcer(app_id: String) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(
      core_config().schedule_interval_secs,
    ));
    let prefix = format!("/{app_id}/");
    loop {
      interval.tick().await;
      let deployments = match marathon::get_deployments().await {
        Ok(deployments) => deployments,
        Err(e) => {
          warn!(
            "Deletion enforcer for '{app_id}' failed to poll deployments | {:#}",
            e.error
          );
          continue;
        }
      };
      let affected = deployments.iter().any(|deployment| {
        deployment
          .affected_apps
          .iter()
          .any(|app| app.starts_with(&prefix))
      });
      if affected {
        continue;
      }
      match marathon::delete_group(&app_id, false).await {
        Ok(_) => {}
        Err(e) if e.status == StatusCode::NOT_FOUND => {}
        Err(e) => {
          warn!(
            "Deletion enforcer for '{app_id}' failed to delete the group | {:#}",
            e.error
          );
          continue;
        }
      }
      if let Err(e) = db_client()
        .appliances
        .delete_one(doc! { "id": &app_id })
        .await
      {
        warn!(
          "Deletion enforcer for '{app_id}' failed to delete the record | {e:#}"
        );
        continue;
      }
      info!("Appliance '{app_id}' has been deleted");
      break;
    }
  });
}

/// Restart the scheduler of every stored appliance on boot. The
/// ensembles rebuild from the container records; finished
/// appliances converge and stop on their own.
pub async fn restore_appliance_schedulers() {
  let appliances = match list_appliances().await {
    Ok(appliances) => appliances,
    Err(e) => {
      error!(
        "Failed to restore appliance schedulers | {:#}",
        e.error
      );
      return;
    }
  };
  for app in appliances {
    info!("Restoring scheduler for appliance '{}'", app.id);
    if let Err(e) = spawn_appliance_scheduler(&app) {
      error!(
        "Failed to restore scheduler for appliance '{}' | {:#}",
        app.id, e.error
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pivot_client::entities::container::{
    Container, Resources,
  };

  // Store-backed paths are covered by integration environments;
  // here the pure validation path is pinned down.
  #[test]
  fn create_rejects_cycles_before_touching_the_store() {
    let a = Container {
      id: "a".into(),
      appliance: "test-app".into(),
      image: "ubuntu".into(),
      resources: Resources::default(),
      dependencies: vec!["b".into()],
      ..Default::default()
    };
    let b = Container {
      id: "b".into(),
      dependencies: vec!["a".into()],
      ..a.clone()
    };
    let err =
      ContainerDag::construct([a, b]).unwrap_err();
    assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
  }
}
