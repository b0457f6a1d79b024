//! Container manager: store CRUD plus backend deprovisioning.

use anyhow::{Context, anyhow};
use mungos::{find::find_collect, mongodb::bson::doc};
use pivot_client::entities::{
  container::{Container, ContainerState, ContainerType},
  pivot_timestamp,
  task::TaskState,
};
use reqwest::StatusCode;
use serror::AddStatusCodeError;

use crate::{
  manager::{appliance, task},
  state::db_client,
};

pub async fn get_container(
  app_id: &str,
  contr_id: &str,
) -> serror::Result<Container> {
  db_client()
    .containers
    .find_one(doc! { "id": contr_id, "appliance": app_id })
    .await
    .context("failed to query store for container")?
    .with_context(|| {
      format!(
        "Container '{contr_id}' is not found in appliance '{app_id}'"
      )
    })
    .map_err(|e| e.status_code(StatusCode::NOT_FOUND))
}

pub async fn get_containers(
  app_id: &str,
) -> serror::Result<Vec<Container>> {
  let containers = find_collect(
    &db_client().containers,
    doc! { "appliance": app_id },
    None,
  )
  .await
  .context("failed to query store for containers")?;
  Ok(containers)
}

/// A container for an API read, reconciled against the backends
/// when the stored record is older than `ttl` seconds. A backend
/// 404 past submission deletes the ghost record.
pub async fn get_container_fresh(
  app_id: &str,
  contr_id: &str,
  ttl_secs: u64,
) -> serror::Result<Container> {
  let contr = get_container(app_id, contr_id).await?;
  let now = pivot_timestamp();
  let fresh = contr.last_update.is_some_and(|last_update| {
    now - last_update <= (ttl_secs * 1000) as i64
  });
  if fresh {
    return Ok(contr);
  }
  let app = appliance::get_appliance(app_id).await?;
  let mut contr = contr;
  let mut gone = false;
  for i in 0..contr.tasks.len() {
    let task = &contr.tasks[i];
    let updated = match contr.container_type() {
      ContainerType::Service => {
        task::update_service_task(&app, &contr, task)
          .await
          .map(|update| update.map(|update| update.task))
      }
      ContainerType::Job => {
        task::update_job_task(&app, &contr, task).await
      }
    };
    match updated {
      Ok(Some(task)) => contr.tasks[i] = task,
      Ok(None) => {}
      Err(e) if e.status == StatusCode::NOT_FOUND => {
        if contr.tasks[i].state != TaskState::Submitted {
          gone = true;
          break;
        }
      }
      Err(e) => {
        warn!(
          "Failed to refresh container '{contr_id}' of appliance '{app_id}' | {:#}",
          e.error
        );
        return Ok(contr);
      }
    }
  }
  if gone {
    info!(
      "Deleted ghost container '{contr_id}' of appliance '{app_id}'"
    );
    delete_container_record(app_id, contr_id).await?;
    return Err(
      anyhow!(
        "Container '{contr_id}' is not found in appliance '{app_id}'"
      )
      .status_code(StatusCode::NOT_FOUND),
    );
  }
  contr.endpoints = contr
    .tasks
    .iter()
    .flat_map(|task| task.endpoints.iter().cloned())
    .collect();
  contr.name_endpoints();
  contr.state = ContainerState::of_container(&contr);
  save_container(&contr).await?;
  Ok(contr)
}

pub async fn create_container(
  contr: &Container,
) -> serror::Result<()> {
  if get_container(&contr.appliance, &contr.id).await.is_ok() {
    return Err(
      anyhow!("Container '{}' already exists", contr.id)
        .status_code(StatusCode::CONFLICT),
    );
  }
  save_container(contr).await
}

pub async fn save_container(
  contr: &Container,
) -> serror::Result<()> {
  let mut contr = contr.clone();
  contr.last_update = Some(pivot_timestamp());
  db_client()
    .containers
    .replace_one(
      doc! { "id": &contr.id, "appliance": &contr.appliance },
      &contr,
    )
    .upsert(true)
    .await
    .context("failed to persist container")?;
  Ok(())
}

/// Drop the stored record only, leaving the backends alone. Used
/// when reconciliation finds the backend side already gone.
pub async fn delete_container_record(
  app_id: &str,
  contr_id: &str,
) -> serror::Result<()> {
  db_client()
    .containers
    .delete_many(doc! { "id": contr_id, "appliance": app_id })
    .await
    .context("failed to delete container record")?;
  Ok(())
}

/// Deprovision a container from its backend and drop the record.
/// A backend 404 means the work is already done.
pub async fn delete_container(
  contr: &Container,
) -> serror::Result<()> {
  let app_id = &contr.appliance;
  for seqno in 0..contr.instances {
    let task_id = format!("{}-{seqno}", contr.id);
    match contr.container_type() {
      ContainerType::Service => {
        tolerate_gone(
          task::delete_service_task(app_id, &task_id).await,
        )?;
      }
      ContainerType::Job => {
        tolerate_gone(
          task::kill_job_task(app_id, &task_id).await,
        )?;
        tolerate_gone(
          task::delete_job_task(app_id, &task_id).await,
        )?;
      }
    }
  }
  delete_container_record(app_id, &contr.id).await
}

/// Delete every container of an appliance, aggregating partial
/// failures into a 207.
pub async fn delete_containers(
  app_id: &str,
) -> serror::Result<String> {
  let mut failed = Vec::new();
  for contr in get_containers(app_id).await? {
    if let Err(e) = delete_container(&contr).await {
      error!(
        "Failed to delete container '{}' of appliance '{app_id}' | {:#}",
        contr.id, e.error
      );
      failed.push(contr.id);
    }
  }
  if !failed.is_empty() {
    return Err(
      anyhow!("Failed to delete containers {failed:?}")
        .status_code(StatusCode::MULTI_STATUS),
    );
  }
  Ok(format!(
    "Containers of appliance '{app_id}' have been deleted"
  ))
}

fn tolerate_gone(
  result: serror::Result<String>,
) -> serror::Result<()> {
  match result {
    Ok(_) => Ok(()),
    Err(e) if e.status == StatusCode::NOT_FOUND => Ok(()),
    Err(e) => Err(e),
  }
}
