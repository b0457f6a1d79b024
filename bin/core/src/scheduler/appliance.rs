//! Per-appliance scheduler: one loop per live appliance walking
//! its ensemble, reconciling live task state and emitting a plan
//! into the global scheduler each tick.

use std::{
  collections::HashMap, sync::Arc, time::Duration,
};

use anyhow::anyhow;
use futures::future::join_all;
use pivot_client::entities::{
  agent::Agent,
  appliance::Appliance,
  container::ContainerType,
  pivot_timestamp,
  task::TaskState,
  volume::VolumeState,
};
use reqwest::StatusCode;
use serror::AddStatusCodeError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
  config::core_config,
  ensemble::TaskEnsemble,
  manager::{appliance as appliance_manager, container, task},
  scheduler::{SchedulePlan, ScheduledTask},
  state::{cluster, global_scheduler},
};

/// Registry entry for one running appliance scheduler. The
/// ensemble is shared with the global scheduler for dependency
/// placement lookups.
#[derive(Clone)]
pub struct ApplianceSchedulerHandle {
  pub cancel: CancellationToken,
  pub ensemble: Arc<RwLock<Option<TaskEnsemble>>>,
}

/// The pluggable per-appliance policy: turn the current ensemble
/// state into this tick's plan.
pub trait ApplianceScheduler: Send + Sync {
  fn schedule(
    &self,
    app: &Arc<Appliance>,
    ensemble: &mut TaskEnsemble,
    agents: &[Agent],
  ) -> serror::Result<SchedulePlan>;
}

/// Appliance scheduler registry, keyed by the `scheduler.name`
/// field of the appliance.
pub fn appliance_scheduler(
  name: &str,
) -> serror::Result<Arc<dyn ApplianceScheduler>> {
  match name {
    "" | "dag" => Ok(Arc::new(DagScheduler)),
    name => Err(
      anyhow!("Unknown appliance scheduler '{name}'")
        .status_code(StatusCode::UNPROCESSABLE_ENTITY),
    ),
  }
}

/// Start the scheduler loop for an appliance and register it with
/// the global scheduler. Idempotent per appliance id.
pub fn spawn_appliance_scheduler(
  app: &Appliance,
) -> serror::Result<()> {
  if global_scheduler().get_handle(&app.id).is_some() {
    return Ok(());
  }
  let policy = appliance_scheduler(&app.scheduler.name)?;
  let handle = ApplianceSchedulerHandle {
    cancel: CancellationToken::new(),
    ensemble: Arc::new(RwLock::new(None)),
  };
  global_scheduler().register(&app.id, handle.clone());
  let app_id = app.id.clone();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(
      core_config().schedule_interval_secs,
    ));
    loop {
      tokio::select! {
        _ = handle.cancel.cancelled() => break,
        _ = interval.tick() => {}
      }
      match tick(&app_id, &handle).await {
        Ok(true) => {
          info!("Scheduling for appliance '{app_id}' has finished");
          break;
        }
        Ok(false) => {}
        Err(e) => {
          if e.status == StatusCode::NOT_FOUND {
            info!("Appliance '{app_id}' no longer exists");
            break;
          }
          // tolerated: the next tick retries
          error!(
            "Scheduler tick for appliance '{app_id}' failed | {:#}",
            e.error
          );
        }
      }
    }
    global_scheduler().deregister(&app_id);
  });
  Ok(())
}

/// One scheduler tick. Returns true once the ensemble is done and
/// the loop should stop.
async fn tick(
  app_id: &str,
  handle: &ApplianceSchedulerHandle,
) -> serror::Result<bool> {
  let app =
    Arc::new(appliance_manager::get_appliance(app_id).await?);
  let policy = appliance_scheduler(&app.scheduler.name)?;

  let mut ensemble_slot = handle.ensemble.write().await;
  match ensemble_slot.as_mut() {
    None => {
      *ensemble_slot = Some(TaskEnsemble::build(&app)?);
    }
    Some(ensemble) => {
      reconcile_current_tasks(&app, ensemble).await?;
    }
  }
  let ensemble =
    ensemble_slot.as_mut().expect("ensemble just built");

  let agents = cluster().get_agents(0).await;
  let plan = policy.schedule(&app, ensemble, &agents)?;
  if plan.done {
    return Ok(true);
  }
  drop(ensemble_slot);
  global_scheduler().submit(plan).await;
  Ok(false)
}

/// Pull live state for every task on the frontier and persist the
/// mutated containers. Tasks that already carry a substrate id go
/// through the substrate directly; the rest are looked up on
/// their own backend.
async fn reconcile_current_tasks(
  app: &Arc<Appliance>,
  ensemble: &mut TaskEnsemble,
) -> serror::Result<()> {
  let current = ensemble
    .current_tasks()
    .iter()
    .map(|node| (node.id(), (**node).clone()))
    .collect::<Vec<_>>();
  // fan the backend lookups out, then apply them in order
  let updates =
    join_all(current.iter().map(|(_, node)| async {
      let Some(contr) = app.container(&node.container_id)
      else {
        return Ok(None);
      };
      if node.task.mesos_task_id.is_some() {
        return task::update_task(contr, &node.task)
          .await
          .map(|task| Some((task, None)));
      }
      match node.container_type {
        ContainerType::Service => {
          task::update_service_task(app, contr, &node.task)
            .await
            .map(|update| {
              update.map(|update| {
                (update.task, Some(update.container_state))
              })
            })
        }
        ContainerType::Job => {
          task::update_job_task(app, contr, &node.task)
            .await
            .map(|task| task.map(|task| (task, None)))
        }
      }
    }))
    .await;
  let mut finished_jobs = Vec::new();
  let mut service_states = HashMap::new();
  for ((task_id, node), result) in
    current.into_iter().zip(updates)
  {
    let result = result.map(|update| {
      update.map(|(task, container_state)| {
        if let Some(container_state) = container_state {
          service_states.insert(
            node.container_id.clone(),
            container_state,
          );
        }
        task
      })
    });
    match result {
      Ok(Some(task)) => {
        // a stale read never regresses a task out of finished
        if node.task.state == TaskState::Finished
          && task.state != TaskState::Finished
        {
          continue;
        }
        if node.container_type == ContainerType::Job
          && task.state == TaskState::Finished
        {
          finished_jobs.push(task_id.clone());
        }
        if let Some(node) = ensemble.task_mut(&task_id) {
          node.task = task;
        }
      }
      Ok(None) => {}
      Err(e) if e.status == StatusCode::NOT_FOUND => {
        // deleted externally while past submission: drop the
        // container record and stop chasing it
        if node.task.state != TaskState::Submitted {
          warn!(
            "Task '{task_id}' of appliance '{}' is gone, deleting container '{}'",
            app.id, node.container_id
          );
          container::delete_container_record(
            &app.id,
            &node.container_id,
          )
          .await?;
        }
      }
      Err(e) => {
        error!(
          "Failed to reconcile task '{task_id}' of appliance '{}' | {:#}",
          app.id, e.error
        );
      }
    }
  }
  // finished jobs are deregistered from the job backend
  for task_id in finished_jobs {
    if let Err(e) =
      task::delete_job_task(&app.id, &task_id).await
      && e.status != StatusCode::NOT_FOUND
    {
      warn!(
        "Failed to delete finished job task '{task_id}' | {:#}",
        e.error
      );
    }
  }
  for contr in ensemble.container_records(app, &service_states)
  {
    container::save_container(&contr).await?;
  }
  Ok(())
}

/// The default policy: launch whatever the ensemble reports
/// ready, seeding each ready task's schedule hints from its
/// container's user hints, and provision the persistent volumes
/// those tasks mount. The task hints, with whatever placement the
/// global policy adds, land back on the container's system
/// schedule hints when the records persist.
pub struct DagScheduler;

impl ApplianceScheduler for DagScheduler {
  fn schedule(
    &self,
    app: &Arc<Appliance>,
    ensemble: &mut TaskEnsemble,
    _agents: &[Agent],
  ) -> serror::Result<SchedulePlan> {
    let mut plan = SchedulePlan::default();
    let current = ensemble.current_tasks().len();
    let ready = ensemble.ready_tasks(pivot_timestamp());
    if current == 0 && ready.is_empty() {
      plan.done = true;
      return Ok(plan);
    }
    debug!(
      "Tasks to schedule for '{}': {ready:?}",
      app.id
    );
    let mut mounted = Vec::new();
    for task_id in &ready {
      let Some(node) = ensemble.task_mut(task_id) else {
        continue;
      };
      let Some(contr) = app.container(&node.container_id) else {
        continue;
      };
      node.task.schedule_hints =
        contr.user_schedule_hints.clone();
      let pred_placements = ensemble
        .predecessors_of(task_id)
        .iter()
        .map(|pred| pred.task.placement.clone())
        .collect();
      let node =
        ensemble.task(task_id).expect("task not indexed");
      mounted.extend(
        contr.persistent_volumes().map(|v| v.src.clone()),
      );
      plan.tasks.push(ScheduledTask {
        app: app.clone(),
        container: contr.clone(),
        task: node.task.clone(),
        pred_placements,
        extra_env: Vec::new(),
      });
    }
    // declared volumes mounted by a ready task and not yet active
    for vol in app.volumes() {
      if vol.state != VolumeState::Active
        && mounted.iter().any(|src| *src == vol.id)
      {
        plan.volumes.push(vol.clone());
      }
    }
    Ok(plan)
  }
}
