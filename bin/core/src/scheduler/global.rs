//! The singleton global scheduler: drains the plans of every
//! appliance scheduler, consults the configured policy for
//! placement, and dispatches launches through the task managers.

use std::{collections::VecDeque, time::Duration};

use dashmap::DashMap;
use futures::StreamExt;
use indexmap::IndexMap;
use pivot_client::entities::volume::PersistentVolume;
use tokio::sync::Mutex;

use crate::{
  config::core_config,
  manager::{task, volume as volume_manager},
  scheduler::{
    SchedulePlan, ScheduledTask,
    appliance::ApplianceSchedulerHandle,
    policy::{
      GlobalPolicy, PolicyInput, global_policy,
      majority_placement,
    },
  },
  state::{cluster, global_scheduler},
};

pub fn spawn_global_scheduler_loop() {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(
      core_config().schedule_interval_secs,
    ));
    loop {
      interval.tick().await;
      global_scheduler().tick().await;
    }
  });
}

pub struct GlobalScheduler {
  task_queue: Mutex<VecDeque<ScheduledTask>>,
  volume_queue: Mutex<VecDeque<PersistentVolume>>,
  runners: DashMap<String, ApplianceSchedulerHandle>,
  policy: Mutex<Option<Box<dyn GlobalPolicy>>>,
}

impl Default for GlobalScheduler {
  fn default() -> Self {
    GlobalScheduler {
      task_queue: Mutex::new(VecDeque::new()),
      volume_queue: Mutex::new(VecDeque::new()),
      runners: DashMap::new(),
      policy: Mutex::new(None),
    }
  }
}

impl GlobalScheduler {
  pub fn register(
    &self,
    app_id: &str,
    handle: ApplianceSchedulerHandle,
  ) {
    self.runners.insert(app_id.to_string(), handle);
  }

  pub fn deregister(
    &self,
    app_id: &str,
  ) -> Option<ApplianceSchedulerHandle> {
    self.runners.remove(app_id).map(|(_, handle)| handle)
  }

  pub fn get_handle(
    &self,
    app_id: &str,
  ) -> Option<ApplianceSchedulerHandle> {
    self.runners.get(app_id).map(|entry| entry.clone())
  }

  /// Multi-producer side: appliance schedulers enqueue their
  /// plans here, the global tick drains them.
  pub async fn submit(&self, plan: SchedulePlan) {
    if plan.is_empty() {
      return;
    }
    self.task_queue.lock().await.extend(plan.tasks);
    self.volume_queue.lock().await.extend(plan.volumes);
  }

  pub async fn tick(&self) {
    let agents =
      cluster().get_agents(core_config().agent_ttl_secs).await;

    // drain and deduplicate: re-emissions replace stale copies
    let tasks = {
      let mut queue = self.task_queue.lock().await;
      let mut drained = IndexMap::new();
      for task in queue.drain(..) {
        drained.insert(task.key(), task);
      }
      drained.into_values().collect::<Vec<_>>()
    };
    let volumes = {
      let mut queue = self.volume_queue.lock().await;
      let mut drained = IndexMap::new();
      for vol in queue.drain(..) {
        drained
          .insert((vol.appliance.clone(), vol.id.clone()), vol);
      }
      drained.into_values().collect::<Vec<_>>()
    };

    let tasks = tasks
      .into_iter()
      .map(enrich_data_source_env)
      .collect::<Vec<_>>();

    let output = {
      let mut policy = self.policy.lock().await;
      let policy = policy.get_or_insert_with(|| {
        let name = &core_config().scheduler;
        global_policy(name).unwrap_or_else(|| {
          warn!(
            "Unknown global scheduler '{name}', falling back to passthrough"
          );
          global_policy("").expect("passthrough always exists")
        })
      });
      policy
        .schedule(PolicyInput {
          tasks,
          volumes,
          agents,
        })
        .await
    };

    // backend calls fan out, bounded by the configured
    // parallelism
    let n_parallel = core_config().n_parallel.max(1) as usize;
    futures::stream::iter(output.volumes)
      .for_each_concurrent(n_parallel, |vol| async move {
        info!("Volume '{}' is being provisioned", vol.id);
        if let Err(e) =
          volume_manager::provision_volume(&vol).await
        {
          error!(
            "Failed to provision volume '{}' | {:#}",
            vol.id, e.error
          );
        }
      })
      .await;
    futures::stream::iter(output.tasks)
      .for_each_concurrent(n_parallel, |scheduled| {
        self.dispatch(scheduled)
      })
      .await;
  }

  /// Launch one task on its backend and fold the submitted state
  /// back into the owning ensemble.
  async fn dispatch(&self, scheduled: ScheduledTask) {
    let task_id = scheduled.task_id();
    let launched = match task::launch_task(&scheduled).await {
      Ok(task) => task,
      Err(e) => {
        error!(
          "Failed to launch task '{task_id}' of appliance '{}' | {:#}",
          scheduled.app.id, e.error
        );
        return;
      }
    };
    info!(
      "Task '{task_id}' of appliance '{}' is being provisioned",
      scheduled.app.id
    );
    let Some(handle) = self.get_handle(&scheduled.app.id) else {
      return;
    };
    let mut ensemble = handle.ensemble.write().await;
    if let Some(ensemble) = ensemble.as_mut()
      && let Some(node) = ensemble.task_mut(&task_id)
    {
      node.task = launched;
    }
  }
}

/// Expose where the predecessors landed, for location aware user
/// code and policies. The majority vote is host-less; the host
/// env var comes from any predecessor inside the winning region.
fn enrich_data_source_env(
  mut scheduled: ScheduledTask,
) -> ScheduledTask {
  let Some(mut placement) =
    majority_placement(&scheduled.pred_placements)
  else {
    return scheduled;
  };
  placement.host = scheduled
    .pred_placements
    .iter()
    .find(|p| p.without_host() == placement)
    .and_then(|p| p.host.clone());
  let pairs = [
    ("DATA_SRC_CLOUD", &placement.cloud),
    ("DATA_SRC_REGION", &placement.region),
    ("DATA_SRC_ZONE", &placement.zone),
    ("DATA_SRC_HOST", &placement.host),
  ];
  for (name, value) in pairs {
    if let Some(value) = value {
      scheduled
        .extra_env
        .push((name.to_string(), value.clone()));
    }
  }
  scheduled
}
