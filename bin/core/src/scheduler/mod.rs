//! The two scheduling tiers: one runner per live appliance
//! feeding plans into the singleton global scheduler.

use std::sync::Arc;

use pivot_client::entities::{
  appliance::Appliance,
  container::{Container, Resources},
  schedule::Placement,
  task::Task,
  volume::PersistentVolume,
};

pub mod appliance;
pub mod global;
pub mod policy;

/// A task handed to the global scheduler, carrying everything the
/// backend adapters need to build the launch request.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
  pub app: Arc<Appliance>,
  pub container: Container,
  pub task: Task,
  /// Placements of the task's predecessors, for data locality
  /// aware policies.
  pub pred_placements: Vec<Placement>,
  /// Scheduler-computed env (`DATA_SRC_*`), appended to the
  /// container env at launch.
  pub extra_env: Vec<(String, String)>,
}

impl ScheduledTask {
  pub fn task_id(&self) -> String {
    self.task.id(&self.container.id)
  }

  /// Unique across appliances.
  pub fn key(&self) -> String {
    format!("{}/{}", self.app.id, self.task_id())
  }

  pub fn resources(&self) -> &Resources {
    &self.container.resources
  }
}

/// Per-tick output of an appliance scheduler: tasks to launch and
/// volumes to provision.
#[derive(Debug, Default)]
pub struct SchedulePlan {
  pub done: bool,
  pub tasks: Vec<ScheduledTask>,
  pub volumes: Vec<PersistentVolume>,
}

impl SchedulePlan {
  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty() && self.volumes.is_empty()
  }
}
