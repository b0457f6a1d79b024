use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{
  I64, container::Endpoint, schedule::ContainerScheduleHints,
  schedule::Placement,
};

/// A task stuck in `TASK_SUBMITTED` longer than this is eligible
/// for relaunch.
pub const MAX_LAUNCH_DELAY_SECS: i64 = 60;

/// Task state as reported by the execution substrate, plus the
/// control-plane-only `TASK_SUBMITTED` initial state.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
pub enum TaskState {
  #[default]
  #[serde(rename = "TASK_SUBMITTED")]
  #[strum(serialize = "TASK_SUBMITTED")]
  Submitted,
  #[serde(rename = "TASK_STAGING")]
  #[strum(serialize = "TASK_STAGING")]
  Staging,
  #[serde(rename = "TASK_STARTING")]
  #[strum(serialize = "TASK_STARTING")]
  Starting,
  #[serde(rename = "TASK_RUNNING")]
  #[strum(serialize = "TASK_RUNNING")]
  Running,
  #[serde(rename = "TASK_FINISHED")]
  #[strum(serialize = "TASK_FINISHED")]
  Finished,
  #[serde(rename = "TASK_FAILED")]
  #[strum(serialize = "TASK_FAILED")]
  Failed,
  #[serde(rename = "TASK_KILLED")]
  #[strum(serialize = "TASK_KILLED")]
  Killed,
  #[serde(rename = "TASK_KILLING")]
  #[strum(serialize = "TASK_KILLING")]
  Killing,
  #[serde(rename = "TASK_LOST")]
  #[strum(serialize = "TASK_LOST")]
  Lost,
  #[serde(rename = "TASK_ERROR")]
  #[strum(serialize = "TASK_ERROR")]
  Error,
  #[serde(rename = "TASK_DROPPED")]
  #[strum(serialize = "TASK_DROPPED")]
  Dropped,
  #[serde(rename = "TASK_UNREACHABLE")]
  #[strum(serialize = "TASK_UNREACHABLE")]
  Unreachable,
  #[serde(rename = "TASK_UNKNOWN")]
  #[strum(serialize = "TASK_UNKNOWN")]
  Unknown,
  #[serde(rename = "TASK_GONE")]
  #[strum(serialize = "TASK_GONE")]
  Gone,
}

/// A single runtime instance of a container. A container with
/// `instances = n` owns tasks with seqno `0..n`.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct Task {
  pub seqno: u32,
  /// Id assigned by the execution substrate once the launch is
  /// accepted. Cleared when the task is reset for relaunch.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mesos_task_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub launch_time: Option<I64>,
  #[serde(default)]
  pub state: TaskState,
  #[serde(default)]
  pub placement: Placement,
  #[serde(default)]
  pub endpoints: Vec<Endpoint>,
  /// Ids of tasks this task depends on, inherited from the
  /// container dependencies crossed with their instance sets.
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub schedule_hints: ContainerScheduleHints,
}

impl Task {
  pub fn id(&self, container_id: &str) -> String {
    format!("{container_id}-{}", self.seqno)
  }

  /// Seconds since the last launch, or 0 if never launched.
  pub fn launch_delay(&self, now_ms: i64) -> i64 {
    match self.launch_time {
      Some(launch_time) => (now_ms - launch_time) / 1000,
      None => 0,
    }
  }

  /// Back to the submitted state for relaunch. The substrate id is
  /// cleared so reconciliation does not chase the dead task.
  pub fn reset(&mut self) {
    self.state = TaskState::Submitted;
    self.mesos_task_id = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_id_shape() {
    let task = Task {
      seqno: 3,
      ..Default::default()
    };
    assert_eq!(task.id("first-job"), "first-job-3");
  }

  #[test]
  fn state_round_trips_through_substrate_strings() {
    let state: TaskState =
      serde_json::from_str("\"TASK_RUNNING\"").unwrap();
    assert_eq!(state, TaskState::Running);
    assert_eq!(state.to_string(), "TASK_RUNNING");
    assert_eq!(
      "TASK_UNREACHABLE".parse::<TaskState>().unwrap(),
      TaskState::Unreachable
    );
  }

  #[test]
  fn launch_delay_is_zero_before_first_launch() {
    let mut task = Task::default();
    assert_eq!(task.launch_delay(1_000_000), 0);
    task.launch_time = Some(0);
    assert_eq!(task.launch_delay(61_000), 61);
  }

  #[test]
  fn reset_clears_substrate_id() {
    let mut task = Task {
      state: TaskState::Lost,
      mesos_task_id: Some("app.task.1".into()),
      ..Default::default()
    };
    task.reset();
    assert_eq!(task.state, TaskState::Submitted);
    assert!(task.mesos_task_id.is_none());
  }
}
