//! Global scheduler policies. Each policy is a pure function over
//! its inputs apart from its private wait queue: tasks it cannot
//! place this tick stay queued inside the policy and rejoin the
//! next tick's batch.

use std::collections::{HashMap, VecDeque};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use pivot_client::entities::{
  agent::Agent, container::Resources, volume::PersistentVolume,
};

use crate::scheduler::ScheduledTask;

pub mod best_fit;
pub mod cost_aware;
pub mod first_fit;
pub mod location_aware;

pub struct PolicyInput {
  pub tasks: Vec<ScheduledTask>,
  pub volumes: Vec<PersistentVolume>,
  pub agents: Vec<Agent>,
}

/// What the policy could place this tick. Anything else stays in
/// the policy's wait queue.
#[derive(Default)]
pub struct PolicyOutput {
  pub tasks: Vec<ScheduledTask>,
  pub volumes: Vec<PersistentVolume>,
}

pub trait GlobalPolicy: Send {
  fn schedule(
    &mut self,
    input: PolicyInput,
  ) -> BoxFuture<'_, PolicyOutput>;
}

pub type PolicyCtor = fn() -> Box<dyn GlobalPolicy>;

fn registry() -> &'static HashMap<&'static str, PolicyCtor> {
  static REGISTRY: std::sync::OnceLock<
    HashMap<&'static str, PolicyCtor>,
  > = std::sync::OnceLock::new();
  REGISTRY.get_or_init(|| {
    let mut registry = HashMap::new();
    first_fit::register(&mut registry);
    best_fit::register(&mut registry);
    location_aware::register(&mut registry);
    cost_aware::register(&mut registry);
    registry
  })
}

/// Look a policy up by its registry key. The empty name selects
/// the passthrough policy: dispatch everything unplaced and let
/// the execution substrate decide.
pub fn global_policy(
  name: &str,
) -> Option<Box<dyn GlobalPolicy>> {
  if name.is_empty() {
    return Some(Box::new(Passthrough));
  }
  registry().get(name).map(|ctor| ctor())
}

pub struct Passthrough;

impl GlobalPolicy for Passthrough {
  fn schedule(
    &mut self,
    input: PolicyInput,
  ) -> BoxFuture<'_, PolicyOutput> {
    Box::pin(async move {
      PolicyOutput {
        tasks: input.tasks,
        volumes: input.volumes,
      }
    })
  }
}

/// Prepend the waiting tasks to the incoming batch, deduplicating
/// by task key. A re-emission of a queued task replaces the stale
/// copy instead of doubling it.
pub fn merge_waiting(
  wait: &mut VecDeque<ScheduledTask>,
  incoming: Vec<ScheduledTask>,
) -> Vec<ScheduledTask> {
  let mut merged = IndexMap::new();
  for task in wait.drain(..).chain(incoming) {
    merged.insert(task.key(), task);
  }
  merged.into_values().collect()
}

/// `(cpus, mem, disk, gpu)` as a vector, for fit arithmetic.
pub fn demand(resources: &Resources) -> [f64; 4] {
  [
    resources.cpus,
    resources.mem,
    resources.disk,
    resources.gpu,
  ]
}

pub fn agent_vector(agent: &Agent) -> [f64; 4] {
  [
    agent.resources.cpus,
    agent.resources.mem,
    agent.resources.disk,
    agent.resources.gpus,
  ]
}

pub fn fits(demand: &[f64; 4], available: &[f64; 4]) -> bool {
  demand.iter().zip(available).all(|(d, a)| d <= a)
}

pub fn subtract(available: &mut [f64; 4], demand: &[f64; 4]) {
  for (a, d) in available.iter_mut().zip(demand) {
    *a -= d;
  }
}

pub fn norm(vector: &[f64; 4]) -> f64 {
  vector.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Pin the task to the agent through its system schedule hints.
pub fn place(task: &mut ScheduledTask, agent: &Agent) {
  task.task.schedule_hints.placement = agent.placement.clone();
}

/// The most common placement among the given ones, host cleared.
/// Unlocated (empty) placements do not vote.
pub fn majority_placement(
  placements: &[pivot_client::entities::schedule::Placement],
) -> Option<pivot_client::entities::schedule::Placement> {
  use pivot_client::entities::schedule::Placement;
  let mut counts: Vec<(Placement, usize)> = Vec::new();
  for placement in placements {
    if placement.is_empty() {
      continue;
    }
    let placement = placement.without_host();
    match counts.iter_mut().find(|(p, _)| *p == placement) {
      Some((_, count)) => *count += 1,
      None => counts.push((placement, 1)),
    }
  }
  counts
    .into_iter()
    .max_by_key(|(_, count)| *count)
    .map(|(placement, _)| placement)
}

#[cfg(test)]
pub mod test_support {
  use std::sync::Arc;

  use pivot_client::entities::{
    agent::AgentResources, appliance::Appliance,
    container::Container, schedule::Placement, task::Task,
  };

  use super::*;

  pub fn agent(id: &str, cpus: f64, mem: f64) -> Agent {
    Agent {
      id: id.into(),
      hostname: format!("host-{id}"),
      resources: AgentResources {
        cpus,
        mem,
        disk: 102400.0,
        gpus: 0.0,
        port_ranges: Vec::new(),
      },
      public_ip: format!("10.0.0.{}", id.len()),
      placement: Placement {
        cloud: Some("aws".into()),
        region: Some("us-east-1".into()),
        zone: Some("us-east-1a".into()),
        host: Some(format!("host-{id}")),
      },
      preemptible: false,
      fqdn: None,
    }
  }

  pub fn scheduled_task(
    task_id: &str,
    cpus: f64,
    mem: f64,
  ) -> ScheduledTask {
    let container = Container {
      id: task_id.into(),
      appliance: "test-app".into(),
      image: "ubuntu".into(),
      resources: Resources {
        cpus,
        mem,
        disk: 0.0,
        gpu: 0.0,
      },
      ..Default::default()
    };
    ScheduledTask {
      app: Arc::new(Appliance {
        id: "test-app".into(),
        containers: vec![container.clone()],
        ..Default::default()
      }),
      container,
      task: Task::default(),
      pred_placements: Vec::new(),
      extra_env: Vec::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{test_support::*, *};

  #[test]
  fn merge_waiting_replaces_stale_copies() {
    let mut wait = VecDeque::new();
    let mut stale = scheduled_task("first-job", 1.0, 128.0);
    stale.task.launch_time = Some(1);
    wait.push_back(stale);
    wait.push_back(scheduled_task("other-job", 1.0, 128.0));
    let mut fresh = scheduled_task("first-job", 1.0, 128.0);
    fresh.task.launch_time = Some(2);
    let merged = merge_waiting(&mut wait, vec![fresh]);
    assert!(wait.is_empty());
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].task.launch_time, Some(2));
  }

  #[test]
  fn fit_arithmetic() {
    let available = agent_vector(&agent("a", 4.0, 4096.0));
    let demand = demand(&Resources {
      cpus: 2.0,
      mem: 2048.0,
      disk: 0.0,
      gpu: 0.0,
    });
    assert!(fits(&demand, &available));
    let mut remaining = available;
    subtract(&mut remaining, &demand);
    assert_eq!(remaining[0], 2.0);
    assert!(!fits(&[8.0, 0.0, 0.0, 0.0], &remaining));
  }
}
