//! Task-level expansion of an appliance's container DAG: the
//! per-appliance scheduler's working view.
//!
//! Like the container DAG this is transient, rebuilt from the
//! stored containers whenever a scheduler starts.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;
use pivot_client::entities::{
  appliance::Appliance,
  container::{Container, ContainerState, ContainerType},
  schedule::ContainerScheduleHints,
  task::{MAX_LAUNCH_DELAY_SECS, Task, TaskState},
};

use crate::dag::ContainerDag;

#[derive(Debug, Clone)]
pub struct EnsembleTask {
  pub container_id: String,
  pub container_type: ContainerType,
  pub task: Task,
}

impl EnsembleTask {
  pub fn id(&self) -> String {
    self.task.id(&self.container_id)
  }

  /// Whether the task satisfies its dependents: a running service
  /// or a finished job.
  pub fn is_satisfied(&self) -> bool {
    match self.container_type {
      ContainerType::Service => {
        self.task.state == TaskState::Running
      }
      ContainerType::Job => {
        self.task.state == TaskState::Finished
      }
    }
  }
}

#[derive(Debug)]
pub struct TaskEnsemble {
  tasks: HashMap<String, EnsembleTask>,
  tasks_by_container: HashMap<String, Vec<String>>,
  predecessors: HashMap<String, HashSet<String>>,
  successors: HashMap<String, HashSet<String>>,
  /// The frontier the scheduler watches. None until the first
  /// `ready_tasks` call seeds it with the sources.
  current: Option<Vec<String>>,
}

impl TaskEnsemble {
  /// Expand the appliance into the task graph: every task of a
  /// dependency container precedes every task of the dependent.
  /// Persisted task state is carried over by seqno, so a restart
  /// resumes instead of relaunching.
  pub fn build(app: &Appliance) -> serror::Result<TaskEnsemble> {
    // rejects unknown dependencies and cycles
    ContainerDag::construct(app.containers.iter().cloned())?;

    let mut ensemble = TaskEnsemble {
      tasks: HashMap::new(),
      tasks_by_container: HashMap::new(),
      predecessors: HashMap::new(),
      successors: HashMap::new(),
      current: None,
    };
    for container in &app.containers {
      let mut ids = Vec::with_capacity(container.instances as usize);
      for seqno in 0..container.instances {
        let task = container
          .tasks
          .iter()
          .find(|t| t.seqno == seqno)
          .cloned()
          .unwrap_or(Task {
            seqno,
            ..Default::default()
          });
        let node = EnsembleTask {
          container_id: container.id.clone(),
          container_type: container.container_type(),
          task,
        };
        let id = node.id();
        ensemble.predecessors.entry(id.clone()).or_default();
        ensemble.successors.entry(id.clone()).or_default();
        ensemble.tasks.insert(id.clone(), node);
        ids.push(id);
      }
      ensemble
        .tasks_by_container
        .insert(container.id.clone(), ids);
    }
    for container in &app.containers {
      for dep in &container.dependencies {
        let sources = ensemble.tasks_by_container[dep].clone();
        let targets =
          ensemble.tasks_by_container[&container.id].clone();
        for target in &targets {
          let node = ensemble
            .tasks
            .get_mut(target)
            .expect("task not indexed");
          node.task.dependencies = sources.clone();
          ensemble
            .predecessors
            .get_mut(target)
            .expect("task not indexed")
            .extend(sources.iter().cloned());
        }
        for source in &sources {
          ensemble
            .successors
            .get_mut(source)
            .expect("task not indexed")
            .extend(targets.iter().cloned());
        }
      }
    }
    Ok(ensemble)
  }

  pub fn task(&self, task_id: &str) -> Option<&EnsembleTask> {
    self.tasks.get(task_id)
  }

  pub fn task_mut(
    &mut self,
    task_id: &str,
  ) -> Option<&mut EnsembleTask> {
    self.tasks.get_mut(task_id)
  }

  pub fn tasks_of_container(
    &self,
    container_id: &str,
  ) -> Vec<&EnsembleTask> {
    self
      .tasks_by_container
      .get(container_id)
      .map(|ids| {
        ids.iter().filter_map(|id| self.tasks.get(id)).collect()
      })
      .unwrap_or_default()
  }

  pub fn sources(&self) -> Vec<&EnsembleTask> {
    self.by_degree(&self.predecessors)
  }

  pub fn sinks(&self) -> Vec<&EnsembleTask> {
    self.by_degree(&self.successors)
  }

  fn by_degree(
    &self,
    edges: &HashMap<String, HashSet<String>>,
  ) -> Vec<&EnsembleTask> {
    let mut nodes = edges
      .iter()
      .filter(|(_, set)| set.is_empty())
      .filter_map(|(id, _)| self.tasks.get(id))
      .collect::<Vec<_>>();
    nodes.sort_by_key(|node| node.id());
    nodes
  }

  /// Finished once every sink is satisfied.
  pub fn is_finished(&self) -> bool {
    self.sinks().iter().all(|node| node.is_satisfied())
  }

  /// The frontier as of the last `ready_tasks` call.
  pub fn current_tasks(&self) -> Vec<&EnsembleTask> {
    self
      .current
      .as_deref()
      .unwrap_or_default()
      .iter()
      .filter_map(|id| self.tasks.get(id))
      .collect()
  }

  pub fn predecessors_of(
    &self,
    task_id: &str,
  ) -> Vec<&EnsembleTask> {
    self
      .predecessors
      .get(task_id)
      .map(|ids| {
        ids.iter().filter_map(|id| self.tasks.get(id)).collect()
      })
      .unwrap_or_default()
  }

  fn ready_successors(&self, task_id: &str) -> Vec<String> {
    let Some(successors) = self.successors.get(task_id) else {
      return Vec::new();
    };
    let mut ready = successors
      .iter()
      .filter(|succ| {
        self
          .predecessors_of(succ)
          .iter()
          .all(|pred| pred.is_satisfied())
      })
      .cloned()
      .collect::<Vec<_>>();
    ready.sort();
    ready
  }

  /// Advance the frontier and return the tasks to launch this
  /// tick. See the state machine in the scheduler design: staged
  /// and starting tasks wait, stale submissions relaunch,
  /// satisfied tasks release their successors, and problematic
  /// states reset to submitted for relaunch.
  pub fn ready_tasks(&mut self, now_ms: i64) -> Vec<String> {
    let current = match self.current.take() {
      Some(current) => current,
      None => {
        // seed the frontier with the sources. Fresh sources are
        // ready right away; restored ones go through the regular
        // advancement below so in-flight state is respected.
        let sources = self
          .sources()
          .iter()
          .map(|node| node.id())
          .collect::<Vec<_>>();
        let fresh = sources.iter().all(|id| {
          self.tasks[id].task.state == TaskState::Submitted
            && self.tasks[id].task.launch_time.is_none()
        });
        if fresh {
          self.current = Some(sources.clone());
          return sources;
        }
        sources
      }
    };
    let mut ready = IndexSet::new();
    let mut new_current = IndexSet::new();
    for id in current {
      let Some(node) = self.tasks.get(&id) else {
        continue;
      };
      let is_job = node.container_type == ContainerType::Job;
      match node.task.state {
        TaskState::Staging | TaskState::Starting => {
          new_current.insert(id);
        }
        TaskState::Running if is_job => {
          new_current.insert(id);
        }
        TaskState::Submitted => {
          if node.task.launch_time.is_none()
            || node.task.launch_delay(now_ms)
              > MAX_LAUNCH_DELAY_SECS
          {
            debug!(
              "Task [{id}] has not started in {MAX_LAUNCH_DELAY_SECS}s, ready for launch"
            );
            ready.insert(id.clone());
          }
          new_current.insert(id);
        }
        TaskState::Running | TaskState::Finished
          if node.is_satisfied() =>
        {
          for succ in self.ready_successors(&id) {
            new_current.insert(succ.clone());
            if self.tasks[&succ].task.state
              == TaskState::Submitted
            {
              ready.insert(succ);
            }
          }
        }
        TaskState::Finished => {
          // a finished service is terminal but satisfies nothing
        }
        state => {
          debug!(
            "Task [{id}] is in a problematic state: {state}, ready for relaunch"
          );
          let node = self
            .tasks
            .get_mut(&id)
            .expect("task not indexed");
          node.task.reset();
          new_current.insert(id.clone());
          ready.insert(id);
        }
      }
    }
    self.current = Some(new_current.into_iter().collect());
    ready.into_iter().collect()
  }

  /// Container records with the live task state folded in, for
  /// persistence after reconciliation. Backend-reported service
  /// states take precedence over the local fold, and the hints
  /// the scheduler put on the tasks materialize as the
  /// container's system schedule hints.
  pub fn container_records(
    &self,
    app: &Appliance,
    service_states: &HashMap<String, ContainerState>,
  ) -> Vec<Container> {
    app
      .containers
      .iter()
      .map(|container| {
        let mut container = container.clone();
        container.tasks = self
          .tasks_of_container(&container.id)
          .into_iter()
          .map(|node| node.task.clone())
          .collect();
        container.endpoints = container
          .tasks
          .iter()
          .flat_map(|task| task.endpoints.iter().cloned())
          .collect();
        container.name_endpoints();
        // the freshest scheduled hints win; untouched tasks keep
        // whatever was persisted before
        if let Some(hints) = container
          .tasks
          .iter()
          .rev()
          .map(|task| &task.schedule_hints)
          .find(|hints| {
            **hints != ContainerScheduleHints::default()
          })
        {
          container.sys_schedule_hints = hints.clone();
        }
        container.state = service_states
          .get(&container.id)
          .copied()
          .unwrap_or_else(|| {
            ContainerState::of_container(&container)
          });
        container
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pivot_client::entities::container::{
    ContainerSpec, Resources, ServiceConfig,
  };

  fn job(id: &str, instances: u32, deps: &[&str]) -> Container {
    Container {
      id: id.into(),
      appliance: "test-app".into(),
      image: "ubuntu".into(),
      resources: Resources::default(),
      instances,
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  fn service(id: &str, instances: u32) -> Container {
    Container {
      spec: ContainerSpec::Service(ServiceConfig::default()),
      ..job(id, instances, &[])
    }
  }

  fn appliance(containers: Vec<Container>) -> Appliance {
    Appliance {
      id: "test-app".into(),
      containers,
      ..Default::default()
    }
  }

  fn set_state(
    ensemble: &mut TaskEnsemble,
    task_id: &str,
    state: TaskState,
  ) {
    ensemble.task_mut(task_id).unwrap().task.state = state;
  }

  #[test]
  fn task_ids_cover_every_instance() {
    let ensemble =
      TaskEnsemble::build(&appliance(vec![job(
        "first-job",
        5,
        &[],
      )]))
      .unwrap();
    let mut ids = ensemble
      .sources()
      .iter()
      .map(|node| node.id())
      .collect::<Vec<_>>();
    ids.sort();
    assert_eq!(
      ids,
      (0..5)
        .map(|i| format!("first-job-{i}"))
        .collect::<Vec<_>>()
    );
  }

  #[test]
  fn first_call_emits_the_sources() {
    let mut ensemble = TaskEnsemble::build(&appliance(vec![
      job("first-job", 2, &[]),
      job("second-job", 2, &["first-job"]),
    ]))
    .unwrap();
    let ready = ensemble.ready_tasks(0);
    assert_eq!(
      ready,
      vec![
        "first-job-0".to_string(),
        "first-job-1".to_string()
      ]
    );
  }

  #[test]
  fn dependents_wait_for_every_instance() {
    let mut ensemble = TaskEnsemble::build(&appliance(vec![
      job("first-job", 2, &[]),
      job("second-job", 2, &["first-job"]),
    ]))
    .unwrap();
    ensemble.ready_tasks(0);
    set_state(&mut ensemble, "first-job-0", TaskState::Finished);
    set_state(&mut ensemble, "first-job-1", TaskState::Running);
    // one instance still running: nothing advances, the finished
    // one leaves the frontier
    assert!(ensemble.ready_tasks(0).is_empty());
    set_state(&mut ensemble, "first-job-1", TaskState::Finished);
    let ready = ensemble.ready_tasks(0);
    assert_eq!(
      ready,
      vec![
        "second-job-0".to_string(),
        "second-job-1".to_string()
      ]
    );
  }

  #[test]
  fn a_running_service_satisfies_dependents() {
    let mut ensemble = TaskEnsemble::build(&appliance(vec![
      service("first-service", 1),
      job("second-job", 1, &["first-service"]),
    ]))
    .unwrap();
    ensemble.ready_tasks(0);
    set_state(
      &mut ensemble,
      "first-service-0",
      TaskState::Running,
    );
    assert_eq!(
      ensemble.ready_tasks(0),
      vec!["second-job-0".to_string()]
    );
    // the service left the frontier; the job is now watched
    let current = ensemble
      .current_tasks()
      .iter()
      .map(|node| node.id())
      .collect::<Vec<_>>();
    assert_eq!(current, vec!["second-job-0".to_string()]);
  }

  #[test]
  fn stale_submissions_relaunch_once_per_tick() {
    let mut ensemble =
      TaskEnsemble::build(&appliance(vec![job(
        "first-job",
        1,
        &[],
      )]))
      .unwrap();
    ensemble.ready_tasks(0);
    {
      let node = ensemble.task_mut("first-job-0").unwrap();
      node.task.launch_time = Some(0);
    }
    let now = (MAX_LAUNCH_DELAY_SECS + 1) * 1000;
    assert_eq!(
      ensemble.ready_tasks(now),
      vec!["first-job-0".to_string()]
    );
  }

  #[test]
  fn problematic_states_reset_and_relaunch() {
    let mut ensemble =
      TaskEnsemble::build(&appliance(vec![job(
        "first-job",
        1,
        &[],
      )]))
      .unwrap();
    ensemble.ready_tasks(0);
    {
      let node = ensemble.task_mut("first-job-0").unwrap();
      node.task.state = TaskState::Lost;
      node.task.mesos_task_id = Some("stale".into());
    }
    assert_eq!(
      ensemble.ready_tasks(0),
      vec!["first-job-0".to_string()]
    );
    let node = ensemble.task("first-job-0").unwrap();
    assert_eq!(node.task.state, TaskState::Submitted);
    assert!(node.task.mesos_task_id.is_none());
  }

  #[test]
  fn finished_when_all_sinks_are_satisfied() {
    let mut ensemble = TaskEnsemble::build(&appliance(vec![
      job("first-job", 2, &[]),
      service("first-service", 1),
    ]))
    .unwrap();
    assert!(!ensemble.is_finished());
    set_state(&mut ensemble, "first-job-0", TaskState::Finished);
    set_state(&mut ensemble, "first-job-1", TaskState::Finished);
    assert!(!ensemble.is_finished());
    set_state(
      &mut ensemble,
      "first-service-0",
      TaskState::Running,
    );
    assert!(ensemble.is_finished());
  }

  #[test]
  fn container_records_fold_task_state() {
    use pivot_client::entities::container::ContainerState;
    let app = appliance(vec![
      job("first-job", 2, &[]),
      service("first-service", 1),
    ]);
    let mut ensemble = TaskEnsemble::build(&app).unwrap();
    set_state(&mut ensemble, "first-job-0", TaskState::Finished);
    set_state(&mut ensemble, "first-job-1", TaskState::Running);
    set_state(
      &mut ensemble,
      "first-service-0",
      TaskState::Running,
    );
    let records =
      ensemble.container_records(&app, &HashMap::new());
    let by_id = |id: &str| {
      records.iter().find(|c| c.id == id).unwrap().clone()
    };
    assert_eq!(
      by_id("first-job").state,
      ContainerState::Running
    );
    assert_eq!(by_id("first-job").tasks.len(), 2);
    assert_eq!(
      by_id("first-service").state,
      ContainerState::Running
    );
    // the backend's view wins when present
    let overrides = HashMap::from([(
      "first-service".to_string(),
      ContainerState::Failed,
    )]);
    let records = ensemble.container_records(&app, &overrides);
    let service = records
      .iter()
      .find(|c| c.id == "first-service")
      .unwrap();
    assert_eq!(service.state, ContainerState::Failed);
  }

  #[test]
  fn container_records_materialize_sys_schedule_hints() {
    use pivot_client::entities::schedule::Placement;
    let hints = |cloud: &str| ContainerScheduleHints {
      placement: Placement {
        cloud: Some(cloud.into()),
        ..Default::default()
      },
      preemptible: false,
    };
    let mut app =
      appliance(vec![job("first-job", 2, &[])]);
    // a previously persisted value survives untouched ticks
    app.containers[0].sys_schedule_hints = hints("gcp");
    let mut ensemble = TaskEnsemble::build(&app).unwrap();
    let records =
      ensemble.container_records(&app, &HashMap::new());
    assert_eq!(records[0].sys_schedule_hints, hints("gcp"));
    // scheduled hints on any task replace it
    ensemble
      .task_mut("first-job-0")
      .unwrap()
      .task
      .schedule_hints = hints("aws");
    let records =
      ensemble.container_records(&app, &HashMap::new());
    assert_eq!(records[0].sys_schedule_hints, hints("aws"));
    // the freshest (highest seqno) scheduled hints win
    ensemble
      .task_mut("first-job-1")
      .unwrap()
      .task
      .schedule_hints = hints("azure");
    let records =
      ensemble.container_records(&app, &HashMap::new());
    assert_eq!(records[0].sys_schedule_hints, hints("azure"));
  }

  #[test]
  fn restores_persisted_task_state() {
    let mut container = job("first-job", 2, &[]);
    container.tasks = vec![Task {
      seqno: 1,
      state: TaskState::Running,
      mesos_task_id: Some("substrate-1".into()),
      ..Default::default()
    }];
    let ensemble =
      TaskEnsemble::build(&appliance(vec![container])).unwrap();
    let node = ensemble.task("first-job-1").unwrap();
    assert_eq!(node.task.state, TaskState::Running);
    assert_eq!(
      node.task.mesos_task_id.as_deref(),
      Some("substrate-1")
    );
    assert_eq!(
      ensemble.task("first-job-0").unwrap().task.state,
      TaskState::Submitted
    );
  }
}
