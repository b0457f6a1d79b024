//! Task managers: reconcile a task against its backend and build
//! the launch requests.

use anyhow::anyhow;
use pivot_client::entities::{
  appliance::Appliance,
  container::{
    Container, ContainerState, ContainerType, Endpoint,
    NetworkMode,
  },
  pivot_timestamp,
  task::{Task, TaskState},
};
use reqwest::StatusCode;
use serror::AddStatusCodeError;

use crate::{
  backends::{chronos, marathon, mesos},
  scheduler::ScheduledTask,
  state::cluster,
};

/// Reconcile a task that already carries a substrate id straight
/// against the substrate.
pub async fn update_task(
  contr: &Container,
  task: &Task,
) -> serror::Result<Task> {
  let Some(mesos_task_id) = task.mesos_task_id.as_deref() else {
    return Err(
      anyhow!("Substrate task id is not set")
        .status_code(StatusCode::BAD_REQUEST),
    );
  };
  let mut task = task.clone();
  let response = mesos::get_task(mesos_task_id).await?;
  let Some(state) = response.tasks.first() else {
    debug!("Task '{mesos_task_id}' is not known to the substrate");
    return Ok(task);
  };
  task.state = state
    .state
    .parse()
    .unwrap_or(TaskState::Unknown);
  locate(contr, &mut task, state).await;
  Ok(task)
}

/// Outcome of reconciling one service task: the task itself plus
/// the backend's view of the owning app, health checks included.
pub struct ServiceUpdate {
  pub task: Task,
  pub container_state: ContainerState,
}

/// Reconcile a service task through the service backend. Returns
/// None while the backend has no task entries yet.
pub async fn update_service_task(
  app: &Appliance,
  contr: &Container,
  task: &Task,
) -> serror::Result<Option<ServiceUpdate>> {
  let task_id = task.id(&contr.id);
  let response = marathon::get_app(&app.id, &task_id).await?;
  let mut task = task.clone();
  let container_state = service_state(&response.app);
  let Some(state) = response.app.tasks.last() else {
    debug!("Task '{task_id}' has no substrate entry yet");
    return Ok(None);
  };
  task.mesos_task_id = Some(state.id.clone());
  task.state = state
    .state
    .parse()
    .unwrap_or(TaskState::Unknown);
  let Some(agent) = cluster().get_agent(&state.slave_id).await
  else {
    warn!("Unrecognized agent id: {}", state.slave_id);
    return Ok(Some(ServiceUpdate {
      task,
      container_state,
    }));
  };
  task.placement = agent.placement.clone();
  let hostname = agent.address().to_string();
  task.endpoints = match contr.network_mode {
    NetworkMode::Host => response
      .app
      .port_definitions
      .iter()
      .enumerate()
      .map(|(i, pd)| Endpoint {
        host: hostname.clone(),
        container_port: pd.port,
        host_port: state
          .ports
          .get(i)
          .copied()
          .unwrap_or(pd.port),
        protocol: pd.protocol.clone(),
        name: None,
      })
      .collect(),
    _ => response
      .app
      .container
      .port_mappings
      .iter()
      .enumerate()
      .map(|(i, mapping)| Endpoint {
        host: hostname.clone(),
        container_port: mapping.container_port,
        host_port: state
          .ports
          .get(i)
          .copied()
          .unwrap_or(mapping.host_port),
        protocol: mapping.protocol.clone(),
        name: None,
      })
      .collect(),
  };
  name_endpoints(contr, &mut task);
  Ok(Some(ServiceUpdate {
    task,
    container_state,
  }))
}

/// The backend's aggregate view of one service app, with the
/// healthy-instance cross-check applied when health checks are
/// configured.
fn service_state(app: &marathon::App) -> ContainerState {
  let states = app
    .tasks
    .iter()
    .map(|task| {
      task.state.parse().unwrap_or(TaskState::Unknown)
    })
    .collect::<Vec<_>>();
  let minimum_capacity =
    app.upgrade_strategy.minimum_health_capacity;
  let state = ContainerState::determine(
    &states,
    minimum_capacity,
  );
  if app.health_checks.is_empty() {
    return state;
  }
  let instances = app.instances.max(1);
  state.check_health(
    app.tasks_healthy,
    app.tasks_unhealthy,
    instances,
    minimum_capacity,
  )
}

/// Reconcile a job task: the job backend hands out the substrate
/// id, the substrate hands out state and whereabouts.
pub async fn update_job_task(
  app: &Appliance,
  contr: &Container,
  task: &Task,
) -> serror::Result<Option<Task>> {
  let task_id = task.id(&contr.id);
  let response = chronos::get_job(&app.id, &task_id).await?;
  let mut task = task.clone();
  let Some(mesos_task_id) = response.substrate_task_id() else {
    return Ok(Some(task));
  };
  task.mesos_task_id = Some(mesos_task_id.to_string());
  let tasks = mesos::get_task(mesos_task_id).await?;
  let Some(state) = tasks.tasks.first() else {
    return Ok(Some(task));
  };
  task.state = job_state(&state.state);
  // a finished repetition with repeats left keeps the job alive
  if task.state == TaskState::Finished
    && response.remaining_repeats() != 0
  {
    task.state = TaskState::Running;
  }
  locate(contr, &mut task, state).await;
  Ok(Some(task))
}

/// The job backend's view of a substrate task state.
fn job_state(state: &str) -> TaskState {
  match state {
    "TASK_RUNNING" | "TASK_STARTING" => TaskState::Running,
    "TASK_FINISHED" => TaskState::Finished,
    "TASK_FAILED" | "TASK_LOST" | "TASK_ERROR" => {
      TaskState::Failed
    }
    "TASK_STAGING" => TaskState::Staging,
    "TASK_KILLING" | "TASK_KILLED" => TaskState::Killed,
    _ => TaskState::Submitted,
  }
}

/// Fill placement and endpoints from the substrate task entry.
async fn locate(
  contr: &Container,
  task: &mut Task,
  state: &mesos::MesosTask,
) {
  let Some(agent) = cluster().get_agent(&state.slave_id).await
  else {
    if !state.slave_id.is_empty() {
      warn!("Unrecognized agent id: {}", state.slave_id);
    }
    return;
  };
  task.placement = agent.placement.clone();
  let hostname = agent.address().to_string();
  task.endpoints = match contr.network_mode {
    NetworkMode::Host => state
      .discovery
      .ports
      .ports
      .iter()
      .map(|port| Endpoint {
        host: hostname.clone(),
        host_port: port.number,
        container_port: port.number,
        protocol: protocol_or_tcp(&port.protocol),
        name: None,
      })
      .collect(),
    _ => state
      .container
      .docker
      .port_mappings
      .iter()
      .map(|mapping| Endpoint {
        host: hostname.clone(),
        host_port: mapping.host_port,
        container_port: mapping.container_port,
        protocol: protocol_or_tcp(&mapping.protocol),
        name: None,
      })
      .collect(),
  };
  name_endpoints(contr, task);
}

fn protocol_or_tcp(protocol: &str) -> String {
  if protocol.is_empty() {
    String::from("tcp")
  } else {
    protocol.to_string()
  }
}

/// Endpoint names come from the container's port definitions,
/// index aligned.
fn name_endpoints(contr: &Container, task: &mut Task) {
  for (i, port) in contr.ports.iter().enumerate() {
    if let Some(endpoint) = task.endpoints.get_mut(i) {
      endpoint.name = port.name.clone();
    }
  }
}

/// Launch a task on its backend. Returns the task in its
/// submitted shape; an already-existing launch counts as
/// submitted too.
pub async fn launch_task(
  scheduled: &ScheduledTask,
) -> serror::Result<Task> {
  let result = match scheduled.container.container_type() {
    ContainerType::Service => {
      let request = marathon::service_request(
        &scheduled.app,
        &scheduled.container,
        &scheduled.task,
        &scheduled.extra_env,
      );
      marathon::put_app(
        &scheduled.app.id,
        &scheduled.task_id(),
        &request,
      )
      .await
      .map(|_| ())
    }
    ContainerType::Job => {
      let request = chronos::job_request(
        &scheduled.app,
        &scheduled.container,
        &scheduled.task,
        &scheduled.extra_env,
      );
      chronos::post_job(&request).await.map(|_| ())
    }
  };
  match result {
    Ok(()) => {}
    Err(e) if e.status == StatusCode::CONFLICT => {
      debug!(
        "Task '{}' already exists on its backend",
        scheduled.task_id()
      );
    }
    Err(e) => return Err(e),
  }
  let mut task = scheduled.task.clone();
  task.state = TaskState::Submitted;
  task.launch_time = Some(pivot_timestamp());
  Ok(task)
}

pub async fn delete_service_task(
  app_id: &str,
  task_id: &str,
) -> serror::Result<String> {
  marathon::delete_app(app_id, task_id).await
}

pub async fn kill_job_task(
  app_id: &str,
  task_id: &str,
) -> serror::Result<String> {
  chronos::kill_tasks(app_id, task_id).await
}

pub async fn delete_job_task(
  app_id: &str,
  task_id: &str,
) -> serror::Result<String> {
  chronos::delete_job(app_id, task_id).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backends::marathon::{App, AppTask};

  fn app_with(
    states: &[&str],
    healthy: u32,
    unhealthy: u32,
    health_checked: bool,
  ) -> App {
    App {
      instances: states.len() as u32,
      tasks: states
        .iter()
        .map(|state| AppTask {
          state: state.to_string(),
          ..Default::default()
        })
        .collect(),
      tasks_healthy: healthy,
      tasks_unhealthy: unhealthy,
      health_checks: if health_checked {
        vec![serde_json::json!({"protocol": "MESOS_TCP"})]
      } else {
        Vec::new()
      },
      ..Default::default()
    }
  }

  #[test]
  fn service_state_follows_the_backend_tasks() {
    let app = app_with(
      &["TASK_RUNNING", "TASK_RUNNING"],
      0,
      0,
      false,
    );
    assert_eq!(service_state(&app), ContainerState::Running);
    let app = app_with(&["TASK_STAGING"], 0, 0, false);
    assert_eq!(service_state(&app), ContainerState::Staging);
    let app = app_with(&[], 0, 0, false);
    assert_eq!(service_state(&app), ContainerState::Submitted);
  }

  #[test]
  fn service_state_cross_checks_health() {
    // nominally running but one of two instances unhealthy at
    // full required capacity
    let app = app_with(
      &["TASK_RUNNING", "TASK_RUNNING"],
      1,
      1,
      true,
    );
    assert_eq!(service_state(&app), ContainerState::Failed);
    // replacement launch still in flight
    let app = app_with(
      &["TASK_RUNNING", "TASK_RUNNING"],
      1,
      0,
      true,
    );
    assert_eq!(service_state(&app), ContainerState::Pending);
    let app = app_with(
      &["TASK_RUNNING", "TASK_RUNNING"],
      2,
      0,
      true,
    );
    assert_eq!(service_state(&app), ContainerState::Running);
  }

  #[test]
  fn job_state_table() {
    assert_eq!(job_state("TASK_RUNNING"), TaskState::Running);
    // a starting job already counts as running
    assert_eq!(job_state("TASK_STARTING"), TaskState::Running);
    assert_eq!(job_state("TASK_FINISHED"), TaskState::Finished);
    assert_eq!(job_state("TASK_FAILED"), TaskState::Failed);
    assert_eq!(job_state("TASK_LOST"), TaskState::Failed);
    assert_eq!(job_state("TASK_ERROR"), TaskState::Failed);
    assert_eq!(job_state("TASK_STAGING"), TaskState::Staging);
    assert_eq!(job_state("TASK_KILLING"), TaskState::Killed);
    assert_eq!(job_state("TASK_KILLED"), TaskState::Killed);
    assert_eq!(job_state("nonsense"), TaskState::Submitted);
  }
}
