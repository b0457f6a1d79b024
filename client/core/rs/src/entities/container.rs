use anyhow::{Context, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use crate::entities::{
  schedule::ContainerScheduleHints,
  task::{Task, TaskState},
  valid_id,
  volume::VolumeScope,
};

/// "service" for long-running containers, "job" for one-off
/// containers.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
  Service,
  Job,
}

/// Container network mode.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
pub enum NetworkMode {
  #[default]
  #[serde(rename = "HOST", alias = "host")]
  Host,
  #[serde(rename = "BRIDGE", alias = "bridge")]
  Bridge,
  #[serde(rename = "CONTAINER", alias = "container")]
  Container,
}

#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
pub enum ContainerVolumeType {
  #[serde(rename = "HOST", alias = "host")]
  Host,
  #[default]
  #[serde(rename = "PERSISTENT", alias = "persistent")]
  Persistent,
}

/// Volume mounted into the container. `src` is a host path for HOST
/// volumes and a declared persistent volume id otherwise.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct ContainerVolume {
  pub src: String,
  pub dest: String,
  #[serde(default, rename = "type")]
  pub volume_type: ContainerVolumeType,
  #[serde(default)]
  pub scope: VolumeScope,
}

/// Container port definition. A `host_port` of 0 asks the substrate
/// to assign one.
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Port {
  pub container_port: u16,
  #[serde(default)]
  pub host_port: u16,
  #[serde(default = "default_protocol")]
  pub protocol: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

/// Endpoint for reaching a running container, read back from the
/// substrate on reconciliation.
#[typeshare]
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Endpoint {
  pub host: String,
  pub host_port: u16,
  pub container_port: u16,
  #[serde(default = "default_protocol")]
  pub protocol: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

fn default_protocol() -> String {
  String::from("tcp")
}

/// Resource demand of one container instance.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
  /// Number of CPU cores, at least 1.
  pub cpus: f64,
  /// Memory in MB.
  pub mem: f64,
  /// Disk in MB.
  #[serde(default)]
  pub disk: f64,
  /// Number of GPU units. Unsupported for jobs.
  #[serde(default)]
  pub gpu: f64,
}

/// Health check performed on services once they are up.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
  #[serde(default = "default_health_check_path")]
  pub path: String,
  #[serde(default = "default_health_check_protocol")]
  pub protocol: String,
  #[serde(default)]
  pub port_index: u32,
  #[serde(default = "default_max_consecutive_failures")]
  pub max_consecutive_failures: u32,
  #[serde(default = "default_grace_period_seconds")]
  pub grace_period_seconds: u32,
  #[serde(default = "default_interval_seconds")]
  pub interval_seconds: u32,
  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u32,
}

impl Default for HealthCheck {
  fn default() -> Self {
    HealthCheck {
      path: default_health_check_path(),
      protocol: default_health_check_protocol(),
      port_index: 0,
      max_consecutive_failures: default_max_consecutive_failures(),
      grace_period_seconds: default_grace_period_seconds(),
      interval_seconds: default_interval_seconds(),
      timeout_seconds: default_timeout_seconds(),
    }
  }
}

fn default_health_check_path() -> String {
  String::from("/")
}
fn default_health_check_protocol() -> String {
  String::from("MESOS_TCP")
}
fn default_max_consecutive_failures() -> u32 {
  3
}
fn default_grace_period_seconds() -> u32 {
  300
}
fn default_interval_seconds() -> u32 {
  60
}
fn default_timeout_seconds() -> u32 {
  20
}

/// Input data consumed by a container, as paths into the object
/// registry.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct DataSpec {
  #[serde(default)]
  pub input: Vec<String>,
}

/// Service-only configuration.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct ServiceConfig {
  /// Key-value labels passed through for service discovery.
  #[serde(default)]
  pub labels: IndexMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub health_check: Option<HealthCheck>,
  /// Synthesize a health check on the first tcp port when no
  /// explicit one is given.
  #[serde(default)]
  pub default_health_check: bool,
  /// Minimum fraction of instances that must be healthy for the
  /// service to count as running. In `[0, 1]`.
  #[serde(default = "default_minimum_capacity")]
  pub minimum_capacity: f64,
}

fn default_minimum_capacity() -> f64 {
  1.0
}

/// Job-only configuration.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
  /// Maximum retries on failure.
  #[serde(default = "default_retries")]
  pub retries: u32,
  /// Number of repetitions of the job.
  #[serde(default = "default_repeats")]
  pub repeats: u32,
  /// ISO-8601 start time. Empty starts the job immediately.
  #[serde(default)]
  pub start_time: String,
  /// ISO-8601 duration (without the leading `P`) between
  /// repetitions.
  #[serde(default = "default_interval")]
  pub interval: String,
}

impl Default for JobConfig {
  fn default() -> Self {
    JobConfig {
      retries: default_retries(),
      repeats: default_repeats(),
      start_time: String::new(),
      interval: default_interval(),
    }
  }
}

fn default_retries() -> u32 {
  1
}
fn default_repeats() -> u32 {
  1
}
fn default_interval() -> String {
  String::from("2M")
}

/// The variant payload of a container.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContainerSpec {
  Service(ServiceConfig),
  Job(JobConfig),
}

impl Default for ContainerSpec {
  fn default() -> Self {
    ContainerSpec::Job(JobConfig::default())
  }
}

/// Declarative spec for one or more tasks inside an appliance.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct Container {
  /// Unique within the owning appliance.
  pub id: String,
  /// The owning appliance id, set server side.
  #[serde(default)]
  pub appliance: String,
  /// Image reference, local to the cluster or public.
  pub image: String,
  pub resources: Resources,
  #[serde(default = "default_instances")]
  pub instances: u32,
  /// Command line. Mutually exclusive with `args`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cmd: Option<String>,
  /// Argument vector. Mutually exclusive with `cmd`.
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: IndexMap<String, String>,
  #[serde(default)]
  pub volumes: Vec<ContainerVolume>,
  #[serde(default)]
  pub network_mode: NetworkMode,
  /// Read-only, written by reconciliation.
  #[serde(default)]
  pub endpoints: Vec<Endpoint>,
  #[serde(default)]
  pub ports: Vec<Port>,
  #[serde(default)]
  pub is_privileged: bool,
  #[serde(default = "default_force_pull_image")]
  pub force_pull_image: bool,
  /// Ids of peer containers this container depends on.
  #[serde(default)]
  pub dependencies: Vec<String>,
  /// Input data consumed by the container, used by data locality
  /// aware scheduling.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<DataSpec>,
  /// User-supplied placement preferences.
  #[serde(default, rename = "schedule_hints")]
  pub user_schedule_hints: ContainerScheduleHints,
  /// Scheduler-computed placement, read-only to users.
  #[serde(default)]
  pub sys_schedule_hints: ContainerScheduleHints,
  /// Runtime instances, written by the scheduler.
  #[serde(default)]
  pub tasks: Vec<Task>,
  /// Aggregate state folded from the task states, read-only.
  #[serde(default)]
  pub state: ContainerState,
  /// Unix ms of the last reconciliation against the backends.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_update: Option<crate::entities::I64>,
  #[serde(flatten)]
  pub spec: ContainerSpec,
}

fn default_instances() -> u32 {
  1
}
fn default_force_pull_image() -> bool {
  true
}

impl Default for Resources {
  fn default() -> Self {
    Resources {
      cpus: 1.0,
      mem: 128.0,
      disk: 0.0,
      gpu: 0.0,
    }
  }
}

impl Container {
  pub fn container_type(&self) -> ContainerType {
    match self.spec {
      ContainerSpec::Service(_) => ContainerType::Service,
      ContainerSpec::Job(_) => ContainerType::Job,
    }
  }

  pub fn as_service(&self) -> Option<&ServiceConfig> {
    match &self.spec {
      ContainerSpec::Service(service) => Some(service),
      ContainerSpec::Job(_) => None,
    }
  }

  pub fn as_job(&self) -> Option<&JobConfig> {
    match &self.spec {
      ContainerSpec::Job(job) => Some(job),
      ContainerSpec::Service(_) => None,
    }
  }

  pub fn host_volumes(
    &self,
  ) -> impl Iterator<Item = &ContainerVolume> {
    self
      .volumes
      .iter()
      .filter(|v| v.volume_type == ContainerVolumeType::Host)
  }

  pub fn persistent_volumes(
    &self,
  ) -> impl Iterator<Item = &ContainerVolume> {
    self
      .volumes
      .iter()
      .filter(|v| v.volume_type == ContainerVolumeType::Persistent)
  }

  /// Structural validation applied on create, before any backend
  /// call. Cross-container invariants live on [Appliance].
  ///
  /// [Appliance]: crate::entities::appliance::Appliance
  pub fn validate(&self) -> anyhow::Result<()> {
    if !valid_id(&self.id) {
      return Err(anyhow!(
        "Container id '{}' must match {}",
        self.id,
        crate::entities::ID_PATTERN
      ));
    }
    if self.image.is_empty() {
      return Err(anyhow!("Container '{}' has no image", self.id));
    }
    if self.cmd.is_some() && !self.args.is_empty() {
      return Err(anyhow!(
        "Cannot specify both 'cmd' and 'args' on container '{}'",
        self.id
      ));
    }
    if self.resources.cpus < 1.0 {
      return Err(anyhow!(
        "Container '{}' must request at least 1 cpu",
        self.id
      ));
    }
    if self.instances == 0 {
      return Err(anyhow!(
        "Container '{}' must have at least 1 instance",
        self.id
      ));
    }
    match &self.spec {
      ContainerSpec::Service(service) => {
        if !(0.0..=1.0).contains(&service.minimum_capacity) {
          return Err(anyhow!(
            "minimum_capacity of service '{}' must be within [0, 1]",
            self.id
          ));
        }
      }
      ContainerSpec::Job(_) => {
        if self.resources.gpu > 0.0 {
          return Err(anyhow!(
            "GPU is not yet supported for jobs ('{}')",
            self.id
          ));
        }
        if self.network_mode == NetworkMode::Container {
          return Err(anyhow!(
            "CONTAINER network mode is not supported for jobs ('{}')",
            self.id
          ));
        }
      }
    }
    Ok(())
  }

  /// The service health check to submit: the explicit one, or a
  /// default on the first tcp port when `default_health_check` is
  /// set.
  pub fn effective_health_check(&self) -> Option<HealthCheck> {
    let service = self.as_service()?;
    if let Some(health_check) = &service.health_check {
      return Some(health_check.clone());
    }
    if !service.default_health_check {
      return None;
    }
    self
      .ports
      .iter()
      .position(|p| p.protocol == "tcp")
      .map(|i| HealthCheck {
        port_index: i as u32,
        ..Default::default()
      })
  }

  /// Copy endpoint names over from the port definitions, index
  /// aligned.
  pub fn name_endpoints(&mut self) {
    for (i, port) in self.ports.iter().enumerate() {
      if let Some(endpoint) = self.endpoints.get_mut(i) {
        endpoint.name = port.name.clone();
      }
    }
  }

  pub fn same_identity(&self, other: &Container) -> bool {
    self.id == other.id && self.appliance == other.appliance
  }

  pub fn parse(value: serde_json::Value) -> anyhow::Result<Self> {
    let container: Container = serde_json::from_value(value)
      .context("Failed to parse container")?;
    container.validate()?;
    Ok(container)
  }
}

/// Aggregate container state derived from the states of its tasks.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
  #[default]
  Submitted,
  Pending,
  Staging,
  Running,
  Success,
  Failed,
  Killed,
}

impl ContainerState {
  /// Fold the task states of a container into its aggregate
  /// state: jobs succeed once every instance finished, services
  /// follow the capacity rule.
  pub fn of_container(contr: &Container) -> ContainerState {
    let states = contr
      .tasks
      .iter()
      .map(|task| task.state)
      .collect::<Vec<_>>();
    match &contr.spec {
      ContainerSpec::Job(_) => Self::of_job(&states),
      ContainerSpec::Service(service) => {
        ContainerState::determine(
          &states,
          service.minimum_capacity,
        )
      }
    }
  }

  fn of_job(states: &[TaskState]) -> ContainerState {
    use TaskState::*;
    if states.is_empty() {
      return ContainerState::Submitted;
    }
    if states.iter().all(|s| *s == Finished) {
      return ContainerState::Success;
    }
    if states.iter().any(|s| matches!(s, Killed | Killing)) {
      return ContainerState::Killed;
    }
    if states.iter().any(|s| {
      matches!(
        s,
        Failed | Lost | Error | Dropped | Unreachable | Gone
      )
    }) {
      return ContainerState::Failed;
    }
    if states.iter().any(|s| *s == Staging) {
      return ContainerState::Staging;
    }
    if states.iter().any(|s| *s == Starting) {
      return ContainerState::Pending;
    }
    if states
      .iter()
      .any(|s| matches!(s, Running | Finished))
    {
      return ContainerState::Running;
    }
    ContainerState::Submitted
  }

  /// Fold task states into a container state. A service counts as
  /// running once `running / total >= minimum_capacity`.
  pub fn determine(
    states: &[TaskState],
    minimum_capacity: f64,
  ) -> ContainerState {
    if states.is_empty() {
      return ContainerState::Submitted;
    }
    if states.iter().any(|s| *s == TaskState::Staging) {
      return ContainerState::Staging;
    }
    if states.iter().any(|s| *s == TaskState::Starting) {
      return ContainerState::Pending;
    }
    let running = states
      .iter()
      .filter(|s| **s == TaskState::Running)
      .count();
    if running as f64 / states.len() as f64 >= minimum_capacity {
      ContainerState::Running
    } else {
      ContainerState::Failed
    }
  }

  /// Cross-check a nominally running service against its health
  /// check results: short on healthy instances, it is pending while
  /// launches are still in flight and failed otherwise.
  pub fn check_health(
    self,
    tasks_healthy: u32,
    tasks_unhealthy: u32,
    instances: u32,
    minimum_capacity: f64,
  ) -> ContainerState {
    if self != ContainerState::Running || instances == 0 {
      return self;
    }
    if (tasks_healthy as f64 / instances as f64) >= minimum_capacity
    {
      return self;
    }
    if tasks_healthy + tasks_unhealthy < instances {
      ContainerState::Pending
    } else {
      ContainerState::Failed
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn job(id: &str) -> Container {
    Container {
      id: id.into(),
      appliance: "test-app".into(),
      image: "ubuntu".into(),
      resources: Resources {
        cpus: 1.0,
        mem: 1024.0,
        disk: 128.0,
        gpu: 0.0,
      },
      ..Default::default()
    }
  }

  #[test]
  fn parses_service_variant_from_wire_shape() {
    let container = Container::parse(serde_json::json!({
      "id": "first-service",
      "type": "service",
      "image": "nginx",
      "resources": {"cpus": 1, "mem": 1024},
      "instances": 2,
      "cmd": "tail -f /dev/null",
      "minimum_capacity": 0.5,
    }))
    .unwrap();
    assert_eq!(
      container.container_type(),
      ContainerType::Service
    );
    assert_eq!(
      container.as_service().unwrap().minimum_capacity,
      0.5
    );
    assert_eq!(container.instances, 2);
  }

  #[test]
  fn round_trips_through_json() {
    let mut container = job("first-job");
    container.dependencies = vec!["other".into()];
    container.env.insert("KEY".into(), "value".into());
    let encoded = serde_json::to_value(&container).unwrap();
    assert_eq!(encoded["type"], "job");
    let decoded: Container =
      serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, container);
  }

  #[test]
  fn rejects_cmd_and_args_together() {
    let mut container = job("bad");
    container.cmd = Some("/bin/bash".into());
    container.args = vec!["-c".into()];
    assert!(container.validate().is_err());
  }

  #[test]
  fn rejects_gpu_and_container_network_for_jobs() {
    let mut container = job("gpu-job");
    container.resources.gpu = 1.0;
    assert!(container.validate().is_err());
    let mut container = job("net-job");
    container.network_mode = NetworkMode::Container;
    assert!(container.validate().is_err());
  }

  #[test]
  fn determine_state_folds_task_states() {
    use TaskState::*;
    assert_eq!(
      ContainerState::determine(&[], 1.0),
      ContainerState::Submitted
    );
    assert_eq!(
      ContainerState::determine(&[Running, Staging], 1.0),
      ContainerState::Staging
    );
    assert_eq!(
      ContainerState::determine(&[Running, Starting], 1.0),
      ContainerState::Pending
    );
    assert_eq!(
      ContainerState::determine(&[Running, Running], 1.0),
      ContainerState::Running
    );
    assert_eq!(
      ContainerState::determine(&[Running, Failed], 1.0),
      ContainerState::Failed
    );
    // half capacity tolerates one failure out of two
    assert_eq!(
      ContainerState::determine(&[Running, Failed], 0.5),
      ContainerState::Running
    );
  }

  #[test]
  fn job_container_state_fold() {
    use crate::entities::task::Task;
    let mut container = job("batch");
    let with_states = |states: &[TaskState]| {
      states
        .iter()
        .enumerate()
        .map(|(i, state)| Task {
          seqno: i as u32,
          state: *state,
          ..Default::default()
        })
        .collect::<Vec<_>>()
    };
    assert_eq!(
      ContainerState::of_container(&container),
      ContainerState::Submitted
    );
    container.tasks =
      with_states(&[TaskState::Finished, TaskState::Running]);
    assert_eq!(
      ContainerState::of_container(&container),
      ContainerState::Running
    );
    container.tasks =
      with_states(&[TaskState::Finished, TaskState::Finished]);
    assert_eq!(
      ContainerState::of_container(&container),
      ContainerState::Success
    );
    container.tasks =
      with_states(&[TaskState::Finished, TaskState::Failed]);
    assert_eq!(
      ContainerState::of_container(&container),
      ContainerState::Failed
    );
    container.tasks =
      with_states(&[TaskState::Running, TaskState::Killed]);
    assert_eq!(
      ContainerState::of_container(&container),
      ContainerState::Killed
    );
  }

  #[test]
  fn health_cross_check() {
    // full capacity demanded, one unhealthy instance: failed
    assert_eq!(
      ContainerState::Running.check_health(1, 1, 2, 1.0),
      ContainerState::Failed
    );
    // launches still in flight: pending
    assert_eq!(
      ContainerState::Running.check_health(1, 0, 2, 1.0),
      ContainerState::Pending
    );
    assert_eq!(
      ContainerState::Running.check_health(2, 0, 2, 1.0),
      ContainerState::Running
    );
  }

  #[test]
  fn default_health_check_lands_on_first_tcp_port() {
    let mut container = Container {
      spec: ContainerSpec::Service(ServiceConfig {
        default_health_check: true,
        ..Default::default()
      }),
      ..job("svc")
    };
    container.ports = vec![
      Port {
        container_port: 53,
        host_port: 0,
        protocol: "udp".into(),
        name: None,
      },
      Port {
        container_port: 8080,
        host_port: 0,
        protocol: "tcp".into(),
        name: Some("web".into()),
      },
    ];
    let health_check =
      container.effective_health_check().unwrap();
    assert_eq!(health_check.port_index, 1);
  }
}
