//! Service backend adapter (Marathon-shaped API).

use indexmap::IndexMap;
use pivot_client::{
  entities::{
    appliance::Appliance,
    container::{Container, NetworkMode},
    task::Task,
    volume::VolumeScope,
  },
  parsers::{pivot_url, resolve_short_ids},
};
use serde::{Deserialize, Serialize};

use crate::state::{backend_addrs, http_client};

fn base_url() -> String {
  backend_addrs().load().marathon.base_url()
}

/// `GET /apps/<app>/<task>` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppResponse {
  pub app: App,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct App {
  pub id: String,
  pub instances: u32,
  pub tasks: Vec<AppTask>,
  pub container: AppContainer,
  pub port_definitions: Vec<AppPortDefinition>,
  pub health_checks: Vec<serde_json::Value>,
  pub tasks_healthy: u32,
  pub tasks_unhealthy: u32,
  pub upgrade_strategy: AppUpgradeStrategy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppTask {
  pub id: String,
  pub state: String,
  pub slave_id: String,
  pub host: String,
  pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppContainer {
  pub port_mappings: Vec<AppPortMapping>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppPortMapping {
  pub container_port: u16,
  pub host_port: u16,
  pub service_port: u16,
  pub protocol: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppPortDefinition {
  pub port: u16,
  pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppUpgradeStrategy {
  pub minimum_health_capacity: f64,
}

impl Default for AppUpgradeStrategy {
  fn default() -> Self {
    AppUpgradeStrategy {
      minimum_health_capacity: 1.0,
    }
  }
}

/// `GET /deployments` response entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Deployment {
  pub id: String,
  pub affected_apps: Vec<String>,
}

pub async fn get_app(
  app_id: &str,
  task_id: &str,
) -> serror::Result<AppResponse> {
  http_client()
    .get(format!("{}/apps/{app_id}/{task_id}", base_url()))
    .await
}

pub async fn put_app(
  app_id: &str,
  task_id: &str,
  request: &AppRequest,
) -> serror::Result<String> {
  http_client()
    .put(
      format!("{}/apps/{app_id}/{task_id}", base_url()),
      request,
    )
    .await
}

pub async fn delete_app(
  app_id: &str,
  task_id: &str,
) -> serror::Result<String> {
  http_client()
    .delete(format!(
      "{}/apps/{app_id}/{task_id}?force=true",
      base_url()
    ))
    .await
}

pub async fn delete_group(
  app_id: &str,
  force: bool,
) -> serror::Result<String> {
  let mut url = format!("{}/groups/{app_id}", base_url());
  if force {
    url.push_str("?force=true");
  }
  http_client().delete(url).await
}

pub async fn get_deployments() -> serror::Result<Vec<Deployment>> {
  http_client()
    .get(format!("{}/deployments", base_url()))
    .await
}

/// `GET /leader` response: `{"leader": "<host>:<port>"}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LeaderResponse {
  pub leader: String,
}

impl LeaderResponse {
  pub fn host(&self) -> Option<&str> {
    let host = self
      .leader
      .split_once(':')
      .map(|(host, _)| host)
      .unwrap_or(&self.leader);
    (!host.is_empty()).then_some(host)
  }
}

pub async fn get_leader() -> serror::Result<LeaderResponse> {
  http_client()
    .get(format!("{}/leader", base_url()))
    .await
}

/// `PUT /apps/<app>/<task>` body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
  pub id: String,
  pub cpus: f64,
  pub mem: f64,
  pub disk: f64,
  pub gpus: f64,
  pub instances: u32,
  pub env: IndexMap<String, String>,
  pub labels: IndexMap<String, String>,
  pub require_ports: bool,
  pub accepted_resource_roles: Vec<String>,
  pub container: RequestContainer,
  pub health_checks: Vec<HealthCheckRequest>,
  pub upgrade_strategy: UpgradeStrategyRequest,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cmd: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub args: Option<Vec<String>>,
  pub networks: Vec<NetworkRequest>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub port_definitions: Option<Vec<PortDefinitionRequest>>,
  pub constraints: Vec<[String; 3]>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContainer {
  #[serde(rename = "type")]
  pub container_type: String,
  pub volumes: Vec<VolumeRequest>,
  pub docker: DockerRequest,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerRequest {
  pub image: String,
  pub privileged: bool,
  pub force_pull_image: bool,
  pub parameters: Vec<Parameter>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub port_mappings: Option<Vec<PortMappingRequest>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
  pub host_path: String,
  pub container_path: String,
  pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Parameter {
  pub key: String,
  pub value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingRequest {
  pub container_port: u16,
  pub host_port: u16,
  pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortDefinitionRequest {
  pub port: u16,
  pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
  pub path: String,
  pub protocol: String,
  pub port_index: u32,
  pub max_consecutive_failures: u32,
  pub grace_period_seconds: u32,
  pub interval_seconds: u32,
  pub timeout_seconds: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategyRequest {
  pub minimum_health_capacity: f64,
  pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategyRequest {
  fn default() -> Self {
    UpgradeStrategyRequest {
      minimum_health_capacity: 1.0,
      maximum_over_capacity: 1.0,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkRequest {
  pub mode: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

/// Translate a service task into the backend request. Extra env
/// pairs carry the scheduler-computed data source variables.
pub fn service_request(
  app: &Appliance,
  contr: &Container,
  task: &Task,
  extra_env: &[(String, String)],
) -> AppRequest {
  let app_id = &app.id;
  let task_id = task.id(&contr.id);
  let service =
    contr.as_service().cloned().unwrap_or_default();

  let mut parameters = vec![
    Parameter {
      key: "hostname".into(),
      value: task_id.clone(),
    },
    Parameter {
      key: "rm".into(),
      value: "true".into(),
    },
    Parameter {
      key: "oom-kill-disable".into(),
      value: "true".into(),
    },
  ];
  // persistent volumes ride on the docker volume driver
  if let Some(data_persistence) = &app.data_persistence {
    let persistent =
      contr.persistent_volumes().collect::<Vec<_>>();
    if !persistent.is_empty() {
      parameters.push(Parameter {
        key: "volume-driver".into(),
        value: data_persistence.volume_type.driver().into(),
      });
      for vol in persistent {
        let prefix = match vol.scope {
          VolumeScope::Local => format!("{app_id}-"),
          VolumeScope::Global => String::new(),
        };
        parameters.push(Parameter {
          key: "volume".into(),
          value: format!("{prefix}{}:{}", vol.src, vol.dest),
        });
      }
    }
  }

  let mut env = IndexMap::new();
  env.insert("PIVOT_URL".to_string(), pivot_url());
  for (key, value) in &contr.env {
    env.insert(
      key.clone(),
      resolve_short_ids(value, app_id),
    );
  }
  for (key, value) in extra_env {
    env.insert(key.clone(), value.clone());
  }

  let mut request = AppRequest {
    id: format!("/{app_id}/{task_id}"),
    cpus: contr.resources.cpus,
    mem: contr.resources.mem,
    disk: contr.resources.disk,
    gpus: contr.resources.gpu,
    // the global scheduler launches every instance separately
    instances: 1,
    env,
    labels: service.labels.clone(),
    require_ports: !contr.ports.is_empty(),
    accepted_resource_roles: vec![
      "slave_public".into(),
      "*".into(),
    ],
    container: RequestContainer {
      container_type: "DOCKER".into(),
      volumes: contr
        .host_volumes()
        .map(|v| VolumeRequest {
          host_path: v.src.clone(),
          container_path: v.dest.clone(),
          mode: "RW".into(),
        })
        .collect(),
      docker: DockerRequest {
        image: contr.image.clone(),
        privileged: contr.is_privileged,
        force_pull_image: contr.force_pull_image,
        parameters,
        port_mappings: None,
      },
    },
    health_checks: contr
      .effective_health_check()
      .map(|hc| {
        vec![HealthCheckRequest {
          path: hc.path,
          protocol: hc.protocol,
          port_index: hc.port_index,
          max_consecutive_failures: hc.max_consecutive_failures,
          grace_period_seconds: hc.grace_period_seconds,
          interval_seconds: hc.interval_seconds,
          timeout_seconds: hc.timeout_seconds,
        }]
      })
      .unwrap_or_default(),
    upgrade_strategy: UpgradeStrategyRequest {
      minimum_health_capacity: service.minimum_capacity,
      maximum_over_capacity: 1.0,
    },
    ..Default::default()
  };

  if let Some(cmd) = &contr.cmd {
    request.cmd = Some(resolve_short_ids(cmd, app_id));
  } else if !contr.args.is_empty() {
    request.args = Some(
      contr
        .args
        .iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| resolve_short_ids(a, app_id))
        .collect(),
    );
  }

  request.networks = vec![match contr.network_mode {
    NetworkMode::Host => NetworkRequest {
      mode: "host".into(),
      name: None,
    },
    NetworkMode::Bridge => NetworkRequest {
      mode: "container/bridge".into(),
      name: None,
    },
    NetworkMode::Container => NetworkRequest {
      mode: "container".into(),
      name: Some("dcos".into()),
    },
  }];
  if contr.network_mode == NetworkMode::Host {
    request.port_definitions = Some(
      contr
        .ports
        .iter()
        .map(|p| PortDefinitionRequest {
          port: p.container_port,
          protocol: p.protocol.clone(),
        })
        .collect(),
    );
  } else {
    request.container.docker.port_mappings = Some(
      contr
        .ports
        .iter()
        .map(|p| PortMappingRequest {
          container_port: p.container_port,
          host_port: p.host_port,
          protocol: p.protocol.clone(),
        })
        .collect(),
    );
  }

  let hints = &task.schedule_hints;
  request.constraints.push([
    "preemptible".into(),
    "CLUSTER".into(),
    hints.preemptible.to_string(),
  ]);
  if let Some((dimension, value)) = hints.placement.constraint() {
    request.constraints.push([
      dimension.into(),
      "CLUSTER".into(),
      value.into(),
    ]);
  }
  request
}

#[cfg(test)]
mod tests {
  use super::*;
  use pivot_client::entities::task::TaskState;
  use pivot_client::entities::{
    container::{
      ContainerSpec, ContainerVolume, Port, Resources,
      ServiceConfig,
    },
    schedule::{ContainerScheduleHints, Placement},
    volume::{DataPersistence, PersistentVolume},
  };

  fn service_appliance() -> Appliance {
    let container = Container {
      id: "first-service".into(),
      appliance: "test-app".into(),
      image: "nginx".into(),
      resources: Resources {
        cpus: 1.0,
        mem: 1024.0,
        disk: 0.0,
        gpu: 0.0,
      },
      instances: 2,
      cmd: Some("curl http://@first-service:8080".into()),
      ports: vec![Port {
        container_port: 8080,
        host_port: 0,
        protocol: "tcp".into(),
        name: Some("web".into()),
      }],
      volumes: vec![ContainerVolume {
        src: "alpha".into(),
        dest: "/mnt/data".into(),
        ..Default::default()
      }],
      spec: ContainerSpec::Service(ServiceConfig {
        minimum_capacity: 0.5,
        ..Default::default()
      }),
      ..Default::default()
    };
    Appliance {
      id: "test-app".into(),
      containers: vec![container],
      data_persistence: Some(DataPersistence {
        volumes: vec![PersistentVolume {
          id: "alpha".into(),
          appliance: "test-app".into(),
          ..Default::default()
        }],
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[test]
  fn builds_service_request() {
    let app = service_appliance();
    let contr = &app.containers[0];
    let task = Task {
      seqno: 0,
      schedule_hints: ContainerScheduleHints {
        placement: Placement {
          cloud: Some("aws".into()),
          ..Default::default()
        },
        preemptible: false,
      },
      ..Default::default()
    };
    let request = service_request(&app, contr, &task, &[]);
    assert_eq!(request.id, "/test-app/first-service-0");
    assert_eq!(request.instances, 1);
    assert_eq!(
      request.upgrade_strategy.minimum_health_capacity,
      0.5
    );
    // host network puts ports into portDefinitions
    assert_eq!(
      request.port_definitions.as_ref().unwrap().len(),
      1
    );
    assert!(request.container.docker.port_mappings.is_none());
    // short reference resolved into the cluster dns name
    assert!(
      request
        .cmd
        .as_ref()
        .unwrap()
        .contains("first-service-test-app.")
    );
    assert_eq!(request.env["PIVOT_URL"], pivot_url());
    // local volume rides the driver, namespaced by appliance
    assert!(request.container.docker.parameters.iter().any(
      |p| p.key == "volume"
        && p.value == "test-app-alpha:/mnt/data"
    ));
    assert!(request.constraints.contains(&[
      "cloud".to_string(),
      "CLUSTER".to_string(),
      "aws".to_string()
    ]));
  }

  #[test]
  fn parses_app_payload() {
    let response: AppResponse = serde_json::from_value(
      serde_json::json!({
        "app": {
          "id": "/test-app/first-service-0",
          "instances": 1,
          "tasksHealthy": 1,
          "tasksUnhealthy": 0,
          "healthChecks": [{"protocol": "MESOS_TCP"}],
          "upgradeStrategy": {
            "minimumHealthCapacity": 0.5,
            "maximumOverCapacity": 1.0
          },
          "portDefinitions": [
            {"port": 8080, "protocol": "tcp"}
          ],
          "container": {
            "type": "DOCKER",
            "portMappings": [
              {"containerPort": 8080, "hostPort": 0,
               "servicePort": 10101, "protocol": "tcp"}
            ]
          },
          "tasks": [{
            "id": "test-app_first-service-0.abc",
            "state": "TASK_RUNNING",
            "slaveId": "395d954b-S9",
            "host": "10.52.0.1",
            "ports": [31884]
          }]
        }
      }),
    )
    .unwrap();
    let app = response.app;
    assert_eq!(
      app.upgrade_strategy.minimum_health_capacity,
      0.5
    );
    let task = app.tasks.last().unwrap();
    assert_eq!(
      task.state.parse::<TaskState>().unwrap(),
      TaskState::Running
    );
    assert_eq!(task.ports, vec![31884]);
    assert_eq!(app.port_definitions[0].port, 8080);
    assert_eq!(
      app.container.port_mappings[0].service_port,
      10101
    );
  }

  #[test]
  fn parses_deployments_payload() {
    let deployments: Vec<Deployment> = serde_json::from_value(
      serde_json::json!([{
        "id": "97c136bf-5a28-4821-9d94-480d9fbb01c8",
        "affectedApps": ["/test-app/first-service-0"]
      }]),
    )
    .unwrap();
    assert!(
      deployments[0].affected_apps[0]
        .starts_with("/test-app/")
    );
  }
}
