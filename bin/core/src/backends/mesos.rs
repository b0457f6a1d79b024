//! Mesos master adapter: agent snapshot and task lookup.

use std::collections::HashMap;

use serde::Deserialize;

use crate::state::{backend_addrs, http_client};

fn base_url() -> String {
  backend_addrs().load().mesos.base_url()
}

/// `GET /master/slaves` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlavesResponse {
  pub slaves: Vec<Slave>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Slave {
  pub id: String,
  pub hostname: String,
  pub resources: SlaveResources,
  pub used_resources: SlaveResources,
  pub offered_resources: SlaveResources,
  pub reserved_resources: SlaveResources,
  pub attributes: HashMap<String, serde_json::Value>,
}

/// Scalar resources plus the `ports` interval string
/// (`"[lo-hi, lo-hi]"`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlaveResources {
  pub cpus: f64,
  pub mem: f64,
  pub disk: f64,
  pub gpus: f64,
  pub ports: String,
}

impl Slave {
  pub fn attribute(&self, key: &str) -> Option<String> {
    self.attributes.get(key).map(|value| match value {
      serde_json::Value::String(s) => s.clone(),
      value => value.to_string(),
    })
  }
}

/// `GET /tasks?task_id=<id>` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TasksResponse {
  pub tasks: Vec<MesosTask>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MesosTask {
  pub id: String,
  pub state: String,
  pub slave_id: String,
  pub discovery: TaskDiscovery,
  pub container: TaskContainer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskDiscovery {
  pub ports: TaskDiscoveryPorts,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskDiscoveryPorts {
  pub ports: Vec<TaskPort>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskPort {
  pub number: u16,
  pub protocol: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskContainer {
  pub docker: TaskDocker,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskDocker {
  pub port_mappings: Vec<TaskPortMapping>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskPortMapping {
  pub container_port: u16,
  pub host_port: u16,
  pub protocol: String,
}

pub async fn get_slaves() -> serror::Result<SlavesResponse> {
  http_client()
    .get(format!("{}/master/slaves", base_url()))
    .await
}

pub async fn get_task(
  mesos_task_id: &str,
) -> serror::Result<TasksResponse> {
  http_client()
    .get(format!(
      "{}/tasks?task_id={mesos_task_id}",
      base_url()
    ))
    .await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_master_slaves_payload() {
    let response: SlavesResponse = serde_json::from_value(
      serde_json::json!({
        "slaves": [{
          "id": "395d954b-555c-4a9c-beec-d67b6d673a20-S9",
          "hostname": "10.52.0.1",
          "resources": {
            "cpus": 8.0, "mem": 15360.0, "disk": 102400.0,
            "gpus": 0.0, "ports": "[1025-2180, 2182-3887]"
          },
          "used_resources": {
            "cpus": 2.0, "mem": 4096.0, "disk": 0.0, "gpus": 0.0,
            "ports": "[1025-1026]"
          },
          "offered_resources": {},
          "reserved_resources": {},
          "attributes": {
            "cloud": "aws",
            "region": "us-east-1",
            "zone": "us-east-1a",
            "public_ip": "34.200.1.1",
            "preemptible": "false"
          }
        }]
      }),
    )
    .unwrap();
    let slave = &response.slaves[0];
    assert_eq!(slave.hostname, "10.52.0.1");
    assert_eq!(slave.resources.cpus, 8.0);
    assert_eq!(
      slave.resources.ports,
      "[1025-2180, 2182-3887]"
    );
    assert_eq!(slave.attribute("cloud").as_deref(), Some("aws"));
    // non-string attributes stringify
    let mut slave = slave.clone();
    slave
      .attributes
      .insert("preemptible".into(), serde_json::json!(true));
    assert_eq!(
      slave.attribute("preemptible").as_deref(),
      Some("true")
    );
  }

  #[test]
  fn parses_tasks_payload() {
    let response: TasksResponse = serde_json::from_value(
      serde_json::json!({
        "tasks": [{
          "id": "one-job_first-job-0.abc123",
          "state": "TASK_RUNNING",
          "slave_id": "395d954b-S9",
          "discovery": {
            "ports": {"ports": [
              {"number": 31500, "protocol": "tcp"}
            ]}
          },
          "container": {"docker": {"port_mappings": [
            {"container_port": 8080, "host_port": 31500,
             "protocol": "tcp"}
          ]}}
        }]
      }),
    )
    .unwrap();
    let task = &response.tasks[0];
    assert_eq!(task.state, "TASK_RUNNING");
    assert_eq!(task.discovery.ports.ports[0].number, 31500);
    assert_eq!(
      task.container.docker.port_mappings[0].container_port,
      8080
    );
  }
}
