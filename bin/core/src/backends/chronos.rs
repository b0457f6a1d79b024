//! Job backend adapter (Chronos-shaped API).

use pivot_client::{
  entities::{
    appliance::Appliance,
    container::{Container, NetworkMode},
    task::Task,
    volume::VolumeScope,
  },
  parsers::resolve_short_ids,
};
use serde::{Deserialize, Serialize};

use crate::{
  backends::marathon::{Parameter, VolumeRequest},
  state::{backend_addrs, http_client},
};

fn base_url() -> String {
  backend_addrs().load().chronos.base_url()
}

/// `GET /job/<app>.<task>` response. The backend reports the
/// substrate task id as the literal string "null" until the job
/// has been scheduled once.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobResponse {
  pub name: String,
  pub task_id: String,
  pub schedule: String,
}

impl JobResponse {
  pub fn substrate_task_id(&self) -> Option<&str> {
    (!self.task_id.is_empty() && self.task_id != "null")
      .then_some(self.task_id.as_str())
  }

  /// Remaining repeats from the `R<n>/<start>/P<interval>`
  /// schedule string. `R` without a number repeats forever (-1).
  pub fn remaining_repeats(&self) -> i64 {
    let Some(repeats) = self.schedule.split('/').next() else {
      return 0;
    };
    let repeats = repeats.trim_start_matches('R');
    if repeats.is_empty() {
      return -1;
    }
    repeats.parse().unwrap_or(0)
  }
}

pub async fn get_job(
  app_id: &str,
  task_id: &str,
) -> serror::Result<JobResponse> {
  http_client()
    .get(format!("{}/job/{app_id}.{task_id}", base_url()))
    .await
}

pub async fn post_job(
  request: &JobRequest,
) -> serror::Result<String> {
  http_client()
    .post(format!("{}/iso8601", base_url()), request)
    .await
}

pub async fn kill_tasks(
  app_id: &str,
  task_id: &str,
) -> serror::Result<String> {
  http_client()
    .delete(format!(
      "{}/task/kill/{app_id}.{task_id}",
      base_url()
    ))
    .await
}

pub async fn delete_job(
  app_id: &str,
  task_id: &str,
) -> serror::Result<String> {
  http_client()
    .delete(format!("{}/job/{app_id}.{task_id}", base_url()))
    .await
}

/// `POST /iso8601` body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
  pub name: String,
  pub schedule: String,
  pub shell: bool,
  pub retries: u32,
  pub cpus: f64,
  pub mem: f64,
  pub disk: f64,
  pub command: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub arguments: Option<Vec<String>>,
  pub environment_variables: Vec<EnvironmentVariable>,
  pub container: JobContainerRequest,
  pub constraints: Vec<[String; 3]>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentVariable {
  pub name: String,
  pub value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContainerRequest {
  #[serde(rename = "type")]
  pub container_type: String,
  pub image: String,
  pub network: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub network_name: Option<String>,
  pub volumes: Vec<VolumeRequest>,
  pub parameters: Vec<Parameter>,
  pub force_pull_image: bool,
}

/// Translate a job task into the backend request. Extra env pairs
/// carry the scheduler-computed data source variables.
pub fn job_request(
  app: &Appliance,
  contr: &Container,
  task: &Task,
  extra_env: &[(String, String)],
) -> JobRequest {
  let app_id = &app.id;
  let task_id = task.id(&contr.id);
  let job = contr.as_job().cloned().unwrap_or_default();

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
      key: "privileged".into(),
      value: contr.is_privileged.to_string(),
    },
  ];
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
  // the job backend publishes ports via docker, not the substrate
  for port in &contr.ports {
    parameters.push(Parameter {
      key: "publish".into(),
      value: format!(
        "{}:{}/{}",
        port.host_port, port.container_port, port.protocol
      ),
    });
  }

  let mut environment_variables = contr
    .env
    .iter()
    .map(|(name, value)| EnvironmentVariable {
      name: name.clone(),
      value: resolve_short_ids(value, app_id),
    })
    .collect::<Vec<_>>();
  environment_variables.extend(extra_env.iter().map(
    |(name, value)| EnvironmentVariable {
      name: name.clone(),
      value: value.clone(),
    },
  ));

  let mut request = JobRequest {
    name: format!("{app_id}.{task_id}"),
    schedule: format!(
      "R{}/{}/P{}",
      job.repeats, job.start_time, job.interval
    ),
    shell: contr.cmd.is_some(),
    retries: job.retries,
    cpus: contr.resources.cpus,
    mem: contr.resources.mem,
    disk: contr.resources.disk,
    command: contr
      .cmd
      .as_deref()
      .map(|cmd| resolve_short_ids(cmd, app_id))
      .unwrap_or_default(),
    arguments: (!contr.args.is_empty()).then(|| {
      contr
        .args
        .iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| resolve_short_ids(a, app_id))
        .collect()
    }),
    environment_variables,
    container: JobContainerRequest {
      container_type: "DOCKER".into(),
      image: contr.image.clone(),
      network: String::new(),
      network_name: None,
      volumes: contr
        .host_volumes()
        .map(|v| VolumeRequest {
          host_path: v.src.clone(),
          container_path: v.dest.clone(),
          mode: "RW".into(),
        })
        .collect(),
      parameters,
      force_pull_image: contr.force_pull_image,
    },
    constraints: Vec::new(),
  };

  match contr.network_mode {
    NetworkMode::Host | NetworkMode::Bridge => {
      request.container.network = match contr.network_mode {
        NetworkMode::Host => "HOST".into(),
        _ => "BRIDGE".into(),
      };
    }
    NetworkMode::Container => {
      request.container.network = "USER".into();
      request.container.network_name = Some("dcos".into());
    }
  }

  let hints = &task.schedule_hints;
  request.constraints.push([
    "preemptible".into(),
    "EQUALS".into(),
    hints.preemptible.to_string(),
  ]);
  if let Some((dimension, value)) = hints.placement.constraint() {
    request.constraints.push([
      dimension.into(),
      "EQUALS".into(),
      value.into(),
    ]);
  }
  request
}

#[cfg(test)]
mod tests {
  use super::*;
  use pivot_client::entities::{
    container::{ContainerSpec, JobConfig, Resources},
    schedule::{ContainerScheduleHints, Placement},
  };

  fn job_appliance() -> Appliance {
    Appliance {
      id: "one-job".into(),
      containers: vec![Container {
        id: "first-job".into(),
        appliance: "one-job".into(),
        image: "ubuntu".into(),
        resources: Resources {
          cpus: 1.0,
          mem: 1024.0,
          disk: 128.0,
          gpu: 0.0,
        },
        cmd: Some("sleep 10".into()),
        spec: ContainerSpec::Job(JobConfig {
          retries: 2,
          repeats: 3,
          start_time: "2018-04-01T17:22:00Z".into(),
          interval: "2M".into(),
        }),
        ..Default::default()
      }],
      ..Default::default()
    }
  }

  #[test]
  fn builds_job_request() {
    let app = job_appliance();
    let contr = &app.containers[0];
    let task = Task {
      seqno: 1,
      schedule_hints: ContainerScheduleHints {
        placement: Placement {
          cloud: Some("gcp".into()),
          ..Default::default()
        },
        preemptible: true,
      },
      ..Default::default()
    };
    let request = job_request(&app, contr, &task, &[]);
    assert_eq!(request.name, "one-job.first-job-1");
    assert_eq!(
      request.schedule,
      "R3/2018-04-01T17:22:00Z/P2M"
    );
    assert!(request.shell);
    assert_eq!(request.retries, 2);
    assert_eq!(request.container.network, "HOST");
    assert!(request.constraints.contains(&[
      "cloud".to_string(),
      "EQUALS".to_string(),
      "gcp".to_string()
    ]));
    assert!(request.constraints.contains(&[
      "preemptible".to_string(),
      "EQUALS".to_string(),
      "true".to_string()
    ]));
  }

  #[test]
  fn remaining_repeats_parses_schedule() {
    let mut response = JobResponse {
      schedule: "R2/2018-04-01T17:22:00Z/P2M".into(),
      ..Default::default()
    };
    assert_eq!(response.remaining_repeats(), 2);
    response.schedule = "R0//P2M".into();
    assert_eq!(response.remaining_repeats(), 0);
    response.schedule = "R//P2M".into();
    assert_eq!(response.remaining_repeats(), -1);
  }

  #[test]
  fn substrate_task_id_handles_null_literal() {
    let mut response = JobResponse {
      task_id: "null".into(),
      ..Default::default()
    };
    assert!(response.substrate_task_id().is_none());
    response.task_id = "ct:1:0:one-job.first-job-1:".into();
    assert!(response.substrate_task_id().is_some());
  }
}
