use std::collections::HashSet;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::{
  entities::{
    container::{Container, ContainerVolumeType},
    valid_id,
    volume::{DataPersistence, VolumeScope},
  },
  parsers::short_ids,
};

/// Selects the per-appliance scheduler policy from the registry.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSpec {
  #[serde(default = "default_scheduler_name")]
  pub name: String,
  /// Policy specific options, passed through opaquely.
  #[serde(default)]
  pub config: serde_json::Value,
}

impl Default for SchedulerSpec {
  fn default() -> Self {
    SchedulerSpec {
      name: default_scheduler_name(),
      config: serde_json::Value::Null,
    }
  }
}

fn default_scheduler_name() -> String {
  String::from("dag")
}

/// A user-submitted bundle of containers with dependencies and
/// shared persistent volumes.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct Appliance {
  pub id: String,
  #[serde(default)]
  pub containers: Vec<Container>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data_persistence: Option<DataPersistence>,
  #[serde(default)]
  pub scheduler: SchedulerSpec,
}

impl Appliance {
  pub fn volumes(
    &self,
  ) -> &[crate::entities::volume::PersistentVolume] {
    self
      .data_persistence
      .as_ref()
      .map(|dp| dp.volumes.as_slice())
      .unwrap_or_default()
  }

  pub fn container(&self, id: &str) -> Option<&Container> {
    self.containers.iter().find(|c| c.id == id)
  }

  /// Parse an appliance out of a user request body and run every
  /// structural invariant that does not need backend state.
  /// Dependency cycle detection happens when the container DAG is
  /// constructed, not here.
  pub fn parse(value: serde_json::Value) -> anyhow::Result<Self> {
    let mut appliance: Appliance =
      serde_json::from_value(value)
        .context("Failed to parse appliance")?;
    // ids of owned entities are qualified server side
    for container in &mut appliance.containers {
      container.appliance = appliance.id.clone();
    }
    if let Some(data_persistence) =
      &mut appliance.data_persistence
    {
      for volume in &mut data_persistence.volumes {
        volume.volume_type = data_persistence.volume_type;
        if volume.scope == VolumeScope::Local {
          volume.appliance = appliance.id.clone();
        }
      }
    }
    appliance.validate()?;
    Ok(appliance)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if !valid_id(&self.id) {
      return Err(anyhow!(
        "Appliance id '{}' must match {}",
        self.id,
        crate::entities::ID_PATTERN
      ));
    }
    if self.containers.is_empty() {
      return Err(anyhow!(
        "Appliance '{}' has no containers",
        self.id
      ));
    }
    let mut container_ids = HashSet::new();
    for container in &self.containers {
      container.validate()?;
      if !container_ids.insert(container.id.as_str()) {
        return Err(anyhow!(
          "Duplicate container id: {}",
          container.id
        ));
      }
    }
    self.validate_short_references(&container_ids)?;
    self.validate_volume_mounts()?;
    let mut volume_ids = HashSet::new();
    for volume in self.volumes() {
      volume.validate()?;
      if !volume_ids.insert(volume.id.as_str()) {
        return Err(anyhow!("Duplicate volume id: {}", volume.id));
      }
    }
    Ok(())
  }

  /// Every `@<id>` short reference in any cmd/args/env value must
  /// name a container of this appliance.
  fn validate_short_references(
    &self,
    container_ids: &HashSet<&str>,
  ) -> anyhow::Result<()> {
    let mut addresses = HashSet::new();
    for container in &self.containers {
      if let Some(cmd) = &container.cmd {
        addresses.extend(short_ids(cmd));
      }
      for arg in &container.args {
        addresses.extend(short_ids(arg));
      }
      for value in container.env.values() {
        addresses.extend(short_ids(value));
      }
    }
    let undefined = addresses
      .iter()
      .filter(|a| !container_ids.contains(a.as_str()))
      .collect::<Vec<_>>();
    if !undefined.is_empty() {
      return Err(anyhow!(
        "Undefined container(s): {undefined:?}"
      ));
    }
    Ok(())
  }

  /// Every LOCAL persistent mount must be declared in the
  /// appliance's data persistence block. GLOBAL mounts may refer
  /// to volumes that already exist cluster-wide.
  fn validate_volume_mounts(&self) -> anyhow::Result<()> {
    let declared = self
      .volumes()
      .iter()
      .map(|v| v.id.as_str())
      .collect::<HashSet<_>>();
    for container in &self.containers {
      for mount in container.volumes.iter().filter(|v| {
        v.volume_type == ContainerVolumeType::Persistent
          && v.scope == VolumeScope::Local
      }) {
        if !declared.contains(mount.src.as_str()) {
          return Err(anyhow!(
            "Volume '{}' mounted by container '{}' is not declared",
            mount.src,
            container.id
          ));
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn base_request() -> serde_json::Value {
    json!({
      "id": "test-app",
      "containers": [
        {
          "id": "first-job",
          "type": "job",
          "image": "ubuntu",
          "resources": {"cpus": 1, "mem": 1024, "disk": 128},
        },
        {
          "id": "second-job",
          "type": "job",
          "image": "ubuntu",
          "resources": {"cpus": 1, "mem": 1024},
          "dependencies": ["first-job"],
        },
      ],
    })
  }

  #[test]
  fn parses_and_qualifies_owned_entities() {
    let appliance = Appliance::parse(base_request()).unwrap();
    assert_eq!(appliance.containers.len(), 2);
    assert!(
      appliance
        .containers
        .iter()
        .all(|c| c.appliance == "test-app")
    );
    assert_eq!(appliance.scheduler.name, "dag");
  }

  #[test]
  fn serialize_parse_round_trip() {
    let appliance = Appliance::parse(base_request()).unwrap();
    let encoded = serde_json::to_value(&appliance).unwrap();
    let decoded = Appliance::parse(encoded).unwrap();
    assert_eq!(decoded, appliance);
  }

  #[test]
  fn rejects_duplicate_container_ids() {
    let mut request = base_request();
    request["containers"][1]["id"] = json!("first-job");
    request["containers"][1]["dependencies"] = json!([]);
    let err = Appliance::parse(request).unwrap_err();
    assert!(err.to_string().contains("Duplicate container id"));
  }

  #[test]
  fn rejects_undefined_short_references() {
    let mut request = base_request();
    request["containers"][0]["cmd"] =
      json!("curl http://@missing:8080/ping");
    let err = Appliance::parse(request).unwrap_err();
    assert!(err.to_string().contains("Undefined container"));
  }

  #[test]
  fn accepts_resolvable_short_references() {
    let mut request = base_request();
    request["containers"][1]["env"] =
      json!({"UPSTREAM": "@first-job"});
    assert!(Appliance::parse(request).is_ok());
  }

  #[test]
  fn rejects_undeclared_local_volume_mounts() {
    let mut request = base_request();
    request["containers"][0]["volumes"] = json!([
      {"src": "alpha", "dest": "/mnt/data"}
    ]);
    let err = Appliance::parse(request).unwrap_err();
    assert!(err.to_string().contains("not declared"));

    let mut request = base_request();
    request["containers"][0]["volumes"] = json!([
      {"src": "alpha", "dest": "/mnt/data"}
    ]);
    request["data_persistence"] =
      json!({"volumes": [{"id": "alpha"}]});
    let appliance = Appliance::parse(request).unwrap();
    assert_eq!(appliance.volumes()[0].appliance, "test-app");
  }
}
