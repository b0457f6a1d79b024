use anyhow::anyhow;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use strum::Display;
use typeshare::typeshare;

use crate::entities::{
  schedule::{Placement, ScheduleHints},
  valid_id,
};

/// Persistent volume scope. LOCAL volumes are namespaced by the
/// owning appliance on the volume backend; GLOBAL volumes are
/// cluster-wide and reference counted.
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
)]
pub enum VolumeScope {
  #[serde(rename = "GLOBAL", alias = "global")]
  Global,
  #[default]
  #[serde(rename = "LOCAL", alias = "local")]
  Local,
}

/// Lifecycle state of a persistent volume on the volume backend.
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
pub enum VolumeState {
  /// Declared but never provisioned.
  #[default]
  Created,
  /// Provisioned at some point, currently detached.
  Inactive,
  /// Provisioned and mountable.
  Active,
}

/// Backing filesystem for persistent volumes. The value doubles as
/// the docker volume driver name at launch time.
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
pub enum PersistentVolumeType {
  #[default]
  Cephfs,
}

impl PersistentVolumeType {
  pub fn driver(&self) -> &'static str {
    match self {
      PersistentVolumeType::Cephfs => "heliumdatacommons/cephfs",
    }
  }
}

/// Where the backend reports the volume landed.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct VolumeDeployment {
  #[serde(default)]
  pub placement: Placement,
}

/// Distributed persistent volume shared among containers.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct PersistentVolume {
  pub id: String,
  /// Owning appliance for LOCAL volumes; empty for GLOBAL ones.
  #[serde(default)]
  pub appliance: String,
  #[serde(default, rename = "type")]
  pub volume_type: PersistentVolumeType,
  #[serde(default)]
  pub scope: VolumeScope,
  #[serde(default)]
  pub state: VolumeState,
  /// Appliance ids currently subscribed to a GLOBAL volume.
  /// The volume cannot be purged while non-empty.
  #[serde(default)]
  pub used_by: IndexSet<String>,
  /// User-supplied placement preferences.
  #[serde(default, rename = "schedule_hints")]
  pub user_schedule_hints: ScheduleHints,
  /// Scheduler-computed placement, read-only to users.
  #[serde(default)]
  pub sys_schedule_hints: ScheduleHints,
  /// Read-only, written on reconciliation with the backend.
  #[serde(default)]
  pub deployment: VolumeDeployment,
}

impl PersistentVolume {
  /// Name of the volume on the volume backend. LOCAL volumes are
  /// qualified by the owning appliance.
  pub fn external_name(&self) -> String {
    match self.scope {
      VolumeScope::Local => {
        format!("{}-{}", self.appliance, self.id)
      }
      VolumeScope::Global => self.id.clone(),
    }
  }

  pub fn is_active(&self) -> bool {
    self.state == VolumeState::Active
  }

  pub fn subscribe(&mut self, app_id: &str) {
    self.used_by.insert(app_id.to_string());
  }

  pub fn unsubscribe(&mut self, app_id: &str) {
    self.used_by.shift_remove(app_id);
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if !valid_id(&self.id) {
      return Err(anyhow!(
        "Volume id '{}' must match {}",
        self.id,
        crate::entities::ID_PATTERN
      ));
    }
    Ok(())
  }
}

/// Data persistence abstraction of an appliance: a set of volumes
/// sharing one volume type.
#[typeshare]
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct DataPersistence {
  #[serde(default)]
  pub volume_type: PersistentVolumeType,
  #[serde(default)]
  pub volumes: Vec<PersistentVolume>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn external_name_namespaces_local_volumes() {
    let mut volume = PersistentVolume {
      id: "alpha".into(),
      appliance: "test-app".into(),
      ..Default::default()
    };
    assert_eq!(volume.external_name(), "test-app-alpha");
    volume.scope = VolumeScope::Global;
    assert_eq!(volume.external_name(), "alpha");
  }

  #[test]
  fn subscription_round_trip() {
    let mut volume = PersistentVolume {
      id: "shared".into(),
      scope: VolumeScope::Global,
      ..Default::default()
    };
    volume.subscribe("a");
    volume.subscribe("b");
    volume.subscribe("a");
    assert_eq!(volume.used_by.len(), 2);
    volume.unsubscribe("a");
    assert_eq!(
      volume.used_by.iter().collect::<Vec<_>>(),
      vec!["b"]
    );
  }
}
