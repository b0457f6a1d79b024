//! Persistent volume backend adapter (the `/fs` service).

use pivot_client::entities::{
  schedule::Placement, volume::PersistentVolume,
};
use serde::{Deserialize, Serialize};

use crate::{config::core_config, state::http_client};

fn base_url() -> String {
  core_config().volume_backend.base_url()
}

/// `POST /fs` body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeRequest {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub placement: Option<PlacementRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacementRequest {
  #[serde(rename = "type")]
  pub dimension: String,
  pub value: String,
}

/// `GET /fs/<name>` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VolumeResponse {
  pub name: String,
  pub placement: Placement,
}

/// Translate a persistent volume into the backend request. The
/// placement preference rides on the scheduler-computed hints.
pub fn volume_request(vol: &PersistentVolume) -> VolumeRequest {
  VolumeRequest {
    name: vol.external_name(),
    placement: vol
      .sys_schedule_hints
      .placement
      .constraint()
      .map(|(dimension, value)| PlacementRequest {
        // the backend names the host dimension plainly
        dimension: match dimension {
          "hostname" => "host".to_string(),
          dimension => dimension.to_string(),
        },
        value: value.to_string(),
      }),
  }
}

pub async fn create_volume(
  request: &VolumeRequest,
) -> serror::Result<String> {
  http_client()
    .post(format!("{}/fs", base_url()), request)
    .await
}

pub async fn get_volume(
  external_name: &str,
) -> serror::Result<VolumeResponse> {
  http_client()
    .get(format!("{}/fs/{external_name}", base_url()))
    .await
}

pub async fn delete_volume(
  external_name: &str,
  purge: bool,
) -> serror::Result<String> {
  http_client()
    .delete(format!(
      "{}/fs/{external_name}?purge={purge}",
      base_url()
    ))
    .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use pivot_client::entities::{
    schedule::ScheduleHints, volume::VolumeScope,
  };

  #[test]
  fn request_carries_scheduled_placement() {
    let vol = PersistentVolume {
      id: "alpha".into(),
      appliance: "test-app".into(),
      scope: VolumeScope::Local,
      sys_schedule_hints: ScheduleHints {
        placement: Placement {
          region: Some("us-east-1".into()),
          ..Default::default()
        },
      },
      ..Default::default()
    };
    let request = volume_request(&vol);
    assert_eq!(request.name, "test-app-alpha");
    let placement = request.placement.unwrap();
    assert_eq!(placement.dimension, "region");
    assert_eq!(placement.value, "us-east-1");
  }
}
