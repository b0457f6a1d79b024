//! Object registry adapter, consulted by the location aware
//! policy for input data replica locations.

use serde::Deserialize;

use crate::{config::core_config, state::http_client};

fn base_url() -> String {
  core_config().object_registry.base_url()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataObject {
  pub path: String,
  pub size: u64,
  pub replicas: Vec<Replica>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Replica {
  pub resource_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceMetadata {
  pub name: String,
  pub region: String,
}

pub async fn get_data_objects(
  filenames: impl Iterator<Item = &str>,
) -> serror::Result<Vec<DataObject>> {
  let filenames = urlencode_join(filenames);
  http_client()
    .get(format!(
      "{}/getDataObjects?filenames={filenames}",
      base_url()
    ))
    .await
}

pub async fn get_resources_metadata(
  resource_names: impl Iterator<Item = &str>,
) -> serror::Result<Vec<ResourceMetadata>> {
  let resource_names = urlencode_join(resource_names);
  http_client()
    .get(format!(
      "{}/getResourcesMetadata?resource_names={resource_names}",
      base_url()
    ))
    .await
}

/// Join as a comma separated list, percent-encoding the few
/// characters object paths may carry.
fn urlencode_join<'a>(items: impl Iterator<Item = &'a str>) -> String {
  items
    .map(|item| {
      item
        .replace('%', "%25")
        .replace('/', "%2F")
        .replace('&', "%26")
        .replace('?', "%3F")
        .replace(' ', "%20")
        .replace('#', "%23")
        .replace('+', "%2B")
    })
    .collect::<Vec<_>>()
    .join(",")
}
