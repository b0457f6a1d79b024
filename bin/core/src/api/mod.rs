//! The operational HTTP surface over the managers. Error status
//! codes come straight from the manager results.

use axum::{
  Json, Router,
  extract::{Path, Query},
  http::StatusCode,
  routing::get,
};
use pivot_client::entities::{
  agent::Agent, appliance::Appliance, container::Container,
  volume::PersistentVolume,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
  config::core_config,
  manager::{appliance, container, volume},
  state::cluster,
};

pub fn router() -> Router {
  Router::new()
    .route("/ping", get(ping))
    .route(
      "/appliance",
      get(list_appliances).post(create_appliance),
    )
    .route(
      "/appliance/{app_id}",
      get(get_appliance).delete(delete_appliance),
    )
    .route(
      "/appliance/{app_id}/container",
      get(list_containers),
    )
    .route(
      "/appliance/{app_id}/container/{contr_id}",
      get(get_container).delete(delete_container),
    )
    .route(
      "/appliance/{app_id}/volume/{vol_id}",
      get(get_local_volume).delete(purge_local_volume),
    )
    .route("/volume", get(list_global_volumes))
    .route(
      "/volume/{vol_id}",
      get(get_global_volume).delete(purge_global_volume),
    )
    .route("/cluster", get(get_cluster))
}

async fn ping() -> &'static str {
  "pong"
}

async fn list_appliances()
-> serror::Result<Json<Vec<Appliance>>> {
  Ok(Json(appliance::list_appliances().await?))
}

async fn create_appliance(
  Json(body): Json<Value>,
) -> serror::Result<(StatusCode, Json<Appliance>)> {
  let app = appliance::create_appliance(body).await?;
  Ok((StatusCode::CREATED, Json(app)))
}

async fn get_appliance(
  Path(app_id): Path<String>,
) -> serror::Result<Json<Appliance>> {
  Ok(Json(appliance::get_appliance(&app_id).await?))
}

#[derive(Deserialize)]
struct DeleteApplianceQuery {
  #[serde(default)]
  purge_data: bool,
}

async fn delete_appliance(
  Path(app_id): Path<String>,
  Query(query): Query<DeleteApplianceQuery>,
) -> serror::Result<Json<Value>> {
  let message =
    appliance::delete_appliance(&app_id, query.purge_data)
      .await?;
  Ok(Json(json!({ "message": message })))
}

async fn list_containers(
  Path(app_id): Path<String>,
) -> serror::Result<Json<Vec<Container>>> {
  Ok(Json(container::get_containers(&app_id).await?))
}

async fn get_container(
  Path((app_id, contr_id)): Path<(String, String)>,
) -> serror::Result<Json<Container>> {
  // ttl 0: an API read always reflects the backends
  Ok(Json(
    container::get_container_fresh(&app_id, &contr_id, 0)
      .await?,
  ))
}

async fn delete_container(
  Path((app_id, contr_id)): Path<(String, String)>,
) -> serror::Result<Json<Value>> {
  let contr =
    container::get_container(&app_id, &contr_id).await?;
  container::delete_container(&contr).await?;
  Ok(Json(json!({
    "message":
      format!("Container '{contr_id}' is being deleted")
  })))
}

async fn get_local_volume(
  Path((app_id, vol_id)): Path<(String, String)>,
) -> serror::Result<Json<PersistentVolume>> {
  let vol = volume::get_local_volume(&app_id, &vol_id).await?;
  Ok(Json(volume::read_deployment(vol).await))
}

async fn purge_local_volume(
  Path((app_id, vol_id)): Path<(String, String)>,
) -> serror::Result<Json<Value>> {
  let message =
    volume::purge_local_volume(&app_id, &vol_id).await?;
  Ok(Json(json!({ "message": message })))
}

async fn list_global_volumes()
-> serror::Result<Json<Vec<PersistentVolume>>> {
  Ok(Json(volume::get_global_volumes().await?))
}

async fn get_global_volume(
  Path(vol_id): Path<String>,
) -> serror::Result<Json<PersistentVolume>> {
  let vol = volume::get_global_volume(&vol_id).await?;
  Ok(Json(volume::read_deployment(vol).await))
}

async fn purge_global_volume(
  Path(vol_id): Path<String>,
) -> serror::Result<Json<Value>> {
  let message = volume::purge_global_volume(&vol_id).await?;
  Ok(Json(json!({ "message": message })))
}

async fn get_cluster() -> Json<Vec<Agent>> {
  Json(
    cluster()
      .get_agents(core_config().agent_ttl_secs)
      .await,
  )
}
