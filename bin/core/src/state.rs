use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use pivot_client::entities::config::BackendApi;

use crate::{
  backends::http::HttpClient, cluster::ClusterMonitor,
  config::core_config, scheduler::global::GlobalScheduler,
};

static DB_CLIENT: OnceLock<database::Client> = OnceLock::new();

/// Initialize the db connection. Crashes on failure, as nothing
/// works without the store.
pub async fn init_db_client() {
  let client = database::Client::new(&core_config().database)
    .await
    .expect("failed to initialize database client");
  if DB_CLIENT.set(client).is_err() {
    panic!("db client initialized twice");
  }
}

pub fn db_client() -> &'static database::Client {
  DB_CLIENT.get().expect("db client not initialized")
}

/// Addresses of the execution substrate endpoints. Seeded from the
/// config and rewritten live by the cluster monitor when the
/// leading master moves.
#[derive(Debug, Clone)]
pub struct BackendAddrs {
  pub marathon: BackendApi,
  pub chronos: BackendApi,
  pub mesos: BackendApi,
  pub exhibitor: BackendApi,
}

pub fn backend_addrs() -> &'static ArcSwap<BackendAddrs> {
  static BACKEND_ADDRS: OnceLock<ArcSwap<BackendAddrs>> =
    OnceLock::new();
  BACKEND_ADDRS.get_or_init(|| {
    let config = core_config();
    let mut addrs = BackendAddrs {
      marathon: config.marathon.clone(),
      chronos: config.chronos.clone(),
      mesos: config.mesos.clone(),
      exhibitor: config.exhibitor.clone(),
    };
    // the configured master seeds every host left unset
    if !config.master.is_empty() {
      for api in [
        &mut addrs.marathon,
        &mut addrs.chronos,
        &mut addrs.mesos,
        &mut addrs.exhibitor,
      ] {
        if api.host.is_empty() {
          api.host = config.master.clone();
        }
      }
    }
    ArcSwap::from(Arc::new(addrs))
  })
}

pub fn http_client() -> &'static HttpClient {
  static HTTP_CLIENT: OnceLock<HttpClient> = OnceLock::new();
  HTTP_CLIENT.get_or_init(HttpClient::default)
}

pub fn cluster() -> &'static ClusterMonitor {
  static CLUSTER: OnceLock<ClusterMonitor> = OnceLock::new();
  CLUSTER.get_or_init(ClusterMonitor::default)
}

pub fn global_scheduler() -> &'static GlobalScheduler {
  static GLOBAL_SCHEDULER: OnceLock<GlobalScheduler> =
    OnceLock::new();
  GLOBAL_SCHEDULER.get_or_init(GlobalScheduler::default)
}
