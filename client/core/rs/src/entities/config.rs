use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::entities::logger::LogConfig;

/// Environment overrides, parsed before the config files are read.
/// `PIVOT_CONFIG_PATHS` selects the files; the remaining variables
/// override individual fields of [CoreConfig].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Env {
  #[serde(default)]
  pub pivot_config_paths: Vec<PathBuf>,
  #[serde(default)]
  pub pivot_config_keywords: Vec<String>,
  #[serde(default)]
  pub pivot_config_debug: bool,

  pub pivot_host: Option<String>,
  pub pivot_port: Option<u16>,
  pub pivot_master: Option<String>,
  pub pivot_scheduler: Option<String>,
  pub pivot_database_uri: Option<String>,
  pub pivot_database_address: Option<String>,
  pub pivot_database_username: Option<String>,
  pub pivot_database_password: Option<String>,
  pub pivot_database_db_name: Option<String>,
}

/// One REST backend endpoint block: `<host>:<port><endpoint>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendApi {
  #[serde(default)]
  pub host: String,
  pub port: u16,
  #[serde(default)]
  pub endpoint: String,
}

impl BackendApi {
  pub fn new(port: u16, endpoint: &str) -> BackendApi {
    BackendApi {
      host: String::new(),
      port,
      endpoint: endpoint.to_string(),
    }
  }

  pub fn base_url(&self) -> String {
    format!("http://{}:{}{}", self.host, self.port, self.endpoint)
  }
}

pub fn default_service_api() -> BackendApi {
  BackendApi::new(8080, "/v2")
}
pub fn default_job_api() -> BackendApi {
  BackendApi::new(9090, "/v1/scheduler")
}
pub fn default_mesos_api() -> BackendApi {
  BackendApi::new(5050, "")
}
pub fn default_exhibitor_api() -> BackendApi {
  BackendApi::new(8181, "/exhibitor/v1")
}
pub fn default_volume_api() -> BackendApi {
  BackendApi::new(9192, "")
}
pub fn default_object_registry_api() -> BackendApi {
  BackendApi::new(8060, "/v1")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
  /// Full connection uri. Takes precedence over the address /
  /// username / password triple.
  #[serde(default)]
  pub uri: String,
  #[serde(default = "default_database_address")]
  pub address: String,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub password: String,
  #[serde(default = "default_database_app_name")]
  pub app_name: String,
  #[serde(default = "default_database_db_name")]
  pub db_name: String,
}

impl Default for DatabaseConfig {
  fn default() -> Self {
    DatabaseConfig {
      uri: String::new(),
      address: default_database_address(),
      username: String::new(),
      password: String::new(),
      app_name: default_database_app_name(),
      db_name: default_database_db_name(),
    }
  }
}

fn default_database_address() -> String {
  String::from("localhost:27017")
}
fn default_database_app_name() -> String {
  String::from("pivot_core")
}
fn default_database_db_name() -> String {
  String::from("pivot")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Ip the http server binds to.
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,

  #[serde(default)]
  pub ssl_enabled: bool,
  #[serde(default)]
  pub ssl_cert_file: PathBuf,
  #[serde(default)]
  pub ssl_key_file: PathBuf,

  /// Maximum concurrent backend launches per global scheduler
  /// tick.
  #[serde(default = "default_n_parallel")]
  pub n_parallel: u32,

  /// Global scheduler policy registry key. Empty selects the
  /// passthrough policy that defers placement to the substrate.
  #[serde(default)]
  pub scheduler: String,

  /// Seed master host for the cluster monitor.
  #[serde(default)]
  pub master: String,

  #[serde(default)]
  pub database: DatabaseConfig,

  /// Service backend (Marathon-shaped).
  #[serde(default = "default_service_api")]
  pub marathon: BackendApi,
  /// Job backend (Chronos-shaped).
  #[serde(default = "default_job_api")]
  pub chronos: BackendApi,
  /// Mesos master.
  #[serde(default = "default_mesos_api")]
  pub mesos: BackendApi,
  /// Exhibitor, for leader discovery.
  #[serde(default = "default_exhibitor_api")]
  pub exhibitor: BackendApi,
  /// Persistent volume backend (the `/fs` service).
  #[serde(default = "default_volume_api")]
  pub volume_backend: BackendApi,
  /// Object registry consulted by the location aware policy.
  #[serde(default = "default_object_registry_api")]
  pub object_registry: BackendApi,

  /// Locality table for the cost aware policy. Empty disables it.
  #[serde(default)]
  pub locality_file: PathBuf,
  /// Allow the location aware policy to fall back to nearby
  /// regions when the data region is out of capacity.
  #[serde(default)]
  pub location_aware_scale: bool,

  #[serde(default = "default_cluster_poll_interval_secs")]
  pub cluster_poll_interval_secs: u64,
  #[serde(default = "default_schedule_interval_secs")]
  pub schedule_interval_secs: u64,
  #[serde(default = "default_agent_ttl_secs")]
  pub agent_ttl_secs: u64,

  #[serde(default)]
  pub logging: LogConfig,
}

fn default_host() -> String {
  String::from("0.0.0.0")
}
fn default_port() -> u16 {
  9090
}
fn default_n_parallel() -> u32 {
  1
}
fn default_cluster_poll_interval_secs() -> u64 {
  30
}
fn default_schedule_interval_secs() -> u64 {
  3
}
fn default_agent_ttl_secs() -> u64 {
  30
}

impl Default for CoreConfig {
  fn default() -> Self {
    CoreConfig {
      host: default_host(),
      port: default_port(),
      ssl_enabled: false,
      ssl_cert_file: PathBuf::new(),
      ssl_key_file: PathBuf::new(),
      n_parallel: default_n_parallel(),
      scheduler: String::new(),
      master: String::new(),
      database: Default::default(),
      marathon: default_service_api(),
      chronos: default_job_api(),
      mesos: default_mesos_api(),
      exhibitor: default_exhibitor_api(),
      volume_backend: default_volume_api(),
      object_registry: default_object_registry_api(),
      locality_file: PathBuf::new(),
      location_aware_scale: false,
      cluster_poll_interval_secs:
        default_cluster_poll_interval_secs(),
      schedule_interval_secs: default_schedule_interval_secs(),
      agent_ttl_secs: default_agent_ttl_secs(),
      logging: Default::default(),
    }
  }
}

impl CoreConfig {
  /// Safe to print on startup.
  pub fn sanitized(&self) -> CoreConfig {
    let mut config = self.clone();
    if !config.database.uri.is_empty() {
      config.database.uri = String::from("***");
    }
    if !config.database.password.is_empty() {
      config.database.password = String::from("***");
    }
    config
  }
}
