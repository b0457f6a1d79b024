use std::{path::PathBuf, sync::OnceLock};

use colored::Colorize;
use config::ConfigLoader;
use pivot_client::entities::config::{CoreConfig, Env};

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = match envy::from_env() {
      Ok(env) => env,
      Err(e) => {
        panic!("Failed to parse Pivot Core environment | {e:?}");
      }
    };
    let config = if env.pivot_config_paths.is_empty() {
      println!(
        "{}: No config paths found, using default config",
        "INFO".green(),
      );
      CoreConfig::default()
    } else {
      let config_keywords = env
        .pivot_config_keywords
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>();
      (ConfigLoader {
        paths: &env
          .pivot_config_paths
          .iter()
          .map(PathBuf::as_path)
          .collect::<Vec<_>>(),
        match_wildcards: &config_keywords,
        debug_print: env.pivot_config_debug,
      })
      .load::<CoreConfig>()
      .expect("Failed at parsing config from paths")
    };

    let mut config = CoreConfig {
      host: env.pivot_host.unwrap_or(config.host),
      port: env.pivot_port.unwrap_or(config.port),
      master: env.pivot_master.unwrap_or(config.master),
      scheduler: env.pivot_scheduler.unwrap_or(config.scheduler),
      ..config
    };
    if let Some(uri) = env.pivot_database_uri {
      config.database.uri = uri;
    }
    if let Some(address) = env.pivot_database_address {
      config.database.address = address;
    }
    if let Some(username) = env.pivot_database_username {
      config.database.username = username;
    }
    if let Some(password) = env.pivot_database_password {
      config.database.password = password;
    }
    if let Some(db_name) = env.pivot_database_db_name {
      config.database.db_name = db_name;
    }
    config
  })
}
