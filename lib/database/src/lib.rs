use anyhow::{Context, anyhow};
use mongo_indexed::{create_index, create_unique_index};
use mungos::{
  init::MongoBuilder,
  mongodb::{Collection, Database},
};
use pivot_client::entities::{
  agent::{Agent, Master},
  appliance::Appliance,
  config::DatabaseConfig,
  container::Container,
  volume::PersistentVolume,
};

pub use mongo_indexed;
pub use mungos;

/// Typed handles on the PIVOT collections. Documents are keyed by
/// their natural ids (`id`, plus `appliance` for owned entities),
/// matching the filters the managers use.
#[derive(Debug)]
pub struct Client {
  pub appliances: Collection<Appliance>,
  pub containers: Collection<Container>,
  pub volumes: Collection<PersistentVolume>,
  pub agents: Collection<Agent>,
  pub masters: Collection<Master>,
  //
  pub db: Database,
}

impl Client {
  pub async fn new(
    config: &DatabaseConfig,
  ) -> anyhow::Result<Client> {
    let db = init(config).await?;

    let appliances = db.collection::<Appliance>("appliance");
    create_unique_index(&appliances, "id").await?;

    let containers = db.collection::<Container>("container");
    create_index(&containers, "id").await?;
    create_index(&containers, "appliance").await?;

    let volumes = db.collection::<PersistentVolume>("volume");
    create_index(&volumes, "id").await?;
    create_index(&volumes, "appliance").await?;
    create_index(&volumes, "scope").await?;

    let agents = db.collection::<Agent>("agent");
    create_unique_index(&agents, "id").await?;

    let masters = db.collection::<Master>("master");
    create_unique_index(&masters, "hostname").await?;

    Ok(Client {
      appliances,
      containers,
      volumes,
      agents,
      masters,
      db,
    })
  }
}

/// Initializes an unindexed database handle.
pub async fn init(
  DatabaseConfig {
    uri,
    address,
    username,
    password,
    app_name,
    db_name,
  }: &DatabaseConfig,
) -> anyhow::Result<Database> {
  let mut client = MongoBuilder::default().app_name(app_name);

  match (
    !uri.is_empty(),
    !address.is_empty(),
    !username.is_empty(),
    !password.is_empty(),
  ) {
    (true, _, _, _) => {
      client = client.uri(uri);
    }
    (_, true, true, true) => {
      client = client
        .address(address)
        .username(username)
        .password(password);
    }
    (_, true, _, _) => {
      client = client.address(address);
    }
    _ => {
      return Err(anyhow!(
        "'config.database' not configured correctly. must pass either 'config.database.uri', or 'config.database.address' (+ optional username / password)"
      ));
    }
  }

  let client = client
    .build()
    .await
    .context("Failed to initialize database connection.")?;

  Ok(client.database(db_name))
}
