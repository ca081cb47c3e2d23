#![allow(dead_code)]

use anyhow::Result;
use rillflow_identity::{ConnectionMode, StoreOptions};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

pub struct Postgres {
    // Dropping the container stops it.
    _container: ContainerAsync<GenericImage>,
    pub url: String,
}

pub async fn start_postgres() -> Result<Postgres> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres@{host}:{port}/postgres?sslmode=disable");
    Ok(Postgres {
        _container: container,
        url,
    })
}

impl Postgres {
    pub fn options(&self, container: &str) -> Result<StoreOptions> {
        self.options_with_mode(container, ConnectionMode::Gateway)
    }

    pub fn options_with_mode(&self, container: &str, mode: ConnectionMode) -> Result<StoreOptions> {
        Ok(StoreOptions::builder(&self.url)
            .auth_key("postgres")
            .database("identity")
            .container(container)
            .connection_mode(mode)
            .max_connections(4)
            .build()?)
    }
}
