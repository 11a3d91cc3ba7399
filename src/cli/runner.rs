//! Wires configuration, clients and the controller into a serving process

use crate::cli::args::ServeArgs;
use crate::config::{CoreConfig, FileConfigSource};
use crate::controller::api::create_router;
use crate::controller::{Controller, ControllerSettings, ReplicationPolicy, ReplicationTarget};
use crate::error::{Result, ResultExt};
use crate::registry::Transports;
use crate::replication::ClientFactory;
use crate::scheduler::Markers;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Targets and policies known before any admin service talks to us
#[derive(Debug, Default, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub targets: Vec<ReplicationTarget>,
    #[serde(default)]
    pub policies: Vec<ReplicationPolicy>,
}

impl PolicyFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

pub struct Runner {
    args: ServeArgs,
}

impl Runner {
    pub fn new(args: ServeArgs) -> Self {
        Self { args }
    }

    pub async fn run(&self) -> Result<()> {
        let config = CoreConfig::load(&FileConfigSource::new(self.args.config.clone()))
            .await
            .context("loading configuration")?;
        let controller = self.build_controller(&config)?;

        if let Some(path) = &self.args.policies {
            let file = PolicyFile::load(path).await?;
            info!(targets = file.targets.len(), policies = file.policies.len(), "registering policies");
            for target in file.targets {
                controller.register_target(target).await?;
            }
            for policy in file.policies {
                controller.register_policy(policy).await?;
            }
        }

        let router = create_router(controller.clone(), controller.settings().source.secret.clone());
        let scheduler = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run_scheduler().await }
        });

        let listener = TcpListener::bind(self.args.listen)
            .await
            .with_context(|| format!("binding {}", self.args.listen))?;
        info!(listen = %self.args.listen, registry = %controller.settings().source.registry_url, "job API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        controller.shutdown();
        let _ = scheduler.await;
        info!("stopped");
        Ok(())
    }

    fn build_controller(&self, config: &CoreConfig) -> Result<Controller> {
        let settings = ControllerSettings::from_config(config)?;

        let mut factory = ClientFactory::new(Transports::new()?);
        if let Some(url) = config.token_service_url.as_deref().filter(|url| !url.is_empty()) {
            factory = factory.with_token_service(url);
        }

        Ok(Controller::builder(settings, Arc::new(factory))
            .markers(Arc::new(Markers::default()))
            .build())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
