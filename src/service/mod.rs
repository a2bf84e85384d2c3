// src/service/mod.rs

//! Wires the subsystems together from a `HostConfig` and serves tenant
//! mutations through a command channel.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::applier::{Applier, ApplyResult};
use crate::config::{ConfigError, ConfigValidator, HostConfig};
use crate::error::CoreError;
use crate::events::{EventLog, EventPruner};
use crate::generator::Generator;
use crate::host::{HostOps, LinuxHost};
use crate::model::{DesiredState, Site};
use crate::rebuild::Rebuilder;
use crate::render::Renderer;
use crate::scanner::Scanner;
use crate::store::{Layout, Store};

/// Tenant mutation routed through the service loop
#[derive(Debug)]
pub enum ServiceCommand {
    /// Reconcile a tenant to a desired state
    Apply(u32, DesiredState, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Create or update a site
    ApplySite(u32, Site, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Remove a site and its generated configs
    DeleteSite(u32, String, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Suspend with a reason
    Suspend(u32, String, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Lift a suspension
    Unsuspend(u32, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Lock a tenant for good
    Terminate(u32, String, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Remove a tenant entirely
    Delete(u32, String, oneshot::Sender<Result<ApplyResult, ServiceError>>),

    /// Stop the loop and the background tasks
    Shutdown(oneshot::Sender<Result<(), ServiceError>>),
}

/// Everything built from one `HostConfig`
#[derive(Debug, Clone)]
pub struct Components {
    pub store: Arc<Store>,
    pub events: Arc<EventLog>,
    pub applier: Arc<Applier>,
    pub scanner: Scanner,
    pub rebuilder: Arc<Rebuilder>,
    pub generator: Arc<Generator>,
}

impl Components {
    /// Validates `config` and builds every subsystem on top of `host`
    pub fn build(config: &HostConfig, host: Arc<dyn HostOps>) -> Result<Self, ServiceError> {
        ConfigValidator::new().validate(config)?;

        let layout = Layout::new(config.paths.clone());
        let store = Arc::new(Store::new(layout.clone()));
        let events = Arc::new(EventLog::new(
            layout.events_root(),
            layout.alerts_root(),
            config.node_id.clone(),
        ));
        let renderer = Arc::new(Renderer::new(layout)?);
        let scanner = Scanner::new(store.clone());

        let applier = Arc::new(Applier::new(
            store.clone(),
            events.clone(),
            host.clone(),
            renderer.clone(),
            config.php.versions.clone(),
            config.node_id.clone(),
        ));
        let rebuilder = Arc::new(Rebuilder::new(scanner.clone(), events.clone()));
        let generator = Arc::new(Generator::new(
            scanner.clone(),
            host,
            renderer,
            events.clone(),
            config.php.versions.clone(),
        ));

        Ok(Self {
            store,
            events,
            applier,
            scanner,
            rebuilder,
            generator,
        })
    }
}

/// Handle to the running service
pub struct Service {
    /// Service command channel
    command_tx: mpsc::Sender<ServiceCommand>,

    /// Subsystems shared with the loop
    components: Components,
}

/// The loop behind `Service`
struct ServiceImpl {
    applier: Arc<Applier>,
    token: CancellationToken,
    pruner: Option<JoinHandle<()>>,
    command_rx: mpsc::Receiver<ServiceCommand>,
}

impl Service {
    /// Builds the service against the real host and starts it
    pub async fn new(config: HostConfig) -> Result<Self, ServiceError> {
        let host = Arc::new(LinuxHost::new(Duration::from_secs(config.exec.timeout_secs)));
        Self::with_host(config, host).await
    }

    /// Builds the service on top of an arbitrary host implementation
    pub async fn with_host(config: HostConfig, host: Arc<dyn HostOps>) -> Result<Self, ServiceError> {
        let components = Components::build(&config, host)?;
        let (command_tx, command_rx) = mpsc::channel(1000);

        let token = CancellationToken::new();
        let pruner = EventPruner::new(
            components.events.clone(),
            config.events.retention_days,
            Duration::from_secs(config.events.prune_interval_hours * 3600),
        )
        .spawn(token.child_token());

        let service_impl = ServiceImpl {
            applier: components.applier.clone(),
            token,
            pruner: Some(pruner),
            command_rx,
        };
        tokio::spawn(service_impl.run());

        info!(node_id = %config.node_id, "Service started");
        Ok(Self { command_tx, components })
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn scanner(&self) -> &Scanner {
        &self.components.scanner
    }

    pub fn rebuilder(&self) -> &Rebuilder {
        &self.components.rebuilder
    }

    pub fn generator(&self) -> &Generator {
        &self.components.generator
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> ServiceCommand,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();

        self.command_tx.send(build(tx)).await
            .map_err(|_| ServiceError::ChannelClosed)?;

        rx.await.map_err(|_| ServiceError::ResponseChannelClosed)?
    }

    /// Reconciles a tenant to `desired`
    pub async fn apply(&self, tenant_id: u32, desired: DesiredState, actor: &str) -> Result<ApplyResult, ServiceError> {
        let actor = actor.to_string();
        self.request(|tx| ServiceCommand::Apply(tenant_id, desired, actor, tx)).await
    }

    pub async fn apply_site(&self, tenant_id: u32, site: Site, actor: &str) -> Result<ApplyResult, ServiceError> {
        let actor = actor.to_string();
        self.request(|tx| ServiceCommand::ApplySite(tenant_id, site, actor, tx)).await
    }

    pub async fn delete_site(&self, tenant_id: u32, domain: &str, actor: &str) -> Result<ApplyResult, ServiceError> {
        let (domain, actor) = (domain.to_string(), actor.to_string());
        self.request(|tx| ServiceCommand::DeleteSite(tenant_id, domain, actor, tx)).await
    }

    pub async fn suspend(&self, tenant_id: u32, reason: &str, actor: &str) -> Result<ApplyResult, ServiceError> {
        let (reason, actor) = (reason.to_string(), actor.to_string());
        self.request(|tx| ServiceCommand::Suspend(tenant_id, reason, actor, tx)).await
    }

    pub async fn unsuspend(&self, tenant_id: u32, actor: &str) -> Result<ApplyResult, ServiceError> {
        let actor = actor.to_string();
        self.request(|tx| ServiceCommand::Unsuspend(tenant_id, actor, tx)).await
    }

    pub async fn terminate(&self, tenant_id: u32, reason: &str, actor: &str) -> Result<ApplyResult, ServiceError> {
        let (reason, actor) = (reason.to_string(), actor.to_string());
        self.request(|tx| ServiceCommand::Terminate(tenant_id, reason, actor, tx)).await
    }

    pub async fn delete(&self, tenant_id: u32, actor: &str) -> Result<ApplyResult, ServiceError> {
        let actor = actor.to_string();
        self.request(|tx| ServiceCommand::Delete(tenant_id, actor, tx)).await
    }

    /// Cancels in-flight work, stops the pruner and ends the loop
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(ServiceCommand::Shutdown).await
    }
}

impl ServiceImpl {
    /// Runs the service loop. Each tenant command runs on its own task; the
    /// per-tenant locks order commands for the same tenant.
    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            let request_id = Uuid::new_v4();
            let applier = self.applier.clone();
            let token = self.token.clone();

            match command {
                ServiceCommand::Apply(id, desired, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, "apply");
                    tokio::spawn(async move {
                        let result = applier.apply(id, &desired, &actor, &token).await;
                        respond(response_tx, result, "apply");
                    });
                }
                ServiceCommand::ApplySite(id, site, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, domain = %site.domain, "apply site");
                    tokio::spawn(async move {
                        let result = applier.apply_site(id, &site, &actor, &token).await;
                        respond(response_tx, result, "apply site");
                    });
                }
                ServiceCommand::DeleteSite(id, domain, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, domain = %domain, "delete site");
                    tokio::spawn(async move {
                        let result = applier.delete_site(id, &domain, &actor, &token).await;
                        respond(response_tx, result, "delete site");
                    });
                }
                ServiceCommand::Suspend(id, reason, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, "suspend");
                    tokio::spawn(async move {
                        let result = applier.suspend(id, &reason, &actor, &token).await;
                        respond(response_tx, result, "suspend");
                    });
                }
                ServiceCommand::Unsuspend(id, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, "unsuspend");
                    tokio::spawn(async move {
                        let result = applier.unsuspend(id, &actor, &token).await;
                        respond(response_tx, result, "unsuspend");
                    });
                }
                ServiceCommand::Terminate(id, reason, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, "terminate");
                    tokio::spawn(async move {
                        let result = applier.terminate(id, &reason, &actor, &token).await;
                        respond(response_tx, result, "terminate");
                    });
                }
                ServiceCommand::Delete(id, actor, response_tx) => {
                    debug!(%request_id, tenant_id = id, "delete");
                    tokio::spawn(async move {
                        let result = applier.delete(id, &actor, &token).await;
                        respond(response_tx, result, "delete");
                    });
                }
                ServiceCommand::Shutdown(response_tx) => {
                    self.command_rx.close();
                    self.handle_shutdown().await;
                    if response_tx.send(Ok(())).is_err() {
                        error!("Failed to send shutdown response");
                    }

                    // Exit the service loop
                    break;
                }
            }
        }

        info!("Service stopped");
    }

    async fn handle_shutdown(&mut self) {
        self.token.cancel();
        if let Some(pruner) = self.pruner.take() {
            if let Err(e) = pruner.await {
                error!("Event pruner ended abnormally: {}", e);
            }
        }
    }
}

fn respond<T>(tx: oneshot::Sender<Result<T, ServiceError>>, result: Result<T, CoreError>, what: &str) {
    if tx.send(result.map_err(ServiceError::from)).is_err() {
        error!("Failed to send {} response", what);
    }
}

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Response channel closed")]
    ResponseChannelClosed,
}

impl ServiceError {
    /// Classification when the error came from the core
    pub fn core(&self) -> Option<&CoreError> {
        match self {
            ServiceError::Core(err) => Some(err),
            _ => None,
        }
    }
}
