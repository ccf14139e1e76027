//! Host assembly.
//!
//! Builds the host command bus, the broadcast sink, the worker supervisor and
//! the service supervisor, and registers the service commands on the bus.
//! Commands the bus does not know go to the service named in their data.
//!
//! ```text
//!   commands ─→ CommandBus ──→ ServiceManager ──→ WorkersManager ──→ workers
//!                   ↑                 │                  │
//!                   └── escalations ──┼──────────────────┘
//!                                     ↓
//!                               Broadcaster ─→ subscribers
//! ```

use serde_json::Value;
use std::sync::Arc;

use crate::commbus::{Broadcaster, CommandBus, CommandEnvelope, CommandRouter};
use crate::services::{self, ServiceManager};
use crate::types::{Config, Result};
use crate::workers::{Launchers, WorkersManager};

/// A running host control plane.
#[derive(Debug, Clone)]
pub struct ServiceHost {
    bus: Arc<CommandBus>,
    broadcaster: Arc<Broadcaster>,
    services: ServiceManager,
}

impl ServiceHost {
    /// Wire the host on the current runtime. Nothing is started yet.
    pub async fn new(config: &Config, launchers: Launchers) -> Result<Self> {
        let bus = Arc::new(CommandBus::new());
        let broadcaster = Arc::new(Broadcaster::new());

        let workers = WorkersManager::start(launchers, bus.clone(), broadcaster.clone());
        let services = ServiceManager::new(workers, broadcaster.clone(), config.supervisor.clone());
        services::register_commands(&bus, &services).await?;

        Ok(Self {
            bus,
            broadcaster,
            services,
        })
    }

    /// Scan the services dirs, then start autostart services.
    pub async fn bootstrap(&self) -> Result<()> {
        self.services.update_list()?;
        self.services.start_autostart().await;
        let services = self.services.list().as_object().map_or(0, |list| list.len());
        tracing::info!(services, "host bootstrapped");
        Ok(())
    }

    /// Run a command on the host bus.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<Value> {
        self.bus.dispatch(envelope).await
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// Stop every service, cancel pending restarts and stop the worker
    /// supervisor.
    ///
    /// The supervisor's router is this host's bus, whose service commands hold
    /// the supervisor in turn, so dropping the host alone does not stop it.
    pub async fn shutdown(&self) {
        self.services.shutdown().await;
        self.services.workers().shutdown().await;
        tracing::info!("host shut down");
    }
}
