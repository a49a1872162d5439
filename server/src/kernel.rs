//! The explicit runtime context.
//!
//! [`Kernel`] builds and owns the processors, scheduler, randomness service,
//! network monitor and connection table, and drives their start/stop
//! lifecycle. Handlers and jobs receive a cloneable [`Context`] instead of
//! reaching for globals.

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::monitor::NetworkMonitor;
use crate::processor::{EnqueueOutcome, Processor, StopReport, WorkItem};
use crate::random::RandomnessService;
use crate::registry::MessageRegistry;
use crate::scheduler::Scheduler;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct ContextInner {
    config: ServerConfig,
    processors: BTreeMap<String, Processor>,
    scheduler: Scheduler,
    random: RandomnessService,
    monitor: Arc<NetworkMonitor>,
    clients: Arc<RwLock<ClientManager>>,
}

/// Services available to handlers, jobs and the network layer.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("processors", &self.inner.processors.keys().collect::<Vec<_>>())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl Context {
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn processor(&self, name: &str) -> Result<&Processor> {
        self.inner
            .processors
            .get(name)
            .ok_or_else(|| ServerError::UnknownProcessor(name.to_string()))
    }

    /// Processors in name order.
    pub fn processors(&self) -> impl Iterator<Item = &Processor> {
        self.inner.processors.values()
    }

    /// Hands a work item to the named processor.
    pub async fn submit(&self, processor: &str, item: WorkItem) -> Result<EnqueueOutcome> {
        self.processor(processor)?.enqueue(item).await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn random(&self) -> &RandomnessService {
        &self.inner.random
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.inner.monitor
    }

    pub fn clients(&self) -> &Arc<RwLock<ClientManager>> {
        &self.inner.clients
    }

    /// Removes and closes a connection. Returns false if it was already gone.
    pub async fn disconnect(&self, owner_id: u32) -> bool {
        self.inner.clients.write().await.remove_client(&owner_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub processors: Vec<StopReport>,
    pub connections_closed: usize,
}

impl ShutdownReport {
    pub fn total_dropped(&self) -> usize {
        self.processors.iter().map(|report| report.dropped).sum()
    }
}

/// Owns every runtime service and drives their start/stop lifecycle.
pub struct Kernel {
    context: Context,
    registry: Arc<MessageRegistry>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("context", &self.context)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Kernel {
    /// Validates the configuration, starts the processors and the
    /// randomness service, and freezes the registry.
    ///
    /// Every registered message type must route to a configured processor.
    pub fn new(config: ServerConfig, registry: MessageRegistry) -> Result<Self> {
        config.validate()?;

        if let Some((type_id, name)) = registry
            .processors()
            .find(|(_, name)| !config.processors.iter().any(|p| p.name == *name))
        {
            warn!("Message type {} routes to unknown processor '{}'", type_id, name);
            return Err(ServerError::UnknownProcessor(name.to_string()));
        }

        let processors: BTreeMap<String, Processor> = config
            .processors
            .iter()
            .map(|processor| (processor.name.clone(), Processor::start(processor)))
            .collect();

        let context = Context {
            inner: Arc::new(ContextInner {
                scheduler: Scheduler::new(config.scheduler_grace()),
                random: RandomnessService::spawn(config.random_buffer),
                monitor: Arc::new(NetworkMonitor::new()),
                clients: Arc::new(RwLock::new(ClientManager::new(
                    config.max_clients,
                    config.outbound_queue,
                ))),
                processors,
                config,
            }),
        };

        info!(
            "Kernel ready: {} message types, processors {:?}",
            registry.len(),
            context.inner.processors.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            context,
            registry: Arc::new(registry),
        })
    }

    pub fn context(&self) -> Context {
        self.context.clone()
    }

    pub fn registry(&self) -> Arc<MessageRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn start(&self) {
        self.context.scheduler().start();
    }

    /// Counts down the drain delay, halts jobs, stops every processor and
    /// closes whatever connections remain.
    pub async fn stop(&self) -> ShutdownReport {
        let delay = self.context.config().drain_delay();
        for remaining in (1..=delay.as_secs()).rev() {
            warn!("Shutting down in {} seconds...", remaining);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.context.scheduler().stop().await;

        let mut processors = Vec::new();
        for processor in self.context.processors() {
            processors.push(processor.stop().await);
        }

        let connections_closed = {
            let mut clients = self.context.clients().write().await;
            let ids: Vec<u32> = clients.owners().iter().map(|owner| owner.id()).collect();
            ids.iter().filter(|id| clients.remove_client(id)).count()
        };

        let report = ShutdownReport {
            processors,
            connections_closed,
        };
        info!(
            "Shutdown complete: {} items dropped, {} connections closed",
            report.total_dropped(),
            report.connections_closed
        );
        report
    }
}
