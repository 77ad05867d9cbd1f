//! Service discovery sources
//!
//! The registry does not talk to any broker itself. A [`ServiceDiscovery`]
//! source hands it a stream of connect/disconnect events once started.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::service::Service;

/// A topology change reported by a discovery source
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Connected(Service),
    Disconnected {
        service: Service,
        /// Node the disconnect was observed from
        origin: String,
    },
}

impl DiscoveryEvent {
    pub fn service(&self) -> &Service {
        match self {
            DiscoveryEvent::Connected(service) => service,
            DiscoveryEvent::Disconnected { service, .. } => service,
        }
    }
}

/// A source of service connect/disconnect notifications
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Start the source and subscribe to its event stream
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>>;

    async fn stop(&self) -> Result<()>;
}

/// In-process discovery source fed directly by the embedding application
pub struct LocalDiscovery {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>,
}

impl LocalDiscovery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sender: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn connect(&self, service: Service) -> Result<()> {
        self.publish(DiscoveryEvent::Connected(service))
    }

    pub fn disconnect(&self, service: Service, origin: impl Into<String>) -> Result<()> {
        self.publish(DiscoveryEvent::Disconnected {
            service,
            origin: origin.into(),
        })
    }

    fn publish(&self, event: DiscoveryEvent) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| RegistryError::discovery(&self.name, "source is not started"))?;
        debug!(source = %self.name, service = %event.service(), "publishing discovery event");
        sender
            .send(event)
            .map_err(|_| RegistryError::discovery(&self.name, "subscriber has gone away"))
    }
}

#[async_trait]
impl ServiceDiscovery for LocalDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Err(RegistryError::discovery(&self.name, "source is already started"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *sender = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        self.sender.lock().take();
        Ok(())
    }
}
