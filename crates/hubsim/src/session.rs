use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tracing::info;

use crate::activity::{Activity, ReceiveActivity, SendActivity, UploadActivity};
use crate::config::{DeviceSource, Protocol, SimulationConfig};
use crate::connection::ConnectionOwner;
use crate::connection_string::DeviceConnectionString;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::registry::Registry;
use crate::transport::{DeviceTransport, HttpTransport, MqttTransport};

/// A device simulation over a given transport.
///
/// A session is created from a validated configuration and consumed by
/// [`SimulationSession::run`].
#[derive(Debug)]
pub struct SimulationSession<T: DeviceTransport> {
    config: SimulationConfig,
    connection: ConnectionOwner<T>,
}

impl<T: DeviceTransport> SimulationSession<T> {
    /// Creates a [`SimulationSession`] over a shared transport.
    ///
    /// # Errors
    ///
    /// The configuration is invalid for the given transport.
    pub fn new(config: SimulationConfig, transport: Arc<T>) -> Result<Self> {
        config.validate(transport.capabilities())?;

        Ok(Self {
            config,
            connection: ConnectionOwner::new(transport),
        })
    }

    fn activities(&self) -> Vec<Box<dyn Activity>> {
        let transport = self.connection.transport();
        let mut activities: Vec<Box<dyn Activity>> = Vec::new();

        if let Some(send) = &self.config.send {
            activities.push(Box::new(SendActivity::new(transport.clone(), send.clone())));
        }

        if let Some(receive) = &self.config.receive {
            activities.push(Box::new(ReceiveActivity::new(
                transport.clone(),
                receive.clone(),
            )));
        }

        if let Some(upload) = &self.config.upload {
            activities.push(Box::new(UploadActivity::new(transport, upload.clone())));
        }

        activities
    }

    /// Opens the connection, runs every enabled activity until it stops
    /// and closes the connection.
    ///
    /// # Errors
    ///
    /// The connection cannot be opened or closed.
    pub async fn run(mut self, cancellation_token: CancellationToken) -> Result<()> {
        let activities = self.activities();

        self.connection.open().await?;

        let mut coordinator = Coordinator::new(self.connection, activities)?;
        coordinator.run(cancellation_token).await
    }
}

// Resolves the device connection string, looking the device up in the
// registry when needed.
async fn resolve_device(device: &DeviceSource) -> Result<DeviceConnectionString> {
    match device {
        DeviceSource::ConnectionString(connection_string) => Ok(connection_string.clone()),
        DeviceSource::Registry { device_id, hub } => {
            Registry::new(hub.clone())?.lookup(device_id).await
        }
    }
}

/// Runs a device simulation with the configured protocol.
///
/// The configuration is validated before any network operation.
///
/// # Errors
///
/// - The configuration is invalid
/// - The device cannot be found in the registry
/// - The connection cannot be opened or closed
pub async fn simulate(config: SimulationConfig, cancellation_token: CancellationToken) -> Result<()> {
    config.validate(config.protocol.capabilities())?;

    let connection_string = resolve_device(&config.device).await?;
    info!(
        "Simulating device `{}` over {}",
        connection_string.device_id, config.protocol
    );

    match config.protocol {
        Protocol::Mqtt => {
            let transport = Arc::new(MqttTransport::new(connection_string)?);
            SimulationSession::new(config, transport)?
                .run(cancellation_token)
                .await
        }
        Protocol::Http => {
            let transport = Arc::new(HttpTransport::new(connection_string)?);
            SimulationSession::new(config, transport)?
                .run(cancellation_token)
                .await
        }
    }
}
