use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::DeviceTransport;

/// Lifecycle of the device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not opened yet.
    Idle,
    /// Opened and not closed yet.
    Open,
    /// Closed, or failed to open or close.
    Closed,
}

/// Owner of the one device connection of a simulation.
///
/// The connection is opened once before any activity starts and closed
/// once after all activities have stopped. Any other transition is
/// rejected without touching the transport.
#[derive(Debug)]
pub struct ConnectionOwner<T: DeviceTransport> {
    transport: Arc<T>,
    state: ConnectionState,
}

impl<T: DeviceTransport> ConnectionOwner<T> {
    /// Creates a [`ConnectionOwner`] for the given transport.
    #[must_use]
    pub const fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            state: ConnectionState::Idle,
        }
    }

    /// Returns the shared transport.
    #[must_use]
    pub fn transport(&self) -> Arc<T> {
        self.transport.clone()
    }

    /// Returns the [`ConnectionState`].
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// - The connection has already been opened
    /// - The transport fails to connect, in which case the connection is
    ///   considered closed
    pub async fn open(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(Error::connection("The connection has already been opened"));
        }

        debug!("Opening the device connection");
        if let Err(e) = self.transport.open().await {
            self.state = ConnectionState::Closed;
            return Err(Error::connection(format!("Could not connect: {}", e.info())));
        }

        self.state = ConnectionState::Open;
        info!("Device connection opened");
        Ok(())
    }

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// - The connection is not open
    /// - The transport fails to disconnect. The connection is never reopened
    ///   nor closed again.
    pub async fn close(&mut self) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::connection("The connection is not open"));
        }

        self.state = ConnectionState::Closed;
        debug!("Closing the device connection");
        self.transport
            .close()
            .await
            .map_err(|e| Error::connection(format!("Could not close the connection: {}", e.info())))?;

        info!("Device connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::error::ErrorKind;
    use crate::tests::{Call, MockTransport};

    use super::{ConnectionOwner, ConnectionState};

    #[tokio::test]
    async fn open_and_close_once() {
        let transport = Arc::new(MockTransport::new());
        let mut owner = ConnectionOwner::new(transport.clone());
        assert_eq!(owner.state(), ConnectionState::Idle);

        owner.open().await.unwrap();
        assert_eq!(owner.state(), ConnectionState::Open);
        assert_eq!(
            owner.open().await.unwrap_err().kind(),
            ErrorKind::Connection
        );

        owner.close().await.unwrap();
        assert_eq!(owner.state(), ConnectionState::Closed);
        assert!(owner.close().await.is_err());
        assert!(owner.open().await.is_err());

        assert_eq!(transport.calls(), vec![Call::Open, Call::Close]);
    }

    #[tokio::test]
    async fn close_before_open() {
        let transport = Arc::new(MockTransport::new());
        let mut owner = ConnectionOwner::new(transport.clone());

        assert!(owner.close().await.is_err());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_open() {
        let transport = Arc::new(MockTransport::new().fail_open());
        let mut owner = ConnectionOwner::new(transport.clone());

        assert_eq!(
            owner.open().await.unwrap_err().kind(),
            ErrorKind::Connection
        );
        assert_eq!(owner.state(), ConnectionState::Closed);
        assert!(owner.close().await.is_err());
        assert_eq!(transport.calls(), vec![Call::Open]);
    }

    #[tokio::test]
    async fn failed_close_is_not_retried() {
        let transport = Arc::new(MockTransport::new().fail_close());
        let mut owner = ConnectionOwner::new(transport.clone());

        owner.open().await.unwrap();
        assert_eq!(
            owner.close().await.unwrap_err().kind(),
            ErrorKind::Connection
        );
        assert!(owner.close().await.is_err());
        assert_eq!(transport.calls(), vec![Call::Open, Call::Close]);
    }
}
