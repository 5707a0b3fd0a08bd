use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use tokio_util::sync::CancellationToken;

use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::connection::ConnectionOwner;
use crate::error::{Error, Result};
use crate::transport::DeviceTransport;

// Period of the activities liveness check.
const POLL_PERIOD: Duration = Duration::from_millis(200);

/// Coordinator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Activities are running.
    Running,
    /// Waiting for the activities to stop, then closing the connection.
    Draining,
    /// The connection close has been attempted.
    Terminated,
}

/// Drives a fixed set of activities to completion and then closes the
/// device connection.
pub struct Coordinator<T: DeviceTransport> {
    connection: ConnectionOwner<T>,
    activities: Vec<Box<dyn Activity>>,
    state: CoordinatorState,
}

impl<T: DeviceTransport> Coordinator<T> {
    /// Creates a [`Coordinator`] for an open connection and the enabled
    /// activities.
    ///
    /// # Errors
    ///
    /// No activity has been provided.
    pub fn new(connection: ConnectionOwner<T>, activities: Vec<Box<dyn Activity>>) -> Result<Self> {
        if activities.is_empty() {
            return Err(Error::input("No activity to coordinate"));
        }

        Ok(Self {
            connection,
            activities,
            state: CoordinatorState::Running,
        })
    }

    /// Returns the [`CoordinatorState`].
    #[must_use]
    pub const fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Returns whether any activity is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.activities.iter().any(|activity| activity.is_running())
    }

    /// Starts all activities, waits for each of them to stop and closes
    /// the connection.
    ///
    /// When the cancellation token fires, all activities are asked to stop.
    /// The connection is closed only after all of them have stopped.
    ///
    /// # Errors
    ///
    /// The connection cannot be closed.
    pub async fn run(&mut self, cancellation_token: CancellationToken) -> Result<()> {
        for activity in &mut self.activities {
            debug!("Starting the {} activity", activity.name());
            activity.start();
        }

        let mut poll = time::interval(POLL_PERIOD);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancellation_token.cancelled(), if self.state == CoordinatorState::Running => {
                    warn!("Simulation interrupted, stopping all activities");
                    for activity in &self.activities {
                        activity.cancel();
                    }
                    self.state = CoordinatorState::Draining;
                }
                _ = poll.tick() => {
                    if !self.is_running() {
                        break;
                    }
                }
            }
        }

        self.state = CoordinatorState::Draining;
        info!("Device simulation finished.");

        let result = self.connection.close().await;
        self.state = CoordinatorState::Terminated;
        result
    }
}
