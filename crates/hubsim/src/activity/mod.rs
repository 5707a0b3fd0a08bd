//! Simulated device activities.
//!
//! An activity is an independently scheduled task which shares the device
//! transport with the other activities of a simulation. The only thing an
//! activity reports back is whether it is still running.

/// Cloud-to-device messages.
pub mod receive;
/// Periodic device-to-cloud messages.
pub mod send;
/// File upload.
pub mod upload;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use receive::ReceiveActivity;
pub use send::SendActivity;
pub use upload::UploadActivity;

/// A device activity.
pub trait Activity: Send {
    /// Activity name, used in logs.
    fn name(&self) -> &'static str;

    /// Starts the activity on the current runtime.
    ///
    /// An activity starts at most once; further calls are ignored.
    fn start(&mut self);

    /// Whether the activity is still running.
    fn is_running(&self) -> bool;

    /// Asks the activity to stop as soon as possible.
    fn cancel(&self);
}

/// Liveness flag shared between an activity and its task.
#[derive(Debug, Clone, Default)]
pub(crate) struct Running(Arc<AtomicBool>);

impl Running {
    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    // Raises the flag and returns the guard which lowers it once dropped.
    pub(crate) fn raise(&self) -> RunningGuard {
        self.0.store(true, Ordering::Release);
        RunningGuard(self.0.clone())
    }
}

/// Lowers the running flag when the activity task ends, whatever the way.
#[derive(Debug)]
pub(crate) struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
