use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};

use crate::config::ReceiveConfig;
use crate::transport::DeviceTransport;

use super::{Activity, Running, RunningGuard};

async fn run_receiver<T: DeviceTransport>(
    transport: Arc<T>,
    config: ReceiveConfig,
    received: Arc<AtomicU64>,
    cancellation_token: CancellationToken,
    _running: RunningGuard,
) {
    let subscription = tokio::select! {
        () = cancellation_token.cancelled() => return,
        subscription = transport.subscribe() => subscription,
    };

    let mut subscription = match subscription {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Cannot receive messages: {e}");
            return;
        }
    };

    info!("Listening for cloud-to-device messages");

    loop {
        let message = tokio::select! {
            () = cancellation_token.cancelled() => break,
            message = subscription.next() => message,
        };

        let Some(message) = message else {
            warn!("The transport stopped delivering messages");
            break;
        };

        let count = received.fetch_add(1, Ordering::AcqRel) + 1;
        info!("{message}");

        // A settlement is never interrupted, so that every received message
        // is settled exactly once.
        match transport.settle(&message, config.settlement).await {
            Ok(()) => info!("{} message: Success", config.settlement),
            Err(e) => error!("Cannot {} message: {e}", config.settlement),
        }

        if config.count.is_some_and(|target| count >= target) {
            break;
        }
    }

    drop(subscription);
}

/// Receives cloud-to-device messages and settles each of them.
///
/// The activity stops once the configured number of messages has been
/// received and settled, or when cancelled. The subscription is detached
/// only after the last message has been settled.
#[derive(Debug)]
pub struct ReceiveActivity<T: DeviceTransport> {
    transport: Arc<T>,
    config: ReceiveConfig,
    received: Arc<AtomicU64>,
    running: Running,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: DeviceTransport> ReceiveActivity<T> {
    /// Creates a [`ReceiveActivity`] over a shared transport.
    #[must_use]
    pub fn new(transport: Arc<T>, config: ReceiveConfig) -> Self {
        Self {
            transport,
            config,
            received: Arc::new(AtomicU64::new(0)),
            running: Running::default(),
            cancellation_token: CancellationToken::new(),
            task: None,
        }
    }

    /// Number of messages received so far.
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }
}

impl<T: DeviceTransport> Activity for ReceiveActivity<T> {
    fn name(&self) -> &'static str {
        "receive"
    }

    fn start(&mut self) {
        if self.task.is_some() || self.config.count == Some(0) {
            return;
        }

        let running = self.running.raise();
        self.task = Some(tokio::spawn(run_receiver(
            self.transport.clone(),
            self.config.clone(),
            self.received.clone(),
            self.cancellation_token.clone(),
            running,
        )));
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}
