use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use tokio_util::sync::CancellationToken;

use tracing::{error, info};

use crate::config::SendConfig;
use crate::error::Result;
use crate::message::Message;
use crate::transport::DeviceTransport;

use super::{Activity, Running, RunningGuard};

// Builds the n-th message, counting from zero.
fn next_message(template: Option<&str>, sent: u64) -> Result<Message> {
    match template {
        Some(template) => Message::from_argument(template),
        None => Ok(Message::new(format!("Simulated message: #{sent}"))),
    }
}

// Success line of the n-th message, numbered like its default body.
fn sent_line(number: u64) -> String {
    format!("Message #{number} sent successfully")
}

async fn run_sender<T: DeviceTransport>(
    transport: Arc<T>,
    config: SendConfig,
    sent: Arc<AtomicU64>,
    cancellation_token: CancellationToken,
    _running: RunningGuard,
) {
    let mut interval = time::interval_at(Instant::now() + config.interval, config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let number = sent.load(Ordering::Acquire);
        let message = match next_message(config.message.as_deref(), number) {
            Ok(message) => message,
            Err(e) => {
                error!("Cannot build message: {e}");
                continue;
            }
        };

        let result = tokio::select! {
            () = cancellation_token.cancelled() => break,
            result = transport.send_event(message) => result,
        };

        match result {
            Ok(()) => {
                let count = sent.fetch_add(1, Ordering::AcqRel) + 1;
                info!("{}", sent_line(number));
                if config.count.is_some_and(|target| count >= target) {
                    break;
                }
            }
            Err(e) => error!("Cannot send message: {e}"),
        }
    }
}

/// Sends a device-to-cloud message every interval.
///
/// The activity stops once the configured number of messages has been
/// successfully sent, or when cancelled. A failed send is logged and the
/// next one is attempted at the following tick.
#[derive(Debug)]
pub struct SendActivity<T: DeviceTransport> {
    transport: Arc<T>,
    config: SendConfig,
    sent: Arc<AtomicU64>,
    running: Running,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: DeviceTransport> SendActivity<T> {
    /// Creates a [`SendActivity`] over a shared transport.
    #[must_use]
    pub fn new(transport: Arc<T>, config: SendConfig) -> Self {
        Self {
            transport,
            config,
            sent: Arc::new(AtomicU64::new(0)),
            running: Running::default(),
            cancellation_token: CancellationToken::new(),
            task: None,
        }
    }

    /// Number of messages successfully sent so far.
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }
}

impl<T: DeviceTransport> Activity for SendActivity<T> {
    fn name(&self) -> &'static str {
        "send"
    }

    fn start(&mut self) {
        if self.task.is_some() || self.config.count == Some(0) {
            return;
        }

        let running = self.running.raise();
        self.task = Some(tokio::spawn(run_sender(
            self.transport.clone(),
            self.config.clone(),
            self.sent.clone(),
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::{self, Instant};

    use crate::config::SendConfig;
    use crate::tests::{Call, MockTransport, wait_until_stopped};

    use super::{Activity, SendActivity, next_message, sent_line};

    fn config(count: Option<u64>, message: Option<&str>) -> SendConfig {
        SendConfig {
            message: message.map(str::to_owned),
            interval: Duration::from_millis(100),
            count,
        }
    }

    #[test]
    fn success_line_numbered_like_body() {
        let first = next_message(None, 0).unwrap();

        assert_eq!(first.body.as_ref(), b"Simulated message: #0");
        assert_eq!(sent_line(0), "Message #0 sent successfully");
        assert_eq!(sent_line(2), "Message #2 sent successfully");
    }

    #[tokio::test(start_paused = true)]
    async fn sends_target_count_one_interval_apart() {
        let transport = Arc::new(MockTransport::new());
        let mut activity = SendActivity::new(transport.clone(), config(Some(3), None));
        let start = Instant::now();

        activity.start();
        assert!(activity.is_running());
        wait_until_stopped(&activity).await;

        assert_eq!(activity.sent_count(), 3);
        assert_eq!(
            transport.timeline(start),
            vec![
                (100, Call::Send("Simulated message: #0".into())),
                (200, Call::Send("Simulated message: #1".into())),
                (300, Call::Send("Simulated message: #2".into())),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_count_never_sends() {
        let transport = Arc::new(MockTransport::new());
        let mut activity = SendActivity::new(transport.clone(), config(Some(0), None));

        activity.start();
        assert!(!activity.is_running());

        time::sleep(Duration::from_secs(1)).await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sends_keep_ticking() {
        let transport = Arc::new(MockTransport::new().fail_sends(2));
        let mut activity = SendActivity::new(transport.clone(), config(Some(1), Some("hello")));

        activity.start();
        wait_until_stopped(&activity).await;

        assert_eq!(activity.sent_count(), 1);
        assert_eq!(transport.calls(), vec![Call::Send("hello".into()); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_until_cancelled() {
        let transport = Arc::new(MockTransport::new());
        let mut activity = SendActivity::new(transport.clone(), config(None, None));

        activity.start();
        time::sleep(Duration::from_millis(450)).await;
        assert!(activity.is_running());

        activity.cancel();
        wait_until_stopped(&activity).await;

        assert_eq!(activity.sent_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_once() {
        let transport = Arc::new(MockTransport::new());
        let mut activity = SendActivity::new(transport.clone(), config(Some(1), None));

        activity.start();
        activity.start();
        wait_until_stopped(&activity).await;

        assert_eq!(transport.calls().len(), 1);
    }
}
