use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use tokio_util::sync::CancellationToken;

use crate::activity::Activity;
use crate::config::Settlement;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{Capabilities, DeviceTransport, Subscription, UploadSource};

// Upper bound when waiting for an activity, in virtual or real time.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Open,
    Close,
    Send(String),
    Subscribe,
    Settle {
        id: String,
        settlement: Settlement,
        detached: bool,
    },
    Upload {
        name: String,
        content: Vec<u8>,
    },
}

// An in-memory transport recording every call along with its instant.
#[derive(Debug)]
pub(crate) struct MockTransport {
    capabilities: Capabilities,
    calls: Mutex<Vec<(Instant, Call)>>,
    inbound: mpsc::Sender<Message>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    detach: CancellationToken,
    fail_open: bool,
    fail_close: bool,
    failing_sends: AtomicUsize,
    failing_settles: AtomicUsize,
    fail_uploads: bool,
    hang_uploads: bool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let (inbound, receiver) = mpsc::channel(16);
        Self {
            capabilities: Capabilities {
                explicit_settlement: true,
            },
            calls: Mutex::new(Vec::new()),
            inbound,
            receiver: Mutex::new(Some(receiver)),
            detach: CancellationToken::new(),
            fail_open: false,
            fail_close: false,
            failing_sends: AtomicUsize::new(0),
            failing_settles: AtomicUsize::new(0),
            fail_uploads: false,
            hang_uploads: false,
        }
    }

    pub(crate) fn auto_complete(mut self) -> Self {
        self.capabilities.explicit_settlement = false;
        self
    }

    pub(crate) fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub(crate) fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub(crate) fn fail_sends(self, count: usize) -> Self {
        self.failing_sends.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_settles(self, count: usize) -> Self {
        self.failing_settles.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub(crate) fn hang_uploads(mut self) -> Self {
        self.hang_uploads = true;
        self
    }

    pub(crate) async fn deliver(&self, message: Message) {
        self.inbound.send(message).await.unwrap();
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detach.is_cancelled()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    // Calls along with their offset from `start`, in milliseconds.
    pub(crate) fn timeline(&self, start: Instant) -> Vec<(u64, Call)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(instant, call)| {
                let offset = instant.saturating_duration_since(start).as_millis();
                (u64::try_from(offset).unwrap(), call.clone())
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    fn should_fail(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl DeviceTransport for MockTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn open(&self) -> Result<()> {
        self.record(Call::Open);
        if self.fail_open {
            return Err(Error::connection("Connection refused"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        if self.fail_close {
            return Err(Error::connection("Connection reset"));
        }
        Ok(())
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        self.record(Call::Send(
            String::from_utf8_lossy(&message.body).into_owned(),
        ));
        if Self::should_fail(&self.failing_sends) {
            return Err(Error::service("Throttled"));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        self.record(Call::Subscribe);
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::service("Already subscribed"))?;
        Ok(Subscription::with_detach(receiver, self.detach.clone()))
    }

    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<()> {
        self.record(Call::Settle {
            id: message.id.clone(),
            settlement,
            detached: self.detach.is_cancelled(),
        });
        if Self::should_fail(&self.failing_settles) {
            return Err(Error::service("Lock lost"));
        }
        Ok(())
    }

    async fn upload_to_blob(&self, name: &str, mut source: UploadSource) -> Result<()> {
        let mut content = Vec::new();
        let _ = source.file.read_to_end(&mut content).await?;
        self.record(Call::Upload {
            name: name.to_owned(),
            content,
        });

        if self.hang_uploads {
            std::future::pending::<()>().await;
        }
        if self.fail_uploads {
            return Err(Error::service("Storage unavailable"));
        }
        Ok(())
    }
}

pub(crate) async fn wait_until_stopped(activity: &dyn Activity) {
    time::timeout(STOP_TIMEOUT, async {
        while activity.is_running() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
