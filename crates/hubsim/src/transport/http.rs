use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, ETAG, HeaderMap};
use reqwest::{Client, RequestBuilder, StatusCode};

use tokio::sync::{Mutex, Notify, mpsc};

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info};

use crate::config::Settlement;
use crate::connection_string::DeviceConnectionString;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::sas::device_token;

use super::blob::BlobUploader;
use super::{Capabilities, DeviceTransport, Endpoint, Handoff, Subscription, UploadSource};

// Interval between two polls of the cloud-to-device queue.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

// The capacity of the inbound channel. Messages are only fetched on
// demand, so the single slot only holds the message being handed over.
const INBOUND_CAPACITY: usize = 1;

const MESSAGE_ID_HEADER: &str = "iothub-messageid";
const APP_PROPERTY_PREFIX: &str = "iothub-app-";

fn message_from_response(headers: &HeaderMap, body: bytes::Bytes) -> Result<Message> {
    let lock_token = headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_matches('"').to_owned())
        .ok_or_else(|| Error::service("Cloud-to-device message without lock token"))?;

    let mut message = Message::new(body).lock_token(lock_token);

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        if name.as_str() == MESSAGE_ID_HEADER {
            message.id = value.to_owned();
        } else if let Some(key) = name.as_str().strip_prefix(APP_PROPERTY_PREFIX) {
            let _ = message.properties.insert(key.to_owned(), value.to_owned());
        }
    }

    Ok(message)
}

#[derive(Debug, Clone)]
struct Poller {
    client: Client,
    endpoint: Endpoint,
    connection_string: DeviceConnectionString,
}

impl Poller {
    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request.header(AUTHORIZATION, device_token(&self.connection_string)?))
    }

    // Every successful fetch locks the returned message on the hub until
    // it is settled or the lock times out.
    async fn fetch(&self) -> Result<Option<Message>> {
        let device_id = self.connection_string.device_id.as_str();
        let request = self.client.get(
            self.endpoint
                .url(&["devices", device_id, "messages", "deviceBound"], None),
        );
        let response = self.authorized(request)?.send().await?.error_for_status()?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let headers = response.headers().clone();
        let body = response.bytes().await?;
        message_from_response(&headers, body).map(Some)
    }

    async fn settle(&self, lock_token: &str, settlement: Settlement) -> Result<()> {
        let base = [
            "devices",
            self.connection_string.device_id.as_str(),
            "messages",
            "deviceBound",
            lock_token,
        ];
        let request = match settlement {
            Settlement::Complete => self.client.delete(self.endpoint.url(&base, None)),
            Settlement::Reject => self.client.delete(self.endpoint.url(&base, Some("reject"))),
            Settlement::Abandon => {
                let mut segments = base.to_vec();
                segments.push("abandon");
                self.client.post(self.endpoint.url(&segments, None))
            }
        };

        let _ = self.authorized(request)?.send().await?.error_for_status()?;
        Ok(())
    }

    // Gives back the lock of a message the subscriber never took.
    async fn release(&self, message: &Message) {
        let Some(lock_token) = message.lock_token.as_deref() else {
            return;
        };
        match self.settle(lock_token, Settlement::Abandon).await {
            Ok(()) => debug!("Undelivered message `{}` abandoned", message.id),
            Err(e) => error!("Cannot abandon undelivered message `{}`: {e}", message.id),
        }
    }

    // Polls until a message is available. A fetch is never interrupted,
    // otherwise a message could be locked without anybody to settle it.
    async fn poll(
        &self,
        poll_interval: Duration,
        cancellation_token: &CancellationToken,
    ) -> Option<Message> {
        loop {
            match self.fetch().await {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(e) => error!("Error in polling cloud-to-device messages: {e}"),
            }

            tokio::select! {
                () = cancellation_token.cancelled() => return None,
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn run(
        self,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
        sender: mpsc::Sender<Message>,
        demand: Arc<Notify>,
        mut undelivered: mpsc::UnboundedReceiver<Message>,
    ) {
        loop {
            // Fetch only when the subscriber asks for a message.
            tokio::select! {
                () = cancellation_token.cancelled() => break,
                () = demand.notified() => {}
            }

            let Some(message) = self.poll(poll_interval, &cancellation_token).await else {
                break;
            };

            if cancellation_token.is_cancelled() {
                self.release(&message).await;
                break;
            }

            if let Err(mpsc::error::SendError(message)) = sender.send(message).await {
                debug!("Subscriber detached, stop polling");
                self.release(&message).await;
                break;
            }
        }

        // The subscription hands its buffered messages back before
        // detaching.
        cancellation_token.cancelled().await;
        undelivered.close();
        while let Some(message) = undelivered.recv().await {
            self.release(&message).await;
        }
    }
}

/// A transport speaking HTTPS with the hub.
///
/// Cloud-to-device messages are polled and locked until they are
/// explicitly settled.
pub struct HttpTransport {
    poller: Poller,
    poll_interval: Duration,
    uploader: BlobUploader,
    // `None` while closed.
    shutdown: Mutex<Option<CancellationToken>>,
}

impl HttpTransport {
    /// Creates a [`HttpTransport`] for the given device.
    ///
    /// # Errors
    ///
    /// The hub host name is not a valid address or the HTTP client cannot
    /// be built.
    pub fn new(connection_string: DeviceConnectionString) -> Result<Self> {
        let endpoint = Endpoint::https(&connection_string.host_name)?;
        Self::with_endpoint(connection_string, endpoint)
    }

    pub(crate) fn with_endpoint(
        connection_string: DeviceConnectionString,
        endpoint: Endpoint,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::connection(format!("Impossible to build the HTTP client: {e}")))?;

        Ok(Self {
            poller: Poller {
                client: client.clone(),
                endpoint: endpoint.clone(),
                connection_string,
            },
            poll_interval: DEFAULT_POLL_INTERVAL,
            uploader: BlobUploader::new(client, endpoint),
            shutdown: Mutex::new(None),
        })
    }

    /// Sets the interval between two polls of the cloud-to-device queue.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn device_id(&self) -> &str {
        &self.poller.connection_string.device_id
    }

    async fn check_open(&self) -> Result<CancellationToken> {
        self.shutdown
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::service("The HTTP connection is not open"))
    }
}

impl DeviceTransport for HttpTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            explicit_settlement: true,
        }
    }

    async fn open(&self) -> Result<()> {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.is_some() {
            return Err(Error::connection("The HTTP connection is already open"));
        }

        // HTTP is connectionless: opening only checks the credentials
        // can be turned into a token.
        let _ = device_token(&self.poller.connection_string)
            .map_err(|e| Error::connection(format!("Could not connect as device: {e}")))?;

        *shutdown = Some(CancellationToken::new());
        info!("Connected as device `{}` over HTTP", self.device_id());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let shutdown = self
            .shutdown
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::connection("The HTTP connection is not open"))?;
        // Stop every poller still alive.
        shutdown.cancel();
        Ok(())
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        let _ = self.check_open().await?;

        let url = self.poller.endpoint.url(
            &["devices", self.device_id(), "messages", "events"],
            None,
        );
        let mut request = self
            .poller
            .authorized(self.poller.client.post(url))?
            .header(MESSAGE_ID_HEADER, &message.id);
        for (key, value) in &message.properties {
            request = request.header(format!("{APP_PROPERTY_PREFIX}{key}"), value);
        }

        let _ = request.body(message.body).send().await?.error_for_status()?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let detach = self.check_open().await?.child_token();
        let (sender, receiver) = mpsc::channel(INBOUND_CAPACITY);
        let (undelivered, returned) = mpsc::unbounded_channel();
        let demand = Arc::new(Notify::new());

        let _ = tokio::spawn(self.poller.clone().run(
            self.poll_interval,
            detach.clone(),
            sender,
            demand.clone(),
            returned,
        ));

        Ok(Subscription::with_detach(receiver, detach).on_demand(Handoff {
            demand,
            undelivered,
        }))
    }

    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<()> {
        let _ = self.check_open().await?;

        let lock_token = message.lock_token.as_deref().ok_or_else(|| {
            Error::service(format!(
                "Message `{}` cannot be settled: it has no lock token",
                message.id
            ))
        })?;

        self.poller.settle(lock_token, settlement).await
    }

    async fn upload_to_blob(&self, name: &str, source: UploadSource) -> Result<()> {
        let _ = self.check_open().await?;
        self.uploader
            .upload(&self.poller.connection_string, name, source)
            .await
    }
}
