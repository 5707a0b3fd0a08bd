//! Device transports.
//!
//! A transport owns the device side of the connection with the hub and
//! exposes the handful of operations a simulated device needs. Every
//! transport is shared among all activities of a simulation, hence its
//! methods take `&self` and must tolerate interleaved calls.

mod blob;
/// HTTP transport.
pub mod http;
/// MQTT transport.
pub mod mqtt;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Notify, mpsc};

use tokio_util::sync::CancellationToken;

use url::Url;

use crate::config::Settlement;
use crate::error::{Error, Result};
use crate::message::Message;

pub use http::HttpTransport;
pub use mqtt::MqttTransport;

/// Hub REST API version.
pub(crate) const API_VERSION: &str = "2021-04-12";

/// What a transport is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether inbound messages can be explicitly abandoned or rejected.
    ///
    /// Transports that complete messages on delivery only accept
    /// [`Settlement::Complete`].
    pub explicit_settlement: bool,
}

/// A stream of inbound cloud-to-device messages.
///
/// Dropping the subscription detaches it from the transport.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Message>,
    detach: CancellationToken,
    handoff: Option<Handoff>,
}

// Pull-based delivery for transports where fetching a message locks it:
// a message is fetched only once the subscriber asks for one, and the
// messages still buffered when the subscription is dropped are handed
// back to the transport to be released.
#[derive(Debug)]
pub(crate) struct Handoff {
    pub(crate) demand: Arc<Notify>,
    pub(crate) undelivered: mpsc::UnboundedSender<Message>,
}

impl Subscription {
    /// Creates a [`Subscription`] fed by the given receiver.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<Message>) -> Self {
        Self::with_detach(receiver, CancellationToken::new())
    }

    /// Creates a [`Subscription`] whose `detach` token is cancelled when
    /// the subscription is dropped.
    #[must_use]
    pub const fn with_detach(receiver: mpsc::Receiver<Message>, detach: CancellationToken) -> Self {
        Self {
            receiver,
            detach,
            handoff: None,
        }
    }

    pub(crate) fn on_demand(mut self, handoff: Handoff) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Waits for the next inbound message.
    ///
    /// Returns `None` once the transport stops delivering messages.
    pub async fn next(&mut self) -> Option<Message> {
        if let Some(handoff) = &self.handoff {
            // A message left over by an interrupted call comes first.
            if let Ok(message) = self.receiver.try_recv() {
                return Some(message);
            }
            handoff.demand.notify_one();
        }
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handoff) = &self.handoff {
            self.receiver.close();
            while let Ok(message) = self.receiver.try_recv() {
                let _ = handoff.undelivered.send(message);
            }
        }
        self.detach.cancel();
    }
}

/// A local file to be uploaded.
#[derive(Debug)]
pub struct UploadSource {
    /// Opened file.
    pub file: tokio::fs::File,
    /// File size in bytes.
    pub size: u64,
}

/// The device side of a hub connection.
pub trait DeviceTransport: Send + Sync + 'static {
    /// Returns the transport [`Capabilities`].
    fn capabilities(&self) -> Capabilities;

    /// Opens the connection.
    fn open(&self) -> impl Future<Output = Result<()>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Sends a device-to-cloud message.
    fn send_event(&self, message: Message) -> impl Future<Output = Result<()>> + Send;

    /// Subscribes to cloud-to-device messages.
    fn subscribe(&self) -> impl Future<Output = Result<Subscription>> + Send;

    /// Settles a received message.
    fn settle(
        &self,
        message: &Message,
        settlement: Settlement,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Uploads a file to the storage associated with the hub.
    fn upload_to_blob(
        &self,
        name: &str,
        source: UploadSource,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Base address of the hub REST endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint(Url);

impl Endpoint {
    pub(crate) fn https(host_name: &str) -> Result<Self> {
        Self::parse(&format!("https://{host_name}"))
    }

    pub(crate) fn parse(base: &str) -> Result<Self> {
        Url::parse(base)
            .map(Self)
            .map_err(|e| Error::input(format!("Invalid hub address `{base}`: {e}")))
    }

    pub(crate) fn scheme(&self) -> &str {
        self.0.scheme()
    }

    // Builds `<base>/<segment>/...?api-version=<version>[&<extra>]`.
    // Segments are percent-encoded.
    pub(crate) fn url(&self, segments: &[&str], extra_query: Option<&str>) -> Url {
        let mut url = self.0.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            let _ = path.clear().extend(segments);
        }
        let query = match extra_query {
            Some(extra) => format!("api-version={API_VERSION}&{extra}"),
            None => format!("api-version={API_VERSION}"),
        };
        url.set_query(Some(&query));
        url
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{Notify, mpsc};
    use tokio::time;

    use tokio_util::sync::CancellationToken;

    use crate::message::Message;

    use super::{Endpoint, Handoff, Subscription};

    #[tokio::test]
    async fn buffered_messages_are_handed_back() {
        let (sender, receiver) = mpsc::channel(1);
        let (undelivered, mut returned) = mpsc::unbounded_channel();
        let detach = CancellationToken::new();
        let subscription = Subscription::with_detach(receiver, detach.clone()).on_demand(Handoff {
            demand: Arc::new(Notify::new()),
            undelivered,
        });

        sender.send(Message::new("left over").id("m-1")).await.unwrap();
        drop(subscription);

        assert!(detach.is_cancelled());
        assert!(sender.is_closed());
        assert_eq!(returned.recv().await.unwrap().id, "m-1");
    }

    #[tokio::test]
    async fn next_asks_for_a_message() {
        let (sender, receiver) = mpsc::channel(1);
        let (undelivered, _returned) = mpsc::unbounded_channel();
        let demand = Arc::new(Notify::new());
        let mut subscription = Subscription::new(receiver).on_demand(Handoff {
            demand: demand.clone(),
            undelivered,
        });

        assert!(
            time::timeout(Duration::from_millis(10), subscription.next())
                .await
                .is_err()
        );
        time::timeout(Duration::from_secs(1), demand.notified())
            .await
            .unwrap();

        // A buffered message is returned without asking for another one.
        sender.send(Message::new("ready").id("m-2")).await.unwrap();
        assert_eq!(subscription.next().await.unwrap().id, "m-2");
        assert!(
            time::timeout(Duration::from_millis(10), demand.notified())
                .await
                .is_err()
        );
    }

    #[test]
    fn endpoint_urls() {
        let endpoint = Endpoint::https("hub.example.net").unwrap();

        assert_eq!(
            endpoint
                .url(&["devices", "dev 1", "messages", "events"], None)
                .as_str(),
            "https://hub.example.net/devices/dev%201/messages/events?api-version=2021-04-12"
        );
        assert_eq!(
            endpoint
                .url(&["devices", "d", "messages", "deviceBound", "etag"], Some("reject"))
                .as_str(),
            "https://hub.example.net/devices/d/messages/deviceBound/etag?api-version=2021-04-12&reject"
        );
        assert_eq!(endpoint.scheme(), "https");
    }
}
