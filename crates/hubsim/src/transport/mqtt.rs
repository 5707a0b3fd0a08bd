use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use reqwest::Client;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport,
};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use url::form_urlencoded;

use crate::config::Settlement;
use crate::connection_string::{DeviceConnectionString, DeviceCredentials};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::sas::{DEFAULT_TOKEN_VALIDITY, device_token_until, expiry_from_now};

use super::blob::BlobUploader;
use super::{API_VERSION, Capabilities, DeviceTransport, Endpoint, Subscription, UploadSource};

// Secure MQTT port of the hub.
const MQTT_TLS_PORT: u16 = 8883;

// The capacity of the bounded asynchronous channels.
const ASYNC_CHANNEL_CAPACITY: usize = 10;

// Keep alive time to send `pingreq` to broker when the connection is idle.
const KEEP_ALIVE_TIME: Duration = Duration::from_secs(60);

// Time to wait before polling again a failed connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// Maximum time to wait for the disconnect packet to be flushed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// Maximum time to wait for the broker to acknowledge a message.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

// A token signed from a symmetric key is renewed this long before it expires.
const TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(300);

// System property carrying the message identifier.
const MESSAGE_ID_PROPERTY: &str = "$.mid";

// The current subscriber of cloud-to-device messages.
struct Inbound {
    queue: mpsc::UnboundedSender<Message>,
    detach: CancellationToken,
}

type InboundSlot = Arc<Mutex<Option<Inbound>>>;

// Publishes waiting for the broker acknowledgement.
//
// A publish is queued when handed to the client, bound to its packet
// identifier once written to the network, and released by the matching
// `PUBACK`. The client writes publishes in the order they are queued.
#[derive(Debug, Default)]
struct PendingAcks {
    queued: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl PendingAcks {
    fn queue(&mut self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.queued.push_back(sender);
        receiver
    }

    // The last queued publish never reached the client.
    fn unqueue_last(&mut self) {
        let _ = self.queued.pop_back();
    }

    fn written(&mut self, pkid: u16) {
        // Publishes retransmitted after a reconnection keep their identifier.
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(sender) = self.queued.pop_front() {
            let _ = self.in_flight.insert(pkid, sender);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(sender) = self.in_flight.remove(&pkid) {
            let _ = sender.send(());
        }
    }
}

type AckSlot = Arc<Mutex<PendingAcks>>;

// Time left before a token expiring at `expiry` must be renewed, both
// `expiry` and `now` being seconds since the Unix epoch.
fn renewal_delay(expiry: u64, now: u64) -> Duration {
    Duration::from_secs(
        expiry
            .saturating_sub(now)
            .saturating_sub(TOKEN_RENEWAL_MARGIN.as_secs()),
    )
}

// Credentials presented on every connection to the broker.
struct Credentials {
    connection_string: DeviceConnectionString,
    username: String,
    // Expiry of the last signed token. `None` for a pre-issued token,
    // which cannot be renewed.
    expiry: Option<u64>,
}

impl Credentials {
    fn new(connection_string: DeviceConnectionString) -> Self {
        let username = format!(
            "{}/{}/?api-version={API_VERSION}",
            connection_string.host_name, connection_string.device_id
        );
        Self {
            connection_string,
            username,
            expiry: None,
        }
    }

    fn token(&mut self) -> Result<String> {
        let expiry = match self.connection_string.credentials {
            DeviceCredentials::SharedAccessKey(_) => {
                Some(expiry_from_now(DEFAULT_TOKEN_VALIDITY))
            }
            DeviceCredentials::SharedAccessSignature(_) => None,
        };
        let token = device_token_until(&self.connection_string, expiry.unwrap_or_default())?;
        self.expiry = expiry;
        Ok(token)
    }

    fn renewal_delay(&self) -> Option<Duration> {
        self.expiry
            .map(|expiry| renewal_delay(expiry, expiry_from_now(Duration::ZERO)))
    }

    // Replaces the credentials used by the next connection attempts. The
    // hub drops the current connection once its token expires.
    fn renew(&mut self, eventloop: &mut EventLoop) {
        match self.token() {
            Ok(token) => {
                let _ = eventloop
                    .mqtt_options
                    .set_credentials(self.username.clone(), token);
                debug!("Device token renewed");
            }
            Err(e) => error!("Impossible to renew the device token: {e}"),
        }
    }
}

fn events_topic(device_id: &str, message: &Message) -> String {
    let mut properties = form_urlencoded::Serializer::new(String::new());
    let _ = properties.append_pair(MESSAGE_ID_PROPERTY, &message.id);
    for (key, value) in &message.properties {
        let _ = properties.append_pair(key, value);
    }
    format!(
        "devices/{device_id}/messages/events/{}",
        properties.finish()
    )
}

fn devicebound_prefix(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

// Rebuilds a message from a `devicebound` publish.
//
// The topic ends with a url-encoded property bag. System properties start
// with `$.` and are dropped, apart from the message identifier.
fn parse_devicebound(prefix: &str, topic: &str, payload: Bytes) -> Option<Message> {
    let property_bag = topic.strip_prefix(prefix)?;

    let mut message = Message::new(payload);
    for (key, value) in form_urlencoded::parse(property_bag.as_bytes()) {
        if key == MESSAGE_ID_PROPERTY {
            message.id = value.into_owned();
        } else if !key.starts_with("$.") && !key.starts_with("iothub-") {
            let _ = message
                .properties
                .insert(key.into_owned(), value.into_owned());
        }
    }
    Some(message)
}

#[inline]
fn parse_event(
    event: &std::result::Result<Event, ConnectionError>,
    prefix: &str,
) -> Option<Message> {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            error!("Error in receiving the MQTT event, discard it: {e}");
            return None;
        }
    };

    let Event::Incoming(Packet::Publish(publish)) = event else {
        return None;
    };

    let message = parse_devicebound(prefix, &publish.topic, publish.payload.clone());
    if message.is_none() {
        warn!("Publish on unexpected topic `{}` ignored", publish.topic);
    }
    message
}

// Hands a cloud-to-device message over to the subscriber, if any,
// without waiting for the subscriber to take it.
async fn dispatch(inbound: &InboundSlot, message: Message) {
    let mut slot = inbound.lock().await;
    if slot
        .as_ref()
        .is_some_and(|subscriber| subscriber.detach.is_cancelled())
    {
        *slot = None;
    }

    let Some(subscriber) = slot.as_ref() else {
        warn!("No subscriber for message `{}`, it is auto-completed anyway", message.id);
        return;
    };

    if let Err(e) = subscriber.queue.send(message) {
        warn!("Subscriber detached, drop message `{}`", e.0.id);
        *slot = None;
    }
}

// Feeds a subscription from the unbounded queue filled by the event loop.
async fn forward(
    mut queue: mpsc::UnboundedReceiver<Message>,
    subscriber: mpsc::Sender<Message>,
    detach: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = detach.cancelled() => break,
            message = queue.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        let delivered = tokio::select! {
            () = detach.cancelled() => false,
            result = subscriber.send(message) => result.is_ok(),
        };
        if !delivered {
            break;
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    prefix: String,
    mut credentials: Credentials,
    cancellation_token: CancellationToken,
    inbound: InboundSlot,
    acks: AckSlot,
) {
    let renews = credentials.renewal_delay().is_some();
    let renewal = time::sleep(credentials.renewal_delay().unwrap_or(DEFAULT_TOKEN_VALIDITY));
    tokio::pin!(renewal);

    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Sign a fresh token before the current one expires
            () = &mut renewal, if renews => {
                credentials.renew(&mut eventloop);
                let delay = credentials.renewal_delay().unwrap_or(DEFAULT_TOKEN_VALIDITY);
                renewal.as_mut().reset(Instant::now() + delay);
            }
            // Poll the `MQTT` event coming from the network
            event = eventloop.poll() => {
                match &event {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("Disconnect packet sent, stop polling");
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        acks.lock().await.written(*pkid);
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        acks.lock().await.acknowledged(ack.pkid);
                    }
                    _ => {}
                }

                let Some(message) = parse_event(&event, &prefix) else {
                    if event.is_err() {
                        time::sleep(RECONNECT_DELAY).await;
                    }
                    continue;
                };

                dispatch(&inbound, message).await;
            }
        }
    }
    // Waiting senders learn the connection is gone.
    *acks.lock().await = PendingAcks::default();
    drop(eventloop);
}

struct Connection {
    client: AsyncClient,
    event_handle: JoinHandle<()>,
}

/// A transport speaking MQTT 3.1.1 over TLS with the hub.
///
/// Cloud-to-device messages are completed as soon as the broker delivers
/// them, so they cannot be abandoned nor rejected.
pub struct MqttTransport {
    connection_string: DeviceConnectionString,
    connection: Mutex<Option<Connection>>,
    inbound: InboundSlot,
    acks: AckSlot,
    // Publishes are queued for acknowledgement in the order they are sent.
    publish_order: Mutex<()>,
    cancellation_token: CancellationToken,
    uploader: BlobUploader,
}

impl MqttTransport {
    /// Creates a [`MqttTransport`] for the given device.
    ///
    /// # Errors
    ///
    /// The hub host name is not a valid address or the HTTP client used
    /// for uploads cannot be built.
    pub fn new(connection_string: DeviceConnectionString) -> Result<Self> {
        let endpoint = Endpoint::https(&connection_string.host_name)?;
        let client = Client::builder()
            .build()
            .map_err(|e| Error::connection(format!("Impossible to build the HTTP client: {e}")))?;

        Ok(Self {
            connection_string,
            connection: Mutex::new(None),
            inbound: Arc::new(Mutex::new(None)),
            acks: Arc::new(Mutex::new(PendingAcks::default())),
            publish_order: Mutex::new(()),
            cancellation_token: CancellationToken::new(),
            uploader: BlobUploader::new(client, endpoint),
        })
    }

    fn options(&self, credentials: &mut Credentials) -> Result<MqttOptions> {
        let DeviceConnectionString {
            host_name,
            device_id,
            ..
        } = &self.connection_string;

        let mut options = MqttOptions::new(device_id.as_str(), host_name.as_str(), MQTT_TLS_PORT);
        let _ = options
            .set_keep_alive(KEEP_ALIVE_TIME)
            .set_credentials(credentials.username.clone(), credentials.token()?)
            .set_transport(Transport::tls_with_default_config());
        Ok(options)
    }
}

impl DeviceTransport for MqttTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            explicit_settlement: false,
        }
    }

    async fn open(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Err(Error::connection("The MQTT connection is already open"));
        }

        let device_id = self.connection_string.device_id.as_str();
        let mut credentials = Credentials::new(self.connection_string.clone());
        let (client, mut eventloop) =
            AsyncClient::new(self.options(&mut credentials)?, ASYNC_CHANNEL_CAPACITY);

        // Wait for the broker acknowledgement before handing the
        // connection to the activities.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::connection(format!(
                        "Could not connect as device `{device_id}`: {e}"
                    )));
                }
            }
        }

        let prefix = devicebound_prefix(device_id);
        client
            .subscribe(format!("{prefix}#"), QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                error!("Impossible to subscribe to cloud-to-device messages for {device_id}: {e}");
                e
            })?;

        let event_handle = tokio::spawn(run_event_loop(
            eventloop,
            prefix,
            credentials,
            self.cancellation_token.clone(),
            self.inbound.clone(),
            self.acks.clone(),
        ));

        info!("Connected as device `{device_id}` over MQTT");
        *connection = Some(Connection {
            client,
            event_handle,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(Connection {
            client,
            mut event_handle,
        }) = self.connection.lock().await.take()
        else {
            return Err(Error::connection("The MQTT connection is not open"));
        };

        let disconnect = client.disconnect().await;

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut event_handle)
            .await
            .is_err()
        {
            warn!("The MQTT event loop did not stop in time, cancel it");
        }
        self.cancellation_token.cancel();
        if !event_handle.is_finished() {
            event_handle.abort();
        }
        *self.acks.lock().await = PendingAcks::default();

        disconnect.map_err(|e| Error::connection(format!("Could not disconnect: {e}")))
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        let client = self
            .connection
            .lock()
            .await
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or_else(|| Error::service("The MQTT connection is not open"))?;

        let topic = events_topic(&self.connection_string.device_id, &message);
        let acknowledged = {
            let _order = self.publish_order.lock().await;
            let acknowledged = self.acks.lock().await.queue();
            if let Err(e) = client
                .publish(topic, QoS::AtLeastOnce, false, message.body.to_vec())
                .await
            {
                self.acks.lock().await.unqueue_last();
                return Err(e.into());
            }
            acknowledged
        };

        match time::timeout(ACK_TIMEOUT, acknowledged).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::service(format!(
                "The MQTT connection closed before message `{}` was acknowledged",
                message.id
            ))),
            Err(_) => Err(Error::service(format!(
                "Message `{}` not acknowledged within {}s",
                message.id,
                ACK_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let mut slot = self.inbound.lock().await;
        if slot
            .as_ref()
            .is_some_and(|subscriber| !subscriber.detach.is_cancelled())
        {
            return Err(Error::service(
                "Cloud-to-device messages already have a subscriber",
            ));
        }

        let (queue, pending) = mpsc::unbounded_channel();
        let (sender, receiver) = mpsc::channel(ASYNC_CHANNEL_CAPACITY);
        let detach = CancellationToken::new();

        let _ = tokio::spawn(forward(pending, sender, detach.clone()));

        *slot = Some(Inbound {
            queue,
            detach: detach.clone(),
        });
        Ok(Subscription::with_detach(receiver, detach))
    }

    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<()> {
        match settlement {
            Settlement::Complete => {
                debug!("Message `{}` already completed by the broker", message.id);
                Ok(())
            }
            Settlement::Abandon | Settlement::Reject => Err(Error::service(format!(
                "Cannot {settlement} messages with MQTT: messages are automatically completed."
            ))),
        }
    }

    async fn upload_to_blob(&self, name: &str, source: UploadSource) -> Result<()> {
        self.uploader
            .upload(&self.connection_string, name, source)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use tokio::time;

    use crate::config::Settlement;
    use crate::connection_string::DeviceConnectionString;
    use crate::message::Message;
    use crate::sas::expiry_from_now;
    use crate::transport::DeviceTransport;

    use super::{
        ASYNC_CHANNEL_CAPACITY, Credentials, MqttTransport, PendingAcks, devicebound_prefix,
        dispatch, events_topic, parse_devicebound, renewal_delay,
    };

    fn transport() -> MqttTransport {
        MqttTransport::new(DeviceConnectionString::with_key(
            "hub.example.net",
            "dev-1",
            "c2VjcmV0",
        ))
        .unwrap()
    }

    #[test]
    fn events_topic_carries_properties() {
        let message = Message::new("x").id("m-1").property("color", "light blue");

        assert_eq!(
            events_topic("dev-1", &message),
            "devices/dev-1/messages/events/%24.mid=m-1&color=light+blue"
        );
    }

    #[test]
    fn devicebound_properties() {
        let prefix = devicebound_prefix("dev-1");
        let message = parse_devicebound(
            &prefix,
            "devices/dev-1/messages/devicebound/%24.mid=c2d-7&%24.to=%2Fdevices%2Fdev-1&iothub-ack=full&color=blue",
            Bytes::from_static(b"hello"),
        )
        .unwrap();

        assert_eq!(message, Message::new("hello").id("c2d-7").property("color", "blue"));
    }

    #[test]
    fn foreign_topic_is_ignored() {
        let prefix = devicebound_prefix("dev-1");
        assert!(parse_devicebound(&prefix, "devices/dev-2/messages/devicebound/", Bytes::new()).is_none());
    }

    #[tokio::test]
    async fn only_complete_is_supported() {
        let transport = transport();
        let message = Message::new("x");

        assert!(!transport.capabilities().explicit_settlement);
        transport.settle(&message, Settlement::Complete).await.unwrap();
        assert!(transport.settle(&message, Settlement::Abandon).await.is_err());
        assert!(transport.settle(&message, Settlement::Reject).await.is_err());
    }

    #[tokio::test]
    async fn closed_transport_refuses_operations() {
        let transport = transport();

        assert!(transport.send_event(Message::new("x")).await.is_err());
        assert!(transport.close().await.is_err());
    }

    #[tokio::test]
    async fn single_subscriber() {
        let transport = transport();

        let first = transport.subscribe().await.unwrap();
        assert!(transport.subscribe().await.is_err());

        drop(first);
        let _second = transport.subscribe().await.unwrap();
    }

    #[test]
    fn sends_complete_on_matching_acknowledgement() {
        let mut acks = PendingAcks::default();
        let mut first = acks.queue();
        let mut second = acks.queue();

        acks.written(1);
        acks.written(2);
        assert!(first.try_recv().is_err());

        acks.acknowledged(2);
        assert!(second.try_recv().is_ok());
        assert!(first.try_recv().is_err());

        acks.acknowledged(1);
        assert!(first.try_recv().is_ok());
    }

    #[test]
    fn retransmission_keeps_waiting() {
        let mut acks = PendingAcks::default();
        let mut first = acks.queue();
        let mut second = acks.queue();

        acks.written(7);
        // The connection drops: publish 7 is written again on reconnection.
        acks.written(7);
        acks.written(8);

        acks.acknowledged(8);
        assert!(second.try_recv().is_ok());
        assert!(first.try_recv().is_err());

        acks.acknowledged(7);
        assert!(first.try_recv().is_ok());
    }

    #[test]
    fn unacknowledged_sends_fail_when_connection_is_gone() {
        let mut acks = PendingAcks::default();
        let mut written = acks.queue();
        let mut refused = acks.queue();
        acks.written(1);
        acks.unqueue_last();
        assert!(refused.try_recv().is_err());

        // Acknowledgements never come for an unknown packet.
        acks.acknowledged(5);
        assert!(written.try_recv().is_err());

        drop(acks);
        assert!(matches!(
            written.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn token_renewal_schedule() {
        let now = 1_700_000_000;

        assert_eq!(renewal_delay(now + 3600, now), Duration::from_secs(3300));
        assert_eq!(renewal_delay(now + 300, now), Duration::ZERO);
        assert_eq!(renewal_delay(now + 60, now), Duration::ZERO);
        assert_eq!(renewal_delay(now - 60, now), Duration::ZERO);
    }

    #[test]
    fn key_credentials_are_renewed() {
        let mut credentials = Credentials::new(DeviceConnectionString::with_key(
            "hub.example.net",
            "dev-1",
            "c2VjcmV0",
        ));
        assert_eq!(credentials.username, "hub.example.net/dev-1/?api-version=2021-04-12");
        assert_eq!(credentials.renewal_delay(), None);

        let token = credentials.token().unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev-1"));
        assert!(credentials.expiry.unwrap() >= expiry_from_now(Duration::from_secs(3600)) - 1);

        let delay = credentials.renewal_delay().unwrap();
        assert!(delay > Duration::from_secs(3200) && delay <= Duration::from_secs(3300));
    }

    #[test]
    fn pre_issued_token_is_never_renewed() {
        let mut credentials = Credentials::new(
            "HostName=hub.example.net;DeviceId=dev-1;SharedAccessSignature=SharedAccessSignature sr=h&sig=s&se=1"
                .parse()
                .unwrap(),
        );

        assert_eq!(credentials.token().unwrap(), "SharedAccessSignature sr=h&sig=s&se=1");
        assert_eq!(credentials.renewal_delay(), None);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_dispatch() {
        let transport = transport();
        let mut subscription = transport.subscribe().await.unwrap();
        let count = ASYNC_CHANNEL_CAPACITY * 3;

        // Nobody reads while messages arrive.
        time::timeout(Duration::from_secs(1), async {
            for n in 0..count {
                dispatch(&transport.inbound, Message::new("x").id(format!("c2d-{n}"))).await;
            }
        })
        .await
        .unwrap();

        for n in 0..count {
            assert_eq!(subscription.next().await.unwrap().id, format!("c2d-{n}"));
        }
    }

    #[tokio::test]
    async fn detached_subscriber_is_forgotten() {
        let transport = transport();
        let subscription = transport.subscribe().await.unwrap();
        drop(subscription);

        dispatch(&transport.inbound, Message::new("x").id("c2d-1")).await;
        assert!(transport.inbound.lock().await.is_none());
    }
}
