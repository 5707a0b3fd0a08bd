use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::connection_string::{DeviceConnectionString, HubConnectionString};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::Capabilities;

/// Default interval between two sent messages.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(1000);

/// Transport protocol used to talk to the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    /// MQTT over TLS. Inbound messages are completed automatically.
    #[default]
    Mqtt,
    /// HTTPS polling.
    Http,
}

impl Protocol {
    /// Returns the wire name of the protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Http => "http",
        }
    }

    /// Returns the capabilities of the transport implementing the protocol.
    #[must_use]
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Mqtt => Capabilities {
                explicit_settlement: false,
            },
            Self::Http => Capabilities {
                explicit_settlement: true,
            },
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mqtt" => Ok(Self::Mqtt),
            "http" => Ok(Self::Http),
            _ => Err(Error::input(format!(
                "Unsupported protocol `{s}`: expected mqtt or http."
            ))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action applied to a received message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Settlement {
    /// Remove the message from the device queue.
    #[default]
    Complete,
    /// Put the message back in the device queue.
    Abandon,
    /// Remove the message and dead-letter it.
    Reject,
}

impl Settlement {
    /// Returns the settlement name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for Settlement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "complete" => Ok(Self::Complete),
            "abandon" => Ok(Self::Abandon),
            "reject" => Ok(Self::Reject),
            _ => Err(Error::input(format!(
                "Invalid settlement `{s}`: expected complete, abandon or reject."
            ))),
        }
    }
}

impl std::fmt::Display for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the device connection string comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSource {
    /// A device connection string given directly.
    ConnectionString(DeviceConnectionString),
    /// A device identifier resolved through the hub registry.
    Registry {
        /// Device identifier.
        device_id: String,
        /// Hub credentials used to query the registry.
        hub: HubConnectionString,
    },
}

impl DeviceSource {
    /// Selects the device source from the raw command-line values.
    ///
    /// A device identifier wins over a device connection string: when
    /// both are given, the device is looked up in the hub registry.
    ///
    /// # Errors
    ///
    /// Neither a device connection string nor a device identifier is
    /// given, a device identifier is given without hub credentials,
    /// or a connection string is malformed.
    pub fn from_arguments(
        device_connection_string: Option<&str>,
        device_id: Option<&str>,
        hub_connection_string: Option<&str>,
    ) -> Result<Self> {
        let Some(device_id) = device_id else {
            return device_connection_string
                .ok_or_else(|| {
                    Error::input(
                        "You must specify either a device connection string (--device-connection-string) \
                         or the IoT hub connection string (--login) and a device id as first argument.",
                    )
                })?
                .parse()
                .map(Self::ConnectionString);
        };

        let Some(hub_connection_string) = hub_connection_string else {
            return Err(Error::input(
                "You must specify the IoT hub connection string (--login) to look up a device id.",
            ));
        };

        Ok(Self::Registry {
            device_id: device_id.to_owned(),
            hub: hub_connection_string.parse()?,
        })
    }
}

/// Send activity configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendConfig {
    /// Message template. When absent, a counter-suffixed default message
    /// is sent.
    pub message: Option<String>,
    /// Interval between two sends.
    pub interval: Duration,
    /// Number of messages to send. `None` means unbounded.
    pub count: Option<u64>,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            message: None,
            interval: DEFAULT_SEND_INTERVAL,
            count: None,
        }
    }
}

/// Receive activity configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveConfig {
    /// Action applied to every received message.
    pub settlement: Settlement,
    /// Number of messages to receive. `None` means unbounded.
    pub count: Option<u64>,
}

/// Upload activity configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Local file to upload.
    pub path: PathBuf,
}

/// The full configuration of a device simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Device connection source.
    pub device: DeviceSource,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Send activity, if enabled.
    pub send: Option<SendConfig>,
    /// Receive activity, if enabled.
    pub receive: Option<ReceiveConfig>,
    /// Upload activity, if enabled.
    pub upload: Option<UploadConfig>,
}

impl SimulationConfig {
    /// Creates a [`SimulationConfig`] with no activity enabled.
    #[must_use]
    pub fn new(device: DeviceSource) -> Self {
        Self {
            device,
            protocol: Protocol::default(),
            send: None,
            receive: None,
            upload: None,
        }
    }

    /// Sets the protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Enables the send activity.
    #[must_use]
    pub fn send(mut self, send: SendConfig) -> Self {
        self.send = Some(send);
        self
    }

    /// Enables the receive activity.
    #[must_use]
    pub fn receive(mut self, receive: ReceiveConfig) -> Self {
        self.receive = Some(receive);
        self
    }

    /// Enables the upload activity.
    #[must_use]
    pub fn upload(mut self, upload: UploadConfig) -> Self {
        self.upload = Some(upload);
        self
    }

    /// Checks the configuration against the capabilities of the transport
    /// that is going to be used.
    ///
    /// # Errors
    ///
    /// - No activity is enabled
    /// - The send interval is zero or the message template is malformed
    /// - The settlement action is not supported by the transport
    /// - The upload file does not exist or cannot be read
    pub fn validate(&self, capabilities: Capabilities) -> Result<()> {
        if self.send.is_none() && self.receive.is_none() && self.upload.is_none() {
            return Err(Error::input(
                "Nothing to do: please use --send, --receive or --upload-file.",
            ));
        }

        if let Some(send) = &self.send {
            if send.interval.is_zero() {
                return Err(Error::input("The send interval must be greater than zero."));
            }
            if let Some(template) = &send.message {
                let _ = Message::from_argument(template)?;
            }
        }

        if let Some(receive) = &self.receive
            && receive.settlement != Settlement::Complete
            && !capabilities.explicit_settlement
        {
            return Err(Error::input(format!(
                "Cannot {} messages with {}: messages are automatically completed.",
                receive.settlement, self.protocol
            )));
        }

        if let Some(upload) = &self.upload {
            check_readable_file(upload)?;
        }

        Ok(())
    }
}

fn check_readable_file(upload: &UploadConfig) -> Result<()> {
    let path = upload.path.display();

    let metadata = std::fs::metadata(&upload.path)
        .map_err(|e| Error::input(format!("Cannot find: {path} ({e})")))?;

    if !metadata.is_file() {
        return Err(Error::input(format!("Cannot upload {path}: not a file")));
    }

    let _ = std::fs::File::open(&upload.path)
        .map_err(|e| Error::input(format!("Cannot read: {path} ({e})")))?;

    Ok(())
}
