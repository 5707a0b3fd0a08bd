use std::collections::BTreeMap;
use std::str::FromStr;

use bytes::Bytes;

use serde_json::Value;

use crate::error::{Error, Result};

/// Feedback a sender asks for once the message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// No feedback.
    None,
    /// Feedback when the message is completed.
    Positive,
    /// Feedback when the message is rejected or expires.
    Negative,
    /// Both positive and negative feedback.
    Full,
}

impl Acknowledgement {
    /// Returns the wire name of the acknowledgement mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Full => "full",
        }
    }
}

impl FromStr for Acknowledgement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "full" => Ok(Self::Full),
            _ => Err(Error::input(format!(
                "Invalid acknowledgement `{s}`: expected none, positive, negative or full."
            ))),
        }
    }
}

/// A message exchanged with the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message identifier.
    pub id: String,
    /// Message body.
    pub body: Bytes,
    /// Application properties.
    pub properties: BTreeMap<String, String>,
    /// Requested acknowledgement.
    pub ack: Option<Acknowledgement>,
    // Transport token identifying an inbound message when settling it.
    pub(crate) lock_token: Option<String>,
}

impl Message {
    /// Creates a [`Message`] with the given body and a fresh identifier.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            body: body.into(),
            properties: BTreeMap::new(),
            ack: None,
            lock_token: None,
        }
    }

    /// Sets the message identifier.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds an application property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the requested acknowledgement.
    #[must_use]
    pub fn ack(mut self, ack: Acknowledgement) -> Self {
        self.ack = Some(ack);
        self
    }

    #[must_use]
    pub(crate) fn lock_token(mut self, lock_token: impl Into<String>) -> Self {
        self.lock_token = Some(lock_token.into());
        self
    }

    /// Builds a [`Message`] from a command-line argument.
    ///
    /// A JSON object with a `data` field is interpreted as a structured
    /// message: `data` is the body, while the optional `messageId`,
    /// `properties` and `ack` fields fill in the remaining fields.
    /// Any other argument is used verbatim as the body.
    ///
    /// # Errors
    ///
    /// The structured message contains an invalid `ack` value.
    pub fn from_argument(argument: &str) -> Result<Self> {
        let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(argument) else {
            return Ok(Self::new(argument.to_owned()));
        };

        let Some(data) = object.remove("data") else {
            return Ok(Self::new(argument.to_owned()));
        };

        let body = match data {
            Value::String(data) => data,
            data => data.to_string(),
        };
        let mut message = Self::new(body);

        if let Some(Value::String(id)) = object.remove("messageId")
            && !id.is_empty()
        {
            message.id = id;
        }

        if let Some(Value::Object(properties)) = object.remove("properties") {
            for (key, value) in properties {
                let value = match value {
                    Value::String(value) => value,
                    value => value.to_string(),
                };
                let _ = message.properties.insert(key, value);
            }
        }

        if let Some(Value::String(ack)) = object.remove("ack") {
            message.ack = Some(ack.parse()?);
        }

        Ok(message)
    }

    /// Returns the body as pretty-printed JSON when it is valid JSON,
    /// as lossy UTF-8 text otherwise.
    #[must_use]
    pub fn render_body(&self) -> String {
        serde_json::from_slice::<Value>(&self.body)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).into_owned())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "==================")?;
        writeln!(f, "Message received: {}", self.id)?;
        writeln!(f, "{}", self.render_body())?;
        if !self.properties.is_empty() {
            writeln!(f, "--- properties ---")?;
            for (key, value) in &self.properties {
                writeln!(f, "{key}: {value}")?;
            }
        }
        write!(f, "==================")
    }
}
