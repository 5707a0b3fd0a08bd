use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

const HOST_NAME: &str = "HostName";
const DEVICE_ID: &str = "DeviceId";
const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
const SHARED_ACCESS_SIGNATURE: &str = "SharedAccessSignature";

// Splits `Key=Value;Key=Value` pairs. Values may contain `=`, as base64 keys do.
fn parse_pairs(input: &str) -> Result<HashMap<&str, &str>> {
    let mut pairs = HashMap::new();
    for segment in input.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            Error::input(format!(
                "Malformed connection string segment `{segment}`: expected `Key=Value`."
            ))
        })?;
        let _ = pairs.insert(key.trim(), value.trim());
    }
    Ok(pairs)
}

fn required<'a>(pairs: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str> {
    pairs
        .get(key)
        .copied()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::input(format!("The connection string does not contain `{key}`.")))
}

/// Credentials a device presents to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCredentials {
    /// A base64 symmetric key used to sign shared-access tokens.
    SharedAccessKey(String),
    /// A pre-issued shared-access token, used as is.
    SharedAccessSignature(String),
}

/// A parsed device connection string.
///
/// `HostName=<host>;DeviceId=<id>;SharedAccessKey=<key>` or
/// `HostName=<host>;DeviceId=<id>;SharedAccessSignature=<token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnectionString {
    /// Hub host name.
    pub host_name: String,
    /// Device identifier.
    pub device_id: String,
    /// Device credentials.
    pub credentials: DeviceCredentials,
}

impl DeviceConnectionString {
    /// Builds a connection string for a device authenticated with a
    /// symmetric key.
    #[must_use]
    pub fn with_key(host_name: &str, device_id: &str, key: &str) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            credentials: DeviceCredentials::SharedAccessKey(key.into()),
        }
    }
}

impl FromStr for DeviceConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let pairs = parse_pairs(s)?;

        let host_name = required(&pairs, HOST_NAME)?.to_owned();
        let device_id = required(&pairs, DEVICE_ID)?.to_owned();

        let credentials = if let Ok(key) = required(&pairs, SHARED_ACCESS_KEY) {
            DeviceCredentials::SharedAccessKey(key.to_owned())
        } else if let Ok(token) = required(&pairs, SHARED_ACCESS_SIGNATURE) {
            DeviceCredentials::SharedAccessSignature(token.to_owned())
        } else {
            return Err(Error::input(format!(
                "The device connection string must contain either `{SHARED_ACCESS_KEY}` or `{SHARED_ACCESS_SIGNATURE}`."
            )));
        };

        Ok(Self {
            host_name,
            device_id,
            credentials,
        })
    }
}

impl std::fmt::Display for DeviceConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{HOST_NAME}={};{DEVICE_ID}={};",
            self.host_name, self.device_id
        )?;
        match &self.credentials {
            DeviceCredentials::SharedAccessKey(key) => write!(f, "{SHARED_ACCESS_KEY}={key}"),
            DeviceCredentials::SharedAccessSignature(token) => {
                write!(f, "{SHARED_ACCESS_SIGNATURE}={token}")
            }
        }
    }
}

/// A parsed hub connection string, carrying a shared access policy.
///
/// `HostName=<host>;SharedAccessKeyName=<policy>;SharedAccessKey=<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConnectionString {
    /// Hub host name.
    pub host_name: String,
    /// Shared access policy name.
    pub key_name: String,
    /// Shared access policy key.
    pub key: String,
}

impl FromStr for HubConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let pairs = parse_pairs(s)?;
        Ok(Self {
            host_name: required(&pairs, HOST_NAME)?.to_owned(),
            key_name: required(&pairs, SHARED_ACCESS_KEY_NAME)?.to_owned(),
            key: required(&pairs, SHARED_ACCESS_KEY)?.to_owned(),
        })
    }
}
