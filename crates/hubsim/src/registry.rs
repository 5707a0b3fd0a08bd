use reqwest::Client;
use reqwest::header::AUTHORIZATION;

use serde::Deserialize;

use tracing::debug;

use crate::connection_string::{DeviceConnectionString, HubConnectionString};
use crate::error::{Error, Result};
use crate::sas::hub_token;
use crate::transport::Endpoint;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymmetricKey {
    primary_key: Option<String>,
    secondary_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authentication {
    symmetric_key: Option<SymmetricKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceIdentity {
    device_id: String,
    #[serde(default)]
    authentication: Authentication,
}

impl DeviceIdentity {
    fn key(self) -> Option<String> {
        let SymmetricKey {
            primary_key,
            secondary_key,
        } = self.authentication.symmetric_key?;

        primary_key
            .filter(|key| !key.is_empty())
            .or_else(|| secondary_key.filter(|key| !key.is_empty()))
    }
}

/// A client for the hub device registry.
///
/// It only resolves device identifiers into device connection strings.
#[derive(Debug)]
pub struct Registry {
    hub: HubConnectionString,
    endpoint: Endpoint,
    client: Client,
}

impl Registry {
    /// Creates a [`Registry`] client from a hub connection string.
    ///
    /// # Errors
    ///
    /// The hub host name is not a valid address or the HTTP client cannot
    /// be built.
    pub fn new(hub: HubConnectionString) -> Result<Self> {
        let endpoint = Endpoint::https(&hub.host_name)?;
        Self::with_endpoint(hub, endpoint)
    }

    pub(crate) fn with_endpoint(hub: HubConnectionString, endpoint: Endpoint) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::service(format!("Impossible to build the HTTP client: {e}")))?;
        Ok(Self {
            hub,
            endpoint,
            client,
        })
    }

    /// Looks up a device and builds its connection string.
    ///
    /// # Errors
    ///
    /// - The registry cannot be reached or does not know the device
    /// - The device does not use symmetric key authentication
    pub async fn lookup(&self, device_id: &str) -> Result<DeviceConnectionString> {
        debug!("Looking up device `{device_id}` in the registry");

        let device: DeviceIdentity = self
            .client
            .get(self.endpoint.url(&["devices", device_id], None))
            .header(AUTHORIZATION, hub_token(&self.hub)?)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::service(format!("Could not get device `{device_id}`: {e}")))?
            .json()
            .await?;

        let id = device.device_id.clone();
        let key = device.key().ok_or_else(|| {
            Error::input(format!(
                "Cannot simulate device `{id}`: it does not use symmetric key authentication."
            ))
        })?;

        Ok(DeviceConnectionString::with_key(
            &self.hub.host_name,
            &id,
            &key,
        ))
    }
}
