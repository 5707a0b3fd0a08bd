use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use url::form_urlencoded::byte_serialize;

use crate::connection_string::{DeviceConnectionString, DeviceCredentials, HubConnectionString};
use crate::error::{Error, Result};

/// Default validity of a generated token.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(3600);

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Seconds since the Unix epoch after which a token created now
/// with the given validity expires.
#[must_use]
pub fn expiry_from_now(validity: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(validity)
        .as_secs()
}

/// Signs a shared access token for `resource_uri` with a base64 `key`.
///
/// # Errors
///
/// The key is not valid base64.
pub fn sign(resource_uri: &str, key: &str, key_name: Option<&str>, expiry: u64) -> Result<String> {
    let decoded_key = STANDARD
        .decode(key)
        .map_err(|e| Error::input(format!("The shared access key is not valid base64: {e}")))?;

    let encoded_uri = encode(resource_uri);
    let to_sign = format!("{encoded_uri}\n{expiry}");

    let mut mac = Hmac::<Sha256>::new_from_slice(&decoded_key)
        .map_err(|e| Error::input(format!("Invalid shared access key: {e}")))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        encode(&signature)
    );
    if let Some(key_name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode(key_name));
    }
    Ok(token)
}

/// Returns the token a device presents to the hub.
///
/// A pre-issued signature is returned as is, otherwise a fresh token
/// valid for [`DEFAULT_TOKEN_VALIDITY`] is signed.
///
/// # Errors
///
/// The device key is not valid base64.
pub fn device_token(connection_string: &DeviceConnectionString) -> Result<String> {
    device_token_until(connection_string, expiry_from_now(DEFAULT_TOKEN_VALIDITY))
}

/// Returns the token a device presents to the hub, expiring at `expiry`
/// seconds since the Unix epoch.
///
/// A pre-issued signature is returned as is and keeps its own expiry.
///
/// # Errors
///
/// The device key is not valid base64.
pub fn device_token_until(connection_string: &DeviceConnectionString, expiry: u64) -> Result<String> {
    match &connection_string.credentials {
        DeviceCredentials::SharedAccessSignature(token) => Ok(token.clone()),
        DeviceCredentials::SharedAccessKey(key) => sign(
            &format!(
                "{}/devices/{}",
                connection_string.host_name, connection_string.device_id
            ),
            key,
            None,
            expiry,
        ),
    }
}

/// Returns a token for the hub service endpoints signed with the
/// shared access policy of the connection string.
///
/// # Errors
///
/// The policy key is not valid base64.
pub fn hub_token(connection_string: &HubConnectionString) -> Result<String> {
    sign(
        &connection_string.host_name,
        &connection_string.key,
        Some(&connection_string.key_name),
        expiry_from_now(DEFAULT_TOKEN_VALIDITY),
    )
}
