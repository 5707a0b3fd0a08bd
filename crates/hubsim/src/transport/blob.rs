use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Body, Client};

use serde::{Deserialize, Serialize};

use tokio_util::io::ReaderStream;

use tracing::{debug, error};

use url::Url;

use crate::connection_string::DeviceConnectionString;
use crate::error::{Error, Result};
use crate::sas::device_token;

use super::{Endpoint, UploadSource};

const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
const BLOCK_BLOB: &str = "BlockBlob";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    blob_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    correlation_id: String,
    host_name: String,
    container_name: String,
    blob_name: String,
    sas_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadNotification<'a> {
    correlation_id: &'a str,
    is_success: bool,
    status_code: u16,
    status_description: String,
}

/// Uploads files through the hub file-upload endpoints.
///
/// An upload is a three-step exchange:
///
/// 1. Ask the hub for a storage location and a short-lived SAS token
/// 2. Stream the file to storage as a block blob
/// 3. Notify the hub of the outcome
#[derive(Debug, Clone)]
pub(crate) struct BlobUploader {
    client: Client,
    endpoint: Endpoint,
}

impl BlobUploader {
    pub(crate) const fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }

    pub(crate) async fn upload(
        &self,
        connection_string: &DeviceConnectionString,
        name: &str,
        source: UploadSource,
    ) -> Result<()> {
        let token = device_token(connection_string)?;
        let device_id = connection_string.device_id.as_str();

        let target: UploadTarget = self
            .client
            .post(self.endpoint.url(&["devices", device_id, "files"], None))
            .header(AUTHORIZATION, &token)
            .json(&UploadRequest { blob_name: name })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(
            "Uploading `{name}` to container `{}` as `{}`",
            target.container_name, target.blob_name
        );

        let blob_url = self.blob_url(&target)?;
        let outcome = self
            .client
            .put(blob_url)
            .header(BLOB_TYPE_HEADER, BLOCK_BLOB)
            .header(CONTENT_LENGTH, source.size)
            .body(Body::wrap_stream(ReaderStream::new(source.file)))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        let notification = match &outcome {
            Ok(response) => UploadNotification {
                correlation_id: &target.correlation_id,
                is_success: true,
                status_code: response.status().as_u16(),
                status_description: "Upload completed".into(),
            },
            Err(e) => UploadNotification {
                correlation_id: &target.correlation_id,
                is_success: false,
                status_code: e.status().map_or(500, |status| status.as_u16()),
                status_description: e.to_string(),
            },
        };

        if let Err(e) = self
            .client
            .post(
                self.endpoint
                    .url(&["devices", device_id, "files", "notifications"], None),
            )
            .header(AUTHORIZATION, &token)
            .json(&notification)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            error!("Impossible to notify the hub about the upload of `{name}`: {e}");
        }

        outcome
            .map(|_| ())
            .map_err(|e| Error::service(format!("Blob storage refused `{name}`: {e}")))
    }

    fn blob_url(&self, target: &UploadTarget) -> Result<Url> {
        let url = format!(
            "{}://{}/{}/{}{}",
            self.endpoint.scheme(),
            target.host_name,
            target.container_name,
            target.blob_name,
            target.sas_token
        );
        Url::parse(&url).map_err(|e| Error::service(format!("Invalid blob address `{url}`: {e}")))
    }
}
