use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::transport::{DeviceTransport, UploadSource};

use super::{Activity, Running, RunningGuard};

async fn upload_file<T: DeviceTransport>(transport: &T, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::input(format!("Invalid file name `{}`", path.display())))?;

    let file = File::open(path).await?;
    let size = file.metadata().await?.len();

    info!("Uploading `{name}` ({size} bytes)");
    transport
        .upload_to_blob(name, UploadSource { file, size })
        .await
}

async fn run_uploader<T: DeviceTransport>(
    transport: Arc<T>,
    path: PathBuf,
    cancellation_token: CancellationToken,
    _running: RunningGuard,
) {
    tokio::select! {
        () = cancellation_token.cancelled() => warn!("Upload cancelled"),
        result = upload_file(transport.as_ref(), &path) => match result {
            Ok(()) => info!("Upload successful"),
            Err(e) => error!("Cannot upload file: {e}"),
        },
    }
}

/// Uploads a single local file.
///
/// The activity stops as soon as the upload ends, whatever its outcome.
/// Cancelling it drops the in-flight upload.
#[derive(Debug)]
pub struct UploadActivity<T: DeviceTransport> {
    transport: Arc<T>,
    config: UploadConfig,
    running: Running,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: DeviceTransport> UploadActivity<T> {
    /// Creates an [`UploadActivity`] over a shared transport.
    #[must_use]
    pub fn new(transport: Arc<T>, config: UploadConfig) -> Self {
        Self {
            transport,
            config,
            running: Running::default(),
            cancellation_token: CancellationToken::new(),
            task: None,
        }
    }
}

impl<T: DeviceTransport> Activity for UploadActivity<T> {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let running = self.running.raise();
        self.task = Some(tokio::spawn(run_uploader(
            self.transport.clone(),
            self.config.path.clone(),
            self.cancellation_token.clone(),
            running,
        )));
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}
