//! `hubsim` simulates a device connected to a cloud IoT hub.
//!
//! The simulated device can send telemetry at a fixed interval, receive and
//! settle cloud-to-device messages, and upload a file, all at the same time
//! over a single connection. The tool exits once every requested activity
//! is over, or when interrupted with `Ctrl-C`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use tokio_util::sync::CancellationToken;

use tracing::{Level, error, info};

use hubsim::config::{
    DEFAULT_SEND_INTERVAL, DeviceSource, Protocol, ReceiveConfig, SendConfig, Settlement,
    SimulationConfig, UploadConfig,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Arguments(#[source] hubsim::error::Error),
    #[error("{0}")]
    Simulation(#[from] hubsim::error::Error),
    #[error("Impossible to listen for Ctrl-C: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Mqtt,
    Http,
}

impl From<ProtocolArg> for Protocol {
    fn from(protocol: ProtocolArg) -> Self {
        match protocol {
            ProtocolArg::Mqtt => Self::Mqtt,
            ProtocolArg::Http => Self::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SettleArg {
    Complete,
    Abandon,
    Reject,
}

impl From<SettleArg> for Settlement {
    fn from(settle: SettleArg) -> Self {
        match settle {
            SettleArg::Complete => Self::Complete,
            SettleArg::Abandon => Self::Abandon,
            SettleArg::Reject => Self::Reject,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "hubsim", version)]
#[command(about = "Simulate a device connected to an IoT hub", long_about = None)]
struct Cli {
    /// Identifier of the device to simulate, looked up in the hub registry.
    ///
    /// Requires the hub connection string, and takes priority over the
    /// device connection string.
    device_id: Option<String>,

    /// Connection string of the device to simulate, when no device
    /// identifier is given.
    #[arg(long, short = 'c')]
    device_connection_string: Option<String>,

    /// Connection string of the IoT hub, used to look up the device.
    #[arg(long, short = 'l', env = "IOTHUB_CONNECTION_STRING", hide_env_values = true)]
    login: Option<String>,

    /// Protocol used to connect to the IoT hub.
    #[arg(long, value_enum, default_value_t = ProtocolArg::Mqtt)]
    protocol: ProtocolArg,

    /// Send a message, or a default one when no message is given.
    ///
    /// A JSON object with a `data` field may also carry the `messageId`,
    /// `properties` and `ack` fields.
    #[arg(long, short = 's', value_name = "MESSAGE")]
    send: Option<Option<String>>,

    /// Interval between two sends, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = millis(DEFAULT_SEND_INTERVAL))]
    send_interval: u64,

    /// Number of messages to send. Unbounded when absent.
    #[arg(long)]
    send_count: Option<u64>,

    /// Receive cloud-to-device messages.
    #[arg(long, short = 'r')]
    receive: bool,

    /// Number of messages to receive. Unbounded when absent.
    #[arg(long)]
    receive_count: Option<u64>,

    /// Action applied to every received message.
    #[arg(long, value_enum, default_value_t = SettleArg::Complete)]
    settle: SettleArg,

    /// Upload a file.
    #[arg(long, short = 'u', value_name = "PATH")]
    upload_file: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Cli {
    fn config(&self) -> Result<SimulationConfig, CliError> {
        let device = DeviceSource::from_arguments(
            self.device_connection_string.as_deref(),
            self.device_id.as_deref(),
            self.login.as_deref(),
        )
        .map_err(CliError::Arguments)?;

        let mut config = SimulationConfig::new(device).protocol(self.protocol.into());

        if let Some(message) = &self.send {
            config = config.send(SendConfig {
                message: message.clone(),
                interval: Duration::from_millis(self.send_interval),
                count: self.send_count,
            });
        }

        if self.receive {
            config = config.receive(ReceiveConfig {
                settlement: self.settle.into(),
                count: self.receive_count,
            });
        }

        if let Some(path) = &self.upload_file {
            config = config.upload(UploadConfig { path: path.clone() });
        }

        config
            .validate(config.protocol.capabilities())
            .map_err(CliError::Arguments)?;

        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.config()?;

    let cancellation_token = CancellationToken::new();
    let interrupt = cancellation_token.clone();
    let signal = tokio::spawn(async move {
        let result = tokio::signal::ctrl_c().await;
        if result.is_ok() {
            info!("Ctrl-C received, stopping the simulation");
            interrupt.cancel();
        }
        result
    });

    let result = hubsim::simulate(config, cancellation_token.clone()).await;

    // A failed signal handler interrupts nothing, but it is still reported.
    if signal.is_finished()
        && let Ok(Err(e)) = signal.await
    {
        return Err(CliError::Signal(e));
    }

    result.map_err(CliError::from)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
