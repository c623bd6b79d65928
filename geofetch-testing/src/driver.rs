use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use geofetch_logic::{
    Accuracy, AuthorizationMode, AuthorizationStatus, Location, LocatorSettings, ProviderError,
    RefreshInterval, RequestId,
};
use geofetch_test_shared::{
    ProviderRequest, TestingRequest, TestingResponse, get_socket_name, prelude::*,
};
use interprocess::local_socket::{tokio::Stream, traits::tokio::Stream as _};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
struct Cli {
    /// Name of the local socket the test daemon is listening on
    socket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AccuracyValue {
    Best,
    TenMeters,
    HundredMeters,
    Kilometer,
    ThreeKilometers,
}

impl From<AccuracyValue> for Accuracy {
    fn from(value: AccuracyValue) -> Self {
        match value {
            AccuracyValue::Best => Accuracy::Best,
            AccuracyValue::TenMeters => Accuracy::NEAREST_TEN_METERS,
            AccuracyValue::HundredMeters => Accuracy::HUNDRED_METERS,
            AccuracyValue::Kilometer => Accuracy::KILOMETER,
            AccuracyValue::ThreeKilometers => Accuracy::THREE_KILOMETERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeValue {
    Always,
    WhenInUse,
}

impl From<ModeValue> for AuthorizationMode {
    fn from(value: ModeValue) -> Self {
        match value {
            ModeValue::Always => AuthorizationMode::Always,
            ModeValue::WhenInUse => AuthorizationMode::WhenInUse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DecisionValue {
    Always,
    WhenInUse,
    Denied,
    Restricted,
}

impl From<DecisionValue> for AuthorizationStatus {
    fn from(value: DecisionValue) -> Self {
        match value {
            DecisionValue::Always => AuthorizationStatus::Granted(AuthorizationMode::Always),
            DecisionValue::WhenInUse => AuthorizationStatus::Granted(AuthorizationMode::WhenInUse),
            DecisionValue::Denied => AuthorizationStatus::Denied,
            DecisionValue::Restricted => AuthorizationStatus::Restricted,
        }
    }
}

#[derive(Subcommand)]
enum ProviderCommand {
    /// Deliver a location fix
    Fix {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        long: f64,
        /// Accuracy radius in meters
        accuracy: f64,
    },
    /// Report the hardware as unavailable
    Unavailable,
    /// Report a generic provider failure
    Fail { message: String },
    /// Answer the authorization prompt (or revoke it)
    Authorize {
        #[arg(value_enum)]
        decision: DecisionValue,
    },
}

impl From<ProviderCommand> for ProviderRequest {
    fn from(value: ProviderCommand) -> Self {
        match value {
            ProviderCommand::Fix {
                lat,
                long,
                accuracy,
            } => ProviderRequest::Fix(Location::new(lat, long, accuracy)),
            ProviderCommand::Unavailable => ProviderRequest::Error(ProviderError::Unavailable),
            ProviderCommand::Fail { message } => {
                ProviderRequest::Error(ProviderError::Other(message))
            }
            ProviderCommand::Authorize { decision } => {
                ProviderRequest::Authorization(decision.into())
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh the location and wait for the outcome
    Refresh {
        #[arg(value_enum)]
        accuracy: Option<AccuracyValue>,
    },
    /// Start a fetch that only warms the cache
    Fetch {
        #[arg(value_enum)]
        accuracy: Option<AccuracyValue>,
    },
    /// Cancel a pending refresh
    Cancel { id: RequestId },
    /// Ask for authorization and wait for the answer
    Authorize,
    /// Replace the locator's settings
    Configure {
        /// Timeout for a fetch in milliseconds
        #[arg(long, default_value_t = 4000)]
        timeout_ms: u64,
        /// How long a cached fix stays fresh in milliseconds, always fetch if omitted
        #[arg(long)]
        refresh_ms: Option<u64>,
        /// Don't ask for authorization when a fetch needs it
        #[arg(long)]
        no_auto_authorize: bool,
        #[arg(long, value_enum, default_value_t = ModeValue::Always)]
        mode: ModeValue,
        #[arg(long, value_enum, default_value_t = AccuracyValue::HundredMeters)]
        accuracy: AccuracyValue,
    },
    /// Print the locator's current state
    Status,
    /// Inject an event from the simulated provider
    #[command(subcommand)]
    Provider(ProviderCommand),
}

impl From<Commands> for TestingRequest {
    fn from(value: Commands) -> Self {
        match value {
            Commands::Refresh { accuracy } => TestingRequest::Refresh(accuracy.map(Into::into)),
            Commands::Fetch { accuracy } => TestingRequest::Fetch(accuracy.map(Into::into)),
            Commands::Cancel { id } => TestingRequest::Cancel(id),
            Commands::Authorize => TestingRequest::RequestAuthorization,
            Commands::Configure {
                timeout_ms,
                refresh_ms,
                no_auto_authorize,
                mode,
                accuracy,
            } => TestingRequest::UpdateSettings(LocatorSettings {
                timeout: Duration::from_millis(timeout_ms),
                refresh_interval: refresh_ms
                    .map(|ms| RefreshInterval::Every(Duration::from_millis(ms)))
                    .unwrap_or_default(),
                auto_request_authorization: !no_auto_authorize,
                authorization_mode: mode.into(),
                default_accuracy: accuracy.into(),
            }),
            Commands::Status => TestingRequest::Status,
            Commands::Provider(cmd) => ProviderRequest::from(cmd).into(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result {
    let cli = Cli::parse();

    let socket_name = get_socket_name(cli.socket.clone()).context("Failed to get socket name")?;

    let stream = Stream::connect(socket_name)
        .await
        .context("Failed to connect to socket")?;

    let req = TestingRequest::from(cli.command);
    let mut encoded = serde_json::to_vec(&req).context("Failed to encode request")?;
    encoded.push(b'\n');
    let mut send = &stream;
    send.write_all(&encoded)
        .await
        .context("Failed to send request")?;

    let mut recv = BufReader::new(&stream);
    let mut line = String::with_capacity(256);

    loop {
        line.clear();
        let read = recv
            .read_line(&mut line)
            .await
            .context("Failed to read response")?;
        if read == 0 {
            bail!("Daemon closed the connection");
        }

        let resp: TestingResponse =
            serde_json::from_str(&line).context("Failed to parse response")?;
        println!("{}", serde_json::to_string_pretty(&resp)?);

        match resp {
            TestingResponse::Error(msg) => bail!("Daemon reported an error: {msg}"),
            resp if resp.is_pending() => continue,
            _ => break,
        }
    }

    Ok(())
}
