use clap::Parser;
use env_logger::Env;
use rlmachine_dashboard::EngineArgs;

/// Headless live-state client for the RL Machine trading dashboard.
///
/// Reads operator commands from stdin: a command kind (`PAUSE`), a JSON
/// command object, `status`, or `token [value]`.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Static WebSocket address used when discovery is off or fails.
    #[arg(long, env = "RLM_WS_URL")]
    ws_url: Option<String>,

    /// Credential sent as the first frame after connecting.
    #[arg(long, env = "RLM_WS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base URL of the address lookup service.
    #[arg(long, env = "RLM_DISCOVERY_URL")]
    discovery_url: Option<String>,

    #[arg(long, env = "RLM_DISCOVERY_KEY", hide_env_values = true)]
    discovery_key: Option<String>,

    #[arg(long, env = "RLM_SERVICE_NAME")]
    service_name: Option<String>,

    /// Prefer the published wss:// address.
    #[arg(long, env = "RLM_SECURE")]
    secure: Option<bool>,

    #[arg(long, env = "RLM_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: Option<u64>,

    #[arg(long, env = "RLM_DISCOVERY_TIMEOUT_MS")]
    discovery_timeout_ms: Option<u64>,

    #[arg(long, env = "RLM_AUTH_TIMEOUT_MS")]
    auth_timeout_ms: Option<u64>,

    /// Timeframe assigned to models that load without one.
    #[arg(long, env = "RLM_DEFAULT_TIMEFRAME")]
    default_timeframe: Option<String>,
}

impl From<Cli> for EngineArgs {
    fn from(cli: Cli) -> Self {
        EngineArgs {
            fallback_url: cli.ws_url,
            credential: cli.token,
            discovery_url: cli.discovery_url,
            discovery_key: cli.discovery_key,
            service_name: cli.service_name,
            secure_transport: cli.secure,
            reconnect_delay_ms: cli.reconnect_delay_ms,
            discovery_timeout_ms: cli.discovery_timeout_ms,
            auth_timeout_ms: cli.auth_timeout_ms,
            default_timeframe: cli.default_timeframe,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = EngineArgs::from(Cli::parse());
    if let Err(error) = rlmachine_dashboard::run(args).await {
        log::error!("{error}");
        std::process::exit(1);
    }
}
