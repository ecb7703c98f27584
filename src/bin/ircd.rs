//! ircd server entry point.
//!
//! Parses the command line and hands the result to `ircd::server::run`,
//! the same division of labor as the teacher's `src/bin/server.rs`
//! (`Cli::from_args()` feeding `server::run`), swapped from `structopt`
//! to `clap`'s derive macros (the former is deprecated upstream).

use std::fs;

use clap::Parser;
use ircd::acceptor::Acceptor;
use ircd::config::ServerConfig;
use ircd::dcc::{DccLimits, DccRelayEngine};
use ircd::logging;
use ircd::DEFAULT_PORT;

#[derive(Parser)]
#[command(name = "ircd", version, about = "An IRC server with a server-mediated DCC relay")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Server name announced in numeric replies.
    #[arg(long, default_value = "irc.local")]
    nickname: String,

    /// Log file path; supports `%u` (instance) and `%g` (rotation) tokens. Logs go to stderr when omitted.
    #[arg(long)]
    log_file: Option<String>,

    /// `tracing-subscriber` env-filter directive.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Connection password required before registration completes.
    #[arg(long)]
    password: Option<String>,

    /// Path to a message-of-the-day file.
    #[arg(long)]
    motd_file: Option<String>,
}

#[tokio::main]
async fn main() -> ircd::Result<()> {
    let cli = Cli::parse();

    let log_path = cli.log_file.as_deref().map(|p| logging::resolve_log_path(p, 0, 0));
    let _log_guard = logging::init(log_path.as_deref(), &cli.log_level)?;

    let motd = match &cli.motd_file {
        Some(path) => Some(fs::read_to_string(path).map_err(|e| format!("reading motd file {path}: {e}"))?),
        None => None,
    };

    let config = ServerConfig {
        server_name: cli.nickname,
        password: cli.password,
        motd,
        ..ServerConfig::default()
    };

    let acceptor = Acceptor::bind(&cli.host, cli.port).await?;
    tracing::info!(host = %cli.host, port = cli.port, "ircd listening");

    let dcc = DccRelayEngine::start(
        cli.host.clone(),
        DccLimits {
            port_range: config.dcc_port_range,
            pairing_timeout: config.dcc_pairing_timeout,
            idle_ceiling: config.dcc_idle_ceiling,
            shutdown_deadline: config.connection_close_drain,
        },
    );

    ircd::server::run(acceptor, config, dcc, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}
