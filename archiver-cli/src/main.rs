//! Entry point: parses the command line, loads configuration, logs in,
//! and hands off to the orchestrator. Fatal errors are rendered with
//! `miette`'s graphical handler, then the process exits non-zero.

mod config;
mod error;
mod files;
mod orchestrator;
mod stems;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_client::ServerClient;
use clap::Parser;
use config::Config;
use error::AppError;

/// Creates a local history dump of a Mattermost-style server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file. If omitted, `mattermost-archiver.toml` in the
    /// current directory is used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server instance, overriding `connection.hostname`.
    #[arg(short, long)]
    server: Option<String>,

    /// Username, overriding `connection.username`.
    #[arg(short, long)]
    user: Option<String>,

    /// Password, overriding `connection.password`. Prefer an access token
    /// or the `MATTERMOST_PASSWORD` environment variable instead of
    /// passing a password on the command line.
    #[arg(short, long)]
    pass: Option<String>,

    /// Access token, overriding `connection.token`.
    #[arg(short, long)]
    token: Option<String>,

    /// Verbose logging.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn setup_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn diagnostic_to_string(err: &(dyn miette::Diagnostic + 'static)) -> String {
    let handler = miette::GraphicalReportHandler::new_themed(miette::GraphicalTheme::unicode_nocolor());
    let mut message = String::new();
    handler
        .render_report(&mut message, err)
        .expect("formatting into a String buffer can't fail");
    message
}

async fn run(cli: Cli, cancelled: Arc<AtomicBool>) -> Result<(), AppError> {
    let mut config = Config::load(cli.config.as_ref())?;

    if let Some(server) = cli.server {
        config.connection.hostname = server;
    }
    if let Some(user) = cli.user {
        config.connection.username = user;
    }
    if let Some(pass) = cli.pass {
        config.connection.password = pass;
    }
    if let Some(token) = cli.token {
        config.connection.token = token;
    }

    let http = reqwest::Client::builder()
        .build()
        .map_err(|source| archive_client::ClientError::RequestBuild {
            endpoint: config.connection.hostname.clone(),
            source,
        })?;
    let throttle = Duration::from_millis(config.throttling_loop_delay_ms);
    let base_url = format!("{}/api/v4", config.connection.hostname.trim_end_matches('/'));
    let mut client = ServerClient::new(base_url, http, throttle);

    if !config.connection.token.is_empty() {
        client.set_token(config.connection.token.clone());
    } else {
        client.login(&config.connection.username, &config.connection.password).await?;
    }
    client.load_local_user(&config.connection.username).await?;

    orchestrator::run(&mut client, &config, &|| cancelled.load(Ordering::SeqCst)).await
}

/// Ctrl-C does not abort the run in flight: it flips a flag that the
/// orchestrator polls at its own suspension points, so the current HTTP
/// request is allowed to finish and the in-progress channel gets its usual
/// rollback treatment before the process exits. A second Ctrl-C forces an
/// immediate exit for anyone who really wants out.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    setup_logging(&cli);

    let cancelled = Arc::new(AtomicBool::new(false));
    let watcher_flag = cancelled.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if watcher_flag.swap(true, Ordering::SeqCst) {
                log::warn!("second interrupt received, exiting immediately");
                std::process::exit(130);
            }
            log::warn!("interrupt received, finishing the in-progress channel before exiting");
        }
    });

    let result = run(cli, cancelled).await;

    if let Err(err) = result {
        eprintln!("{}", diagnostic_to_string(&err));
        std::process::exit(1);
    }
}
