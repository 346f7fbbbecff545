use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zengo::config::{self, Overrides};
use zengo::models::{db::DB, zendesk_api::ZendeskClient};
use zengo::processor::Processor;
use zengo::server::{self, AppState};
use zengo::service::SyncService;
use zengo::signals::{LogReceiver, Signals};

/// ----------------------------------------------------------------------
/// 1  Command line
/// ----------------------------------------------------------------------
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// YAML config file
    #[arg(long, env = "ZENGO_CONFIG", default_value = "config.yml")]
    config: PathBuf,

    /// Zendesk agent email the API token belongs to
    #[arg(long, env = "ZENDESK_EMAIL")]
    email: Option<String>,

    /// Zendesk API token
    #[arg(long, env = "ZENDESK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Zendesk subdomain, as in https://<subdomain>.zendesk.com
    #[arg(long, env = "ZENDESK_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Shared secret expected in the webhook url
    #[arg(long, env = "ZENGO_WEBHOOK_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// sqlx database url, e.g. sqlite://zengo.db
    #[arg(long, env = "ZENGO_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive webhooks (default)
    Serve {
        /// Port (Default 8000)
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
    /// Sync one ticket now and dispatch its signal
    Sync { ticket_id: i64 },
}

/// ----------------------------------------------------------------------
/// 2  Startup
/// ----------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a) Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // b) CLI + config
    let cli = Cli::parse();
    config::init(
        &cli.config,
        Overrides {
            email: cli.email,
            token: cli.token,
            subdomain: cli.subdomain,
            secret: cli.secret,
            db_path: cli.db,
        },
    )?;
    let config = config::get();

    // c) Processor: store, Zendesk client, receivers
    let db = DB::new(&config.db_path).await?;
    let service = SyncService::new(Arc::new(ZendeskClient::new(&config.zendesk)));
    let signals = Signals::new().connect(Arc::new(LogReceiver));
    info!("{} signal receivers connected", signals.len());
    let processor = Processor::new(db, service, signals);

    match cli.command.unwrap_or(Command::Serve { port: 8000 }) {
        Command::Serve { port } => serve(processor, port).await,
        Command::Sync { ticket_id } => match processor.sync_ticket_id(ticket_id).await {
            Ok(signal) => {
                info!("Ticket {} synced, sent {}", ticket_id, signal.name());
                Ok(())
            }
            Err(error) => {
                error!(%error, "sync of ticket {} failed", ticket_id);
                Err(error.into())
            }
        },
    }
}

async fn serve(processor: Processor, port: u16) -> anyhow::Result<()> {
    let config = config::get();
    let state = AppState {
        processor,
        secret: config.webhook.secret.clone(),
    };
    let app = server::router(state, &config.webhook.path);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{addr}{}", config.webhook.path);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
