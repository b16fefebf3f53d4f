use anyhow::Context;
use clap::Parser;
use duet_relay::{
    cli::{self, Cli, Commands, ServeArgs},
    open_store, serve, Config,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Quiet by default; RUST_LOG turns on request tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Inspect {
            url,
            session,
            action,
        }) => cli::run_inspect(url, session, action).await,
        Some(Commands::Serve(args)) => run_server(args).await,
        None => run_server(ServeArgs::default()).await,
    };

    if let Err(err) = result {
        error!("{:#}", err);
        eprintln!("duet-relay: {:#}", err);
        std::process::exit(1);
    }
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.apply(Config::from_env());
    info!(
        port = config.port,
        offer_ttl = config.offer_ttl_seconds,
        answer_ttl = config.answer_ttl_seconds,
        "starting duet relay"
    );

    let store = open_store(&config)
        .await
        .context("failed to open signaling store")?;
    info!(backend = store.backend_name(), "signaling store ready");

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    serve(listener, &config, store, shutdown_signal())
        .await
        .context("relay server failed")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
