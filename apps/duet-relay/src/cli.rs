use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "duet-relay")]
#[command(about = "Duet signaling relay and inspection client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve(ServeArgs),

    /// Look at a session held by a running relay
    Inspect {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Session ID to inspect
        #[arg(short, long)]
        session: String,

        #[command(subcommand)]
        action: InspectAction,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Listen port (overrides DUET_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Listen address (overrides DUET_RELAY_BIND)
    #[arg(long)]
    pub bind: Option<String>,

    /// Redis URL; omit to keep records in memory (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,
}

impl ServeArgs {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(url) = self.redis_url {
            config.redis_url = Some(url);
        }
        config
    }
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum InspectAction {
    /// Show the published offer without consuming it
    Offer,
    /// Consume the answer, retiring the session
    Answer,
    /// Delete the session and any answer
    Delete,
}

impl InspectAction {
    fn route(self) -> (Method, &'static str) {
        match self {
            InspectAction::Offer => (Method::GET, "signaling/get"),
            InspectAction::Answer => (Method::GET, "signaling/get-answer"),
            InspectAction::Delete => (Method::DELETE, "signaling/delete"),
        }
    }
}

pub async fn run_inspect(url: String, session: String, action: InspectAction) -> Result<()> {
    let (method, path) = action.route();
    let endpoint = format!("{}/{}", url.trim_end_matches('/'), path);
    debug!(%endpoint, session = %session, ?action, "inspecting relay");

    let response = reqwest::Client::new()
        .request(method, &endpoint)
        .query(&[("sessionId", session.as_str())])
        .send()
        .await
        .with_context(|| format!("failed to reach relay at {}", url))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("relay returned a non-json body")?;
    match status {
        StatusCode::OK => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        _ => Err(anyhow!(
            "relay answered {}: {}",
            status,
            body.get("error")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown error")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn serve_flags_override_environment_config() {
        let cli = Cli::parse_from([
            "duet-relay",
            "serve",
            "--port",
            "9090",
            "--redis-url",
            "redis://cache:6379",
        ]);
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve command");
        };
        let config = args.apply(Config::default());
        assert_eq!(config.port, 9090);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test_timeout::timeout]
    fn no_command_means_serve() {
        let cli = Cli::parse_from(["duet-relay"]);
        assert!(cli.command.is_none());
    }

    #[test_timeout::timeout]
    fn inspect_parses_action() {
        let cli = Cli::parse_from(["duet-relay", "inspect", "--session", "room-42", "answer"]);
        match cli.command {
            Some(Commands::Inspect {
                url,
                session,
                action: InspectAction::Answer,
            }) => {
                assert_eq!(url, "http://localhost:8080");
                assert_eq!(session, "room-42");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
