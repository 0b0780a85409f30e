use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use oauth_session::auth::{
    CredentialPair, CredentialStore, Session, SqliteStore, TokenExchangeClient,
};
use oauth_session::config::{CliArgs, Config};
use oauth_session::utils::mask_token;

/// OAuth session manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Print a valid access token, refreshing if needed
    Token,
    /// Refresh now, even if the cached token is still valid
    Refresh,
    /// Revoke the session's tokens and clear the store
    Revoke,
    /// Show session state and expiry
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists, before clap reads the environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_args(cli.args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let session = open_session(&config).await?;

    match cli.command {
        Command::Token => {
            let token = session
                .get_access_token()
                .await
                .context("Failed to obtain access token")?;
            println!("{}", token);
        }
        Command::Refresh => {
            let token = session
                .force_refresh()
                .await
                .context("Failed to refresh credentials")?;
            tracing::info!("Refreshed (token: {})", mask_token(&token));
            println!("{}", token);
        }
        Command::Revoke => {
            session
                .revoke_tokens()
                .await
                .context("Revocation did not complete cleanly")?;
            println!("revoked");
        }
        Command::Status => {
            println!("identity: {}", session.identity());
            println!("state:    {:?}", session.state());
            if let Some(pair) = session.snapshot() {
                println!("token:    {}", mask_token(&pair.access_token));
                println!(
                    "refresh:  {}",
                    if pair.refresh_token.is_some() { "present" } else { "absent" }
                );
                match pair.expires_at() {
                    Some(exp) => println!("expires:  {}", exp.to_rfc3339()),
                    None => println!("expires:  unknown"),
                }
            }
        }
    }

    Ok(())
}

/// Build the session from the SQLite store, explicit tokens, or client credentials
async fn open_session(config: &Config) -> Result<Session> {
    let exchange = Arc::new(
        TokenExchangeClient::new(config.exchange_settings())
            .context("Failed to create token exchange client")?,
    );

    let mut builder =
        Session::builder(&config.identity, exchange).settings(config.session_settings());

    let store = match &config.db_file {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("Failed to open credential store: {}", path.display()))?;
            Some(Arc::new(store))
        }
        None => None,
    };

    let now = chrono::Utc::now();
    let explicit = match (&config.access_token, &config.refresh_token) {
        (Some(access), refresh) => Some(CredentialPair::new(access.clone(), refresh.clone(), now, None)),
        (None, Some(refresh)) => Some(CredentialPair::from_refresh_token(refresh.clone(), now)),
        (None, None) => None,
    };

    if let Some(store) = store {
        let stored = store
            .read(&config.identity)
            .await
            .context("Failed to read credential store")?;
        builder = builder.store(store);

        return Ok(match (stored, explicit) {
            (Some(pair), _) => {
                tracing::info!("Using stored credentials for '{}'", config.identity);
                builder.build(pair)
            }
            (None, Some(pair)) => builder.build(pair),
            (None, None) => builder.build(client_credentials_pair(config, now)?),
        });
    }

    Ok(match explicit {
        Some(pair) => builder.build(pair),
        None => builder.build(client_credentials_pair(config, now)?),
    })
}

fn client_credentials_pair(
    config: &Config,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<CredentialPair> {
    if config.client_secret.is_none() {
        anyhow::bail!(
            "No credentials available: provide OAUTH_REFRESH_TOKEN, a populated CREDENTIALS_DB_FILE, or OAUTH_CLIENT_SECRET"
        );
    }
    tracing::info!("No stored tokens, using client-credentials grant");
    Ok(CredentialPair::empty(now))
}
