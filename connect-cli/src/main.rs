//! connect - command line front end for the endpoint client

mod config;

use clap::Parser;
use connect_client::live_reload::websocket_url;
use connect_client::{
    CallOptions, ClientStorage, ConnectClient, ConnectError, ConnectionStatus, Credentials,
    LiveReloadConnection, LiveReloadHandler, LiveReloadMessage, LiveReloadOptions, ReloadNotice,
    StaticCredentials,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{parse_params, Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("connect={},connect_client={},info", log_level, log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let config = match args.client_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Command::LiveReload { url } = &args.command {
        let storage = ClientStorage::open(&config.storage_dir)?;
        return watch_live_reload(url, &storage, config.heartbeat_interval()).await;
    }

    let mut builder = ConnectClient::builder(config.clone());
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        let credentials = Credentials::new(username, password).stay_logged_in(!args.forget_me);
        builder = builder.credentials(Arc::new(StaticCredentials::new(credentials)));
    }
    let client = builder.build()?;
    info!(base_url = %config.base_url, prefix = %config.prefix, "Client ready");

    match args.command {
        Command::Call {
            service,
            method,
            params,
            anonymous,
        } => {
            let options = if anonymous {
                CallOptions::anonymous()
            } else {
                CallOptions::default()
            };
            let params = parse_params(params.as_deref())?;
            let result = client
                .call_with_options(&service, &method, params, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Defer {
            service,
            method,
            params,
        } => {
            let params = parse_params(params.as_deref())?;
            let result = client.deferrable_call(&service, &method, params).await?;
            match (result.result(), result.deferred_call()) {
                (Some(value), _) => println!("{}", serde_json::to_string_pretty(value)?),
                (_, Some(call)) => println!("deferred as #{}", call.id),
                (None, None) => {}
            }
        }
        Command::Drain => match client.process_deferred_calls().await {
            Ok(delivered) => println!("{} call(s) submitted", delivered),
            Err(ConnectError::DeferredCalls(errors)) => {
                for e in &errors {
                    warn!("{}", e);
                }
                anyhow::bail!(
                    "{} call(s) failed, {} still queued",
                    errors.len(),
                    client.queue().len()
                );
            }
            Err(e) => return Err(e.into()),
        },
        Command::Queue { clear } => {
            if clear {
                client.queue().clear()?;
                info!("Queue cleared");
            }
            for call in client.queue().list()? {
                println!(
                    "#{} {}.{} {}",
                    call.id,
                    call.endpoint,
                    call.method,
                    call.params
                        .map(|p| p.to_string())
                        .unwrap_or_default()
                );
            }
        }
        Command::Logout => {
            client.logout().await?;
            println!("logged out");
        }
        Command::LiveReload { .. } => {}
    }

    Ok(())
}

/// Logs every live reload event
struct LogHandler;

impl LiveReloadHandler for LogHandler {
    fn on_handshake(&self) {
        info!("Live reload handshake complete");
    }

    fn on_reload(&self) {
        info!("Reload requested");
    }

    fn on_update(&self, path: &str, content: &str) -> bool {
        info!(path, bytes = content.len(), "Stylesheet update");
        false
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        info!(?status, "Live reload status");
    }

    fn on_connection_error(&self, message: &str) {
        warn!("Live reload unavailable: {}", message);
    }

    fn on_message(&self, message: &LiveReloadMessage) {
        info!(command = %message.command, data = ?message.data, "Live reload message");
    }
}

async fn watch_live_reload(
    url: &str,
    storage: &ClientStorage,
    heartbeat_interval: std::time::Duration,
) -> anyhow::Result<()> {
    let session = storage.session()?;
    if let Some(notice) = ReloadNotice::take(&session)? {
        info!("{}", notice);
    }

    let connection = LiveReloadConnection::open(
        websocket_url(url)?,
        Arc::new(LogHandler),
        LiveReloadOptions {
            heartbeat_interval,
            session: Some(session),
        },
    );
    info!(url = %connection.url(), "Watching live reload");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = connection.closed() => {}
    }
    Ok(())
}
