//! Command line and environment configuration for `connect`

use clap::{Parser, Subcommand};
use connect_client::{ClientConfig, ClientConfigOverrides};
use std::path::PathBuf;

/// Call server endpoints, manage the offline queue and watch live reload
#[derive(Parser, Debug, Clone)]
#[command(name = "connect")]
#[command(about = "Endpoint client with offline call queue")]
pub struct Args {
    /// TOML file with client settings; flags and environment override it
    #[arg(long, env = "CONNECT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server origin
    #[arg(long, env = "CONNECT_BASE_URL")]
    pub base_url: Option<String>,

    /// Endpoint path prefix
    #[arg(long, env = "CONNECT_PREFIX")]
    pub prefix: Option<String>,

    /// OAuth token endpoint, absolute or relative to the base URL
    #[arg(long, env = "CONNECT_TOKEN_ENDPOINT")]
    pub token_endpoint: Option<String>,

    #[arg(long, env = "CONNECT_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "CONNECT_CLIENT_SECRET")]
    pub client_secret: Option<String>,

    /// Directory of the local database (tokens and deferred calls)
    #[arg(long, env = "CONNECT_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// URL probed to decide whether the server is back
    #[arg(long, env = "CONNECT_PROBE_URL")]
    pub probe_url: Option<String>,

    /// Live reload heartbeat interval in seconds
    #[arg(long, env = "CONNECT_HEARTBEAT_INTERVAL_SECS")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Username for the password grant
    #[arg(long, env = "CONNECT_USERNAME")]
    pub username: Option<String>,

    /// Password for the password grant
    #[arg(long, env = "CONNECT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Do not keep the refresh token after this run
    #[arg(long, env = "CONNECT_FORGET_ME", default_value = "false")]
    pub forget_me: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Call an endpoint method and print the result
    Call {
        service: String,
        method: String,
        /// JSON parameters object
        #[arg(long)]
        params: Option<String>,
        /// Skip login
        #[arg(long)]
        anonymous: bool,
    },
    /// Call now if the server is reachable, otherwise store the call
    Defer {
        service: String,
        method: String,
        #[arg(long)]
        params: Option<String>,
    },
    /// Submit every stored call
    Drain,
    /// List stored calls
    Queue {
        /// Remove every stored call
        #[arg(long)]
        clear: bool,
    },
    /// Forget stored tokens
    Logout,
    /// Connect to a live reload endpoint and log what it sends
    LiveReload {
        /// http(s) or ws(s) URL of the live reload endpoint
        url: String,
    },
}

impl Args {
    /// Settings file layered with flags and environment
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_toml_file(path)?,
            None => ClientConfig::default(),
        };
        config.merge_from(&self.overrides());
        config.validate()?;
        Ok(config)
    }

    fn overrides(&self) -> ClientConfigOverrides {
        ClientConfigOverrides {
            base_url: self.base_url.clone(),
            prefix: self.prefix.clone(),
            token_endpoint: self.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            storage_dir: self.storage_dir.clone(),
            probe_url: self.probe_url.clone(),
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            csrf_header_value: None,
        }
    }

    /// Validate argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_some() != self.password.is_some() {
            return Err("--username and --password must be given together".to_string());
        }
        Ok(())
    }
}

/// Parse an optional `--params` value
pub fn parse_params(params: Option<&str>) -> anyhow::Result<Option<serde_json::Value>> {
    params
        .map(|p| serde_json::from_str(p).map_err(|e| anyhow::anyhow!("invalid --params JSON: {}", e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "connect",
            "--base-url",
            "https://app.example.com",
            "--prefix",
            "/api",
            "drain",
        ]);
        let config = args.client_config().unwrap();
        assert_eq!(config.base_url, "https://app.example.com");
        assert_eq!(config.prefix, "/api");
        assert_eq!(config.token_endpoint, "/oauth/token");
    }

    #[test]
    fn test_call_subcommand() {
        let args = Args::parse_from([
            "connect",
            "call",
            "FooEndpoint",
            "fooMethod",
            "--params",
            r#"{"fooParam":"foo"}"#,
        ]);
        match args.command {
            Command::Call {
                service,
                method,
                params,
                anonymous,
            } => {
                assert_eq!(service, "FooEndpoint");
                assert_eq!(method, "fooMethod");
                assert!(!anonymous);
                let params = parse_params(params.as_deref()).unwrap().unwrap();
                assert_eq!(params["fooParam"], "foo");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_username_requires_password() {
        let args = Args::parse_from(["connect", "--username", "alice", "logout"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(parse_params(Some("{oops")).is_err());
        assert!(parse_params(None).unwrap().is_none());
    }
}
