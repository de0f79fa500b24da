use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

/// Deployment target for the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(ConfigError::UnknownEnvironment {
                value: other.to_string(),
            }),
        }
    }
}

/// Minimal configuration blob compiled into the binary.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub env: Environment,
    pub listen_addr: SocketAddr,
    pub log_path: PathBuf,
    pub probe: ProbeSettings,
}

#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub test_url: &'static str,
    pub interval: Duration,
    pub max_test_duration: Duration,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn load(env: Environment) -> Result<Self, ConfigError> {
        Ok(Self {
            env,
            listen_addr: listen_addr_for(env),
            log_path: log_path_for(env),
            probe: ProbeSettings::for_env(env),
        })
    }

    pub fn env_label(&self) -> &'static str {
        match self.env {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

impl ProbeSettings {
    fn for_env(_env: Environment) -> Self {
        Self {
            test_url: "https://speed.cloudflare.com/__down?bytes=25000000",
            interval: Duration::from_secs(60),
            max_test_duration: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn listen_addr_for(env: Environment) -> SocketAddr {
    let addr = match env {
        Environment::Dev => "127.0.0.1:8000",
        Environment::Prod => "0.0.0.0:8000",
    };
    addr.parse().expect("valid listen addr")
}

fn log_path_for(env: Environment) -> PathBuf {
    match env {
        Environment::Dev => PathBuf::from("internet-speed-log.csv"),
        Environment::Prod => PathBuf::from("/var/lib/speedlog/internet-speed-log.csv"),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown environment '{value}' (expected 'dev' or 'prod')")]
    UnknownEnvironment { value: String },
}
