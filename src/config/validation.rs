use anyhow::Result;
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use garde::Validate;
use std::path::PathBuf;

use super::AppConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "pcf-gatekeeper", version, about = "Authorization and admission gatekeeper")]
pub struct Cli {
    /// Extra configuration file, applied after the environment file
    #[arg(long, env = "APP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding default.toml and {environment}.toml
    #[arg(long, env = "APP_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    /// Server port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Environment name (development, staging, production)
    #[arg(long, env = "ENVIRONMENT")]
    pub environment: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

/// Layered configuration sources, lowest priority first:
/// embedded defaults, `default.toml`, `{environment}.toml`, the `--config`
/// file, `APP_` environment variables, CLI flags.
pub fn config_figment(cli: &Cli) -> Figment {
    let env_name = cli
        .environment
        .clone()
        .unwrap_or_else(|| "production".to_string());

    let mut figment = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(cli.config_dir.join("default.toml")))
        .merge(Toml::file(cli.config_dir.join(format!("{}.toml", env_name))));

    if let Some(path) = &cli.config {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment
        .merge(Env::prefixed("APP_").split("__"))
        .merge(Serialized::default("environment", &env_name));

    if let Some(port) = cli.port {
        figment = figment.merge(Serialized::default("server.port", port));
    }
    if cli.debug {
        figment = figment.merge(Serialized::default("logging.level", "debug"));
    }

    figment
}

/// Load and validate the application configuration
pub fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config: AppConfig = config_figment(cli).extract()?;
    config.validate()?;
    Ok(config)
}
