use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sweelimiter::config::{RuleSet, Settings};
use sweelimiter::RequestInfo;

#[derive(Parser)]
#[command(name = "sweelimiter", version, about = "Fixed-window rate limiter")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Load a settings file and validate every rule
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run admission checks for a synthetic request
    Check {
        #[arg(short, long)]
        config: PathBuf,

        /// Rule key to check against
        #[arg(short, long)]
        rule: String,

        #[arg(long)]
        host: Option<IpAddr>,

        /// Request header as `name=value`, repeatable
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        #[arg(long, default_value = "/")]
        route: String,

        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long)]
        principal: Option<String>,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Check {
            config,
            rule,
            host,
            headers,
            route,
            method,
            principal,
            count,
        } => {
            let mut request = RequestInfo::new(method, route.clone()).with_route(route);
            if let Some(host) = host {
                request = request.with_remote_addr(host);
            }
            if let Some(principal) = principal {
                request = request.with_principal(principal);
            }
            for (name, value) in headers {
                request = request.with_header(&name, value);
            }
            check(config, &rule, request, count).await
        }
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let settings = Settings::load(&path)?;
    let configs = settings
        .limit_configs()
        .with_context(|| format!("invalid rules in {}", path.display()))?;

    for config in &configs {
        let limits: Vec<String> = config.limits().iter().map(ToString::to_string).collect();
        println!("{}: {}", config.key(), limits.join(", "));
    }
    info!(rules = configs.len(), "Configuration is valid");
    Ok(())
}

async fn check(path: PathBuf, rule: &str, request: RequestInfo, count: u32) -> anyhow::Result<()> {
    let settings = Settings::load(&path)?;
    let rules = RuleSet::from_settings(&settings)?;
    let config = rules
        .get(rule)
        .ok_or_else(|| anyhow!("no rule '{}' (known: {})", rule, rules.keys().join(", ")))?;

    let backend = settings.build_backend().await?;
    let engine = settings.build_engine(backend);
    info!(rule, backend = engine.backend().name(), key = %config.final_key(&request), "Checking");

    for _ in 0..count {
        let result = engine.limit(&config, &request).await;
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}
