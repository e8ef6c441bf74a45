use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use floodgate::config::FloodgateConfig;
use floodgate::logging::init_tracing;
use floodgate::ratelimit::{Category, LimiterEngine, RequestContext};

/// Operator tooling for the Floodgate rate limiter.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, env = "FLOODGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy table
    Policies,
    /// Consume one point for a client and print the decision
    Check(TargetArgs),
    /// Print a client's counter without consuming
    Status(TargetArgs),
    /// Clear a client's counter
    Reset(TargetArgs),
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Policy category, e.g. auth or ai_generation
    category: Category,

    /// Client network address
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,

    /// Request discriminator such as a login email
    #[arg(long)]
    discriminator: Option<String>,
}

impl TargetArgs {
    fn context(&self) -> RequestContext {
        let mut ctx = RequestContext::default();
        if let Some(ip) = self.ip {
            ctx = ctx.with_origin(ip);
        }
        if let Some(user) = &self.user {
            ctx = ctx.with_user(user.clone());
        }
        if let Some(discriminator) = &self.discriminator {
            ctx = ctx.with_discriminator(discriminator.clone());
        }
        ctx
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FloodgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging)?;
    debug!(config = ?cli.config, "Configuration loaded");

    let engine = LimiterEngine::from_config(&config).context("building limiter")?;
    let eviction = engine.spawn_eviction();

    let output = match &cli.command {
        Command::Policies => {
            let policies: Vec<_> = engine
                .registry()
                .policies()
                .map(|policy| {
                    json!({
                        "category": policy.category,
                        "quota": policy.quota,
                        "window_secs": policy.window_secs(),
                        "block_secs": policy.block_secs(),
                        "key_strategy": policy.key_strategy,
                        "evenly_spread": policy.evenly_spread,
                        "alert_after_hits": policy.alert_after_hits,
                    })
                })
                .collect();
            json!(policies)
        }
        Command::Check(target) => {
            let decision = engine.check(target.category, &target.context()).await?;
            let headers: serde_json::Map<String, serde_json::Value> = decision
                .headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), json!(value)))
                .collect();
            let body = (!decision.allowed).then(|| decision.error_body());
            json!({
                "decision": decision,
                "headers": headers,
                "body": body,
            })
        }
        Command::Status(target) => {
            let status = engine.status(target.category, &target.context()).await?;
            json!({
                "status": status,
                "breaker": engine.breaker().snapshot(),
            })
        }
        Command::Reset(target) => {
            let ctx = target.context();
            engine.reset(target.category, &ctx).await?;
            let status = engine.status(target.category, &ctx).await?;
            info!(key = %status.key, "Counter cleared");
            json!({ "reset": true, "status": status })
        }
    };
    eviction.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
