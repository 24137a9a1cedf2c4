use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Algorithm, Decision, Engine, LimitSpec};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Multi-window quota enforcement")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate requests for a key and print one JSON decision per request
    Check(CheckArgs),
}

#[derive(Debug, clap::Args)]
struct CheckArgs {
    /// Rate key to evaluate
    #[arg(long)]
    key: String,

    /// Limit as <count>/<window>, e.g. 10/s or 500/1h; repeatable
    #[arg(long = "limit", required = true)]
    limits: Vec<LimitSpec>,

    /// Cost of each request
    #[arg(long, default_value_t = 1)]
    cost: u64,

    /// Number of requests to evaluate
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Algorithm override: continuous or windowed
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Configuration file (YAML); TURNSTILE__* environment variables apply on top
    #[arg(long)]
    config: Option<String>,

    /// Report decisions without recording them
    #[arg(long)]
    peek: bool,
}

/// JSON rendering of a [`Decision`].
#[derive(Debug, Serialize)]
struct DecisionReport {
    allowed: bool,
    retry_after_ms: u64,
    degraded: bool,
    limits: Vec<LimitReport>,
}

#[derive(Debug, Serialize)]
struct LimitReport {
    limit: String,
    allowed: bool,
    remaining: u64,
    reset_at: Option<String>,
}

impl From<&Decision> for DecisionReport {
    fn from(decision: &Decision) -> Self {
        Self {
            allowed: decision.allowed,
            retry_after_ms: decision.retry_after.as_millis() as u64,
            degraded: decision.degraded,
            limits: decision
                .per_limit
                .iter()
                .map(|status| LimitReport {
                    limit: status.spec().to_string(),
                    allowed: status.allowed,
                    remaining: status.remaining,
                    reset_at: status.reset_at_utc().map(|at| at.to_rfc3339()),
                })
                .collect(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Check(args) => check(args).await,
    }
}

async fn check(args: CheckArgs) -> anyhow::Result<()> {
    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(algorithm) = args.algorithm {
        config.engine.algorithm = algorithm;
    }

    let engine = Engine::from_config(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        algorithm = %engine.algorithm(),
        backend = ?config.store.backend,
        "Engine initialized"
    );

    for _ in 0..args.repeat {
        let decision = if args.peek {
            engine.peek(&args.key, args.cost, &args.limits).await?
        } else {
            engine.evaluate(&args.key, args.cost, &args.limits).await?
        };
        println!("{}", serde_json::to_string(&DecisionReport::from(&decision))?);
    }

    engine.shutdown();
    Ok(())
}
