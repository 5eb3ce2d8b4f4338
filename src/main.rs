//! Operator entry point (spec section 6.5): loads configuration, wires the
//! ledger, risk controller, signal bus, gateways and agents together, then
//! runs them under the supervisor until `SIGINT`/`SIGTERM` or a coordination
//! fault.
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use swarm_core::agents::arbitrage::ArbitrageAgent;
use swarm_core::budget::BudgetManager;
use swarm_core::config::{ConfigError, SwarmConfig};
use swarm_core::error::SwarmError;
use swarm_core::gateway::orders::{DryRunExecutor, OrderExecutor, OrderGatewayClient};
use swarm_core::ledger::store::{CoordinationStore, InMemoryStore, RedisStore};
use swarm_core::logging::{init_json_logging, init_logging};
use swarm_core::risk::RiskController;
use swarm_core::signal::bus::SignalBus;
use swarm_core::supervisor::AgentSupervisor;
use tracing::{error, info};

/// Coordination substrate for a swarm of autonomous prediction-market trading agents.
#[derive(Debug, Parser)]
#[command(name = "swarm", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "swarm.config.json")]
    config: PathBuf,

    /// Re-initialise the capital ledger from `--budget` even if it already holds a value.
    #[arg(long)]
    reset: bool,

    /// Total capital to seed the ledger with. Requires `--reset` unless the ledger is empty.
    #[arg(long)]
    budget: Option<Decimal>,

    /// Coordination store URI (currently only a `redis://` scheme is supported). Falls back
    /// to an in-process store when absent, which only makes sense for a single-process swarm.
    #[arg(long, env = "SWARM_STORE_URL")]
    store_url: Option<String>,

    /// Emit structured JSON logs instead of the default human-readable format.
    #[arg(long)]
    json_logs: bool,

    /// Raise the default log level to debug.
    #[arg(long)]
    verbose: bool,

    /// Evaluate and claim opportunities as normal but never submit real orders.
    #[arg(long)]
    dry_run: bool,

    /// Restrict which agent types are registered with the supervisor. Comma-delimited;
    /// defaults to all known agent types when absent.
    #[arg(long, value_delimiter = ',')]
    agents: Option<Vec<String>>,
}

impl Cli {
    fn agent_enabled(&self, name: &str) -> bool {
        match &self.agents {
            Some(agents) => agents.iter().any(|a| a == name),
            None => true,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.json_logs {
        init_json_logging(cli.verbose);
    } else {
        init_logging(cli.verbose);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start the async runtime: {error}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::from(130),
        Ok(false) => ExitCode::SUCCESS,
        Err(AppError::Config(error)) => {
            error!(%error, "configuration error");
            ExitCode::from(2)
        }
        Err(AppError::Swarm(error)) => {
            error!(%error, "coordination fault, exiting");
            ExitCode::from(3)
        }
    }
}

enum AppError {
    Config(ConfigError),
    Swarm(SwarmError),
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        AppError::Config(value)
    }
}

impl From<SwarmError> for AppError {
    fn from(value: SwarmError) -> Self {
        AppError::Swarm(value)
    }
}

async fn run(cli: Cli) -> Result<bool, AppError> {
    let config = load_config(&cli.config)?;
    config.validate()?;

    if let Some(store_url) = &cli.store_url {
        let store = Arc::new(
            RedisStore::connect(store_url)
                .map_err(|error| AppError::Swarm(SwarmError::Store(error)))?,
        );
        run_with_store(cli, config, store).await
    } else {
        info!("no --store-url supplied; running with a single-process in-memory coordination store");
        let store = Arc::new(InMemoryStore::new());
        run_with_store(cli, config, store).await
    }
}

async fn run_with_store<S>(cli: Cli, config: SwarmConfig, store: Arc<S>) -> Result<bool, AppError>
where
    S: CoordinationStore + 'static,
{
    let budget = Arc::new(BudgetManager::new(store.clone(), config.allocation.clone(), config.budget));

    match cli.budget {
        Some(total_capital) => {
            budget
                .initialize(total_capital, cli.reset)
                .await
                .map_err(|error| AppError::Swarm(SwarmError::CoordinationFault(error.to_string())))?;
        }
        None if cli.reset => {
            return Err(AppError::Config(ConfigError::Invalid(
                "--reset requires --budget".to_string(),
            )));
        }
        None => {}
    }

    let bus = SignalBus::new(config.signal_bus.history_capacity, config.signal_bus.subscriber_budget);
    let risk = Arc::new(RiskController::new(config.risk, bus.clone()));
    let orders: Arc<dyn OrderExecutor> = if cli.dry_run {
        info!("--dry-run set; orders will be logged but never submitted to the gateway");
        Arc::new(DryRunExecutor)
    } else {
        Arc::new(OrderGatewayClient::new(
            config.gateways.order_gateway_url.clone(),
            config.gateways.order_timeout,
        ))
    };

    let signalled = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(wait_for_termination(shutdown_tx, signalled.clone()));

    let mut supervisor = AgentSupervisor::new(config.supervisor);

    if cli.agent_enabled("arbitrage") {
        let bus = bus.clone();
        let store = store.clone();
        let budget = budget.clone();
        let risk = risk.clone();
        let orders = orders.clone();
        let arbitrage_config = config.arbitrage;
        supervisor.register(
            "arbitrage-0",
            Box::new(move || {
                Box::new(ArbitrageAgent::new(
                    "arbitrage-0",
                    "arbitrage-0-wallet",
                    bus.clone(),
                    store.clone(),
                    budget.clone(),
                    risk.clone(),
                    orders.clone(),
                    arbitrage_config,
                    Vec::new(),
                )) as Box<dyn swarm_core::agents::Agent>
            }),
        );
    } else {
        info!("arbitrage agent excluded by --agents");
    }

    supervisor.run(shutdown_rx).await?;

    let snapshot = budget
        .snapshot()
        .await
        .map_err(|error| AppError::Swarm(SwarmError::CoordinationFault(error.to_string())))?;
    info!(total_capital = %snapshot.total_capital, "final ledger snapshot taken on shutdown");

    Ok(signalled.load(Ordering::SeqCst))
}

fn load_config(path: &std::path::Path) -> Result<SwarmConfig, ConfigError> {
    let data = std::fs::read_to_string(path)
        .map_err(|error| ConfigError::Invalid(format!("reading {}: {error}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|error| ConfigError::Invalid(format!("parsing {}: {error}", path.display())))
}

async fn wait_for_termination(shutdown_tx: tokio::sync::watch::Sender<bool>, signalled: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received, draining agents");
    signalled.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(true);
}
