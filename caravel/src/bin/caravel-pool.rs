//! Pool process entry point.
//!
//! `caravel-pool serve` runs a main pool; `caravel-pool sub` is the
//! internal subcommand the supervisor uses to launch worker sub-pools.
//! Embedders that register their own actor classes ship their own binary
//! and handle the same `sub` arguments (see `PoolBuilder::launch_fn`).
//!
//! Exit codes: 0 clean shutdown, 1 unrecoverable error, 2 configuration
//! error, 137 when sub-processes had to be force-killed.

use caravel::{PlacementPolicy, Pool, RestartPolicy};
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_FORCED: u8 = 137;

#[derive(Parser, Debug)]
#[command(name = "caravel-pool")]
#[command(about = "Run a caravel actor pool process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a main pool process.
    Serve(ServeArgs),
    /// Internal: run a sub-pool worker behind a main process.
    #[command(hide = true)]
    Sub(SubArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Pool endpoint, e.g. tcp://0.0.0.0:5000 or unix:///tmp/pool.sock
    #[arg(long)]
    address: String,

    /// Worker sub-processes behind this pool.
    #[arg(long, default_value_t = 0)]
    n_subpools: u32,

    /// Worker threads for the scheduler (default: one per core).
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Payload codec.
    #[arg(long, default_value = "json")]
    codec: String,

    /// Maximum envelope size in bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    max_envelope_bytes: usize,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Consecutive missed heartbeats before a peer is declared gone.
    #[arg(long, default_value_t = 2)]
    heartbeat_misses: u32,

    /// Graceful shutdown budget in seconds.
    #[arg(long, default_value_t = 10)]
    graceful_deadline: u64,

    /// What to do when a sub-process dies: never | on-failure
    #[arg(long, default_value = "on-failure")]
    restart_policy: String,

    /// Default placement policy: round-robin | least-loaded | affinity
    #[arg(long, default_value = "round-robin")]
    allocation_policy: String,
}

#[derive(Args, Debug)]
struct SubArgs {
    /// Internal endpoint this sub-pool binds.
    #[arg(long)]
    address: String,

    /// Address of the owning main pool.
    #[arg(long)]
    main_address: String,

    /// Sub-pool index within the pool.
    #[arg(long)]
    index: u32,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Consecutive missed heartbeats before a peer is declared gone.
    #[arg(long, default_value_t = 2)]
    heartbeat_misses: u32,

    /// Maximum envelope size in bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    max_envelope_bytes: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let worker_threads = match &cli.command {
        Command::Serve(args) => args.worker_threads,
        Command::Sub(_) => None,
    };

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = worker_threads {
        runtime.worker_threads(threads);
    }
    let runtime = match runtime.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let code = runtime.block_on(async {
        match cli.command {
            Command::Serve(args) => serve(args).await,
            Command::Sub(args) => sub(args).await,
        }
    });
    ExitCode::from(code)
}

async fn serve(args: ServeArgs) -> u8 {
    if args.codec != "json" {
        eprintln!("unsupported codec {:?} (available: json)", args.codec);
        return EXIT_CONFIG;
    }
    let restart_policy: RestartPolicy = match args.restart_policy.parse() {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_CONFIG;
        }
    };
    let allocation_policy: PlacementPolicy = match args.allocation_policy.parse() {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_CONFIG;
        }
    };

    let builder = match Pool::builder().address(&args.address) {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("invalid --address: {e}");
            return EXIT_CONFIG;
        }
    };
    let builder = builder
        .n_subpools(args.n_subpools)
        .restart_policy(restart_policy)
        .allocation_policy(allocation_policy)
        .heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .heartbeat_misses(args.heartbeat_misses)
        .graceful_deadline(Duration::from_secs(args.graceful_deadline))
        .max_envelope_bytes(args.max_envelope_bytes);

    let pool = match builder.build().await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "pool failed to start");
            return EXIT_FATAL;
        }
    };

    run(pool).await
}

async fn sub(args: SubArgs) -> u8 {
    let builder = match Pool::builder().address(&args.address) {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("invalid --address: {e}");
            return EXIT_CONFIG;
        }
    };
    let builder = match builder.sub_role(args.index, &args.main_address) {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("invalid --main-address: {e}");
            return EXIT_CONFIG;
        }
    };
    let builder = builder
        .heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .heartbeat_misses(args.heartbeat_misses)
        .max_envelope_bytes(args.max_envelope_bytes);

    let pool = match builder.build().await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, index = args.index, "sub-pool failed to start");
            return EXIT_FATAL;
        }
    };

    run(pool).await
}

async fn run<C: caravel::Codec>(pool: Pool<C>) -> u8 {
    let shutdown = wait_for_shutdown(&pool);
    match shutdown.await {
        Ok(forced) => {
            if forced {
                EXIT_FORCED
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "shutdown failed");
            EXIT_FATAL
        }
    }
}

/// Wait for SIGINT/SIGTERM or a control-plane shutdown, then run the
/// graceful path.
async fn wait_for_shutdown<C: caravel::Codec>(pool: &Pool<C>) -> caravel::Result<bool> {
    let signals = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term =
                signal(SignalKind::terminate()).expect("SIGTERM handler installation failed");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    };

    tokio::select! {
        _ = signals => {
            tracing::info!("signal received, shutting down");
            pool.shutdown().await
        }
        result = pool.run_until_shutdown() => result,
    }
}
