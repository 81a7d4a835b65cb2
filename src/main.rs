use anyhow::Result;
use clap::Parser;
use nodesync::{BuildInfo, Instance, LockGuard, NodeConfig, ShutdownReason};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "nodesync-agent")]
#[command(about = "Registers an application with the management plane and keeps it reachable")]
#[command(version)]
#[command(long_about = "Runs a node agent for one application name: registers over MQTT, \
publishes periodic heartbeats, answers stop/restart/status/query control commands and \
optionally refuses to start while another instance holds the host-local lock.")]
struct Args {
    /// Application name
    #[arg(short, long, help = "Application name used for topics and the lock file")]
    name: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "nodesync.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enforce a single instance per host
    #[arg(long, help = "Enable the single-instance lock")]
    lock: bool,

    /// Report whether another instance holds the lock and exit
    #[arg(long, help = "Check the lock for --name and exit (status 1 when held)")]
    check_lock: bool,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the agent")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily files in this directory
    #[arg(long, value_name = "DIR", help = "Directory for daily rolling log files")]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&args)?;

    info!("Starting nodesync agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match NodeConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    if args.lock {
        config.lock.enabled = true;
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let Some(name) = args.name.clone() else {
        anyhow::bail!("--name is required");
    };

    if args.check_lock {
        let guard = LockGuard::from_config(&config.lock);
        let (locked, pid) = guard.is_locked(&name);
        println!("lock file: {}", guard.lock_path(&name).display());
        match (locked, pid) {
            (true, Some(pid)) => println!("held by pid {}", pid),
            (true, None) => println!("held by an unknown owner"),
            (false, _) => println!("not held"),
        }
        std::process::exit(if locked { 1 } else { 0 });
    }

    let instance = Instance::builder(&name)
        .config(config)
        .version(env!("CARGO_PKG_VERSION"))
        .build_info(BuildInfo::current())
        .start()
        .await
        .map_err(|e| {
            error!("Failed to start instance: {}", e);
            e
        })?;

    info!("Agent for '{}' is running", name);

    let reason = wait_for_shutdown(&instance).await;
    info!("Shutdown initiated: {:?}", reason);

    instance.stop().await;

    if reason.wants_restart() {
        warn!("Restart requested remotely; exiting for the supervisor to start a new process");
    }
    info!("Agent exited");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or a remote stop/restart
async fn wait_for_shutdown(instance: &Instance) -> ShutdownReason {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = instance.cancelled() => None,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received SIGINT signal (Ctrl+C)");
            Some(ShutdownReason::Signal("SIGINT".to_string()))
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
            Some(ShutdownReason::Signal("SIGTERM".to_string()))
        }
    };

    if let Some(reason) = reason {
        instance.request_stop(reason);
    }
    instance
        .shutdown_reason()
        .unwrap_or(ShutdownReason::Requested)
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nodesync={},nodesync_agent={}", log_level, log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "nodesync-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# nodesync agent configuration");
    println!("# Environment overrides: NODESYNC_<SECTION>__<KEY>, MQTT_BROKER_URL, NODE_ENGINE_URL");
    println!();
    println!("{}", toml::to_string_pretty(&NodeConfig::default())?);
    Ok(())
}
