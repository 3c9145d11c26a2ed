mod config;
mod launcher;
mod probe;
mod process;
mod redirect;
mod signals;
mod status;
mod supervisor;

use clap::{Parser, Subcommand};
use config::Config;
use redirect::{Iptables, RedirectRule, RuleBackend, RuleOp};
use signals::ShutdownSignal;
use status::{Phase, StatusTracker};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{Outcome, SupervisorError};

/// Runs a caching proxy (in a container or directly) and redirects port 80
/// traffic to it only while it is accepting connections.
#[derive(Parser, Debug)]
#[command(name = "squid-in-a-can", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "squid-in-a-can.toml", global = true)]
    config: PathBuf,

    /// Proxy port to wait for (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Seconds between liveness checks (overrides config)
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval: Option<u64>,

    /// Print resolved settings and redirect commands, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (port probes, phase transitions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build and run the proxy container, redirecting traffic while it is up
    Deploy {
        /// Skip the image build step
        #[arg(long)]
        no_build: bool,
    },
    /// Redirect traffic to a proxy started elsewhere, until its port closes
    Intercept,
    /// Prepare the cache and run the proxy binary in the foreground
    Launch,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "squid_in_a_can=debug"
    } else if cli.quiet {
        "squid_in_a_can=warn"
    } else {
        "squid_in_a_can=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if let Some(secs) = cli.poll_interval {
        config.monitor.poll_interval_secs = secs;
    }
}

fn print_dry_run(config: &Config, backend: &Iptables) {
    let rule = RedirectRule::from_config(&config.redirect);
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => tracing::warn!(error = %e, "failed to render config"),
    }
    println!("# install: {}", backend.describe(&rule, RuleOp::Append));
    println!("# remove:  {}", backend.describe(&rule, RuleOp::Delete));
}

/// Truncate an exit code to the byte a parent process will see.
fn exit_status_byte(code: i32) -> u8 {
    (code & 0xff) as u8
}

async fn run(cli: &Cli, config: &Config) -> Result<Outcome, SupervisorError> {
    supervisor::ensure_root()?;

    let shutdown = ShutdownSignal::new();
    if let Err(e) = shutdown.install() {
        tracing::warn!(error = %e, "failed to install signal handlers");
    }

    let backend = Iptables::new(&config.redirect.iptables);
    let rule = RedirectRule::from_config(&config.redirect);
    let mut status = StatusTracker::new(
        config.status.file.clone(),
        config.proxy.port,
        backend.describe(&rule, RuleOp::Append),
    );

    let result = match &cli.command {
        Commands::Deploy { no_build } => {
            supervisor::run_deploy(config, !no_build, &backend, &shutdown, &mut status).await
        }
        Commands::Intercept => {
            supervisor::run_intercept(config, &backend, &shutdown, &mut status).await
        }
        Commands::Launch => {
            launcher::run_launch(
                &config.launch,
                config.monitor.poll_interval(),
                config.monitor.stop_grace(),
                &shutdown,
                &mut status,
            )
            .await
        }
    };

    match &result {
        Ok(outcome) => {
            status.set_exit_code(outcome.code());
            status.update(Phase::Exited);
            status.remove();
        }
        Err(_) => status.update(Phase::Exited),
    }
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        print_dry_run(&config, &Iptables::new(&config.redirect.iptables));
        return ExitCode::SUCCESS;
    }

    match run(&cli, &config).await {
        Ok(outcome) => {
            tracing::info!(?outcome, "exiting");
            ExitCode::from(exit_status_byte(outcome.code()))
        }
        Err(e) => {
            tracing::error!(error = %e, "aborting");
            ExitCode::FAILURE
        }
    }
}
