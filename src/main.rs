//! replica-convergence - verify a control-plane setting change reaches every replica

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replica_convergence::config::{ConfigOverrides, HarnessConfig, CONFIG_ENV};
use replica_convergence::scenario;
use replica_convergence::session::Session;

/// Mutate a control-plane setting and check that every replica picks it up
#[derive(Parser, Debug)]
#[command(name = "replica-convergence", version, about, long_about = None)]
struct Cli {
    /// Harness configuration file (YAML)
    #[arg(long, short, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metadata propagation check
    ///
    /// Primes the metadata source, scales the control plane, switches the
    /// source, waits for the default version to change, then checks every
    /// replica. Exits non-zero if any replica did not converge.
    Run(OverrideArgs),

    /// Print the effective configuration and exit
    ShowConfig(OverrideArgs),
}

/// Values that override the configuration file
#[derive(Args, Debug, Default)]
struct OverrideArgs {
    /// Control plane host or URL
    #[arg(long, env = "RANCHER_HOST")]
    rancher_host: Option<String>,

    /// Control plane bearer token
    #[arg(long, env = "RANCHER_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Skip TLS verification against the control plane
    #[arg(long)]
    insecure: Option<bool>,

    /// Kubeconfig for the cluster running the control plane
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Replica count to scale to before verifying
    #[arg(long)]
    replicas: Option<i32>,

    /// Metadata URL whose effect is verified
    #[arg(long)]
    target_value: Option<String>,

    /// Leave the setting and replica count as the run left them
    #[arg(long)]
    no_restore: bool,
}

impl OverrideArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            rancher_host: self.rancher_host,
            admin_token: self.admin_token,
            insecure: self.insecure,
            kubeconfig: self.kubeconfig,
            replicas: self.replicas,
            target_value: self.target_value,
            restore_on_exit: self.no_restore.then_some(false),
        }
    }
}

fn load_config(path: Option<&PathBuf>, args: OverrideArgs) -> anyhow::Result<HarnessConfig> {
    let mut config = HarnessConfig::load(path.map(PathBuf::as_path))?;
    args.into_overrides().apply_to(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Failed to install TLS crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(load_config(cli.config.as_ref(), args)?).await,
        Commands::ShowConfig(args) => {
            let mut config = load_config(cli.config.as_ref(), args)?;
            if !config.rancher.admin_token.is_empty() {
                config.rancher.admin_token = "<redacted>".to_string();
            }
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn run(config: HarnessConfig) -> anyhow::Result<()> {
    config.validate()?;
    let policy = config.backoff.to_policy()?;

    let mut session = Session::acquire(&config).await?;

    let outcome = tokio::select! {
        result = scenario::run_metadata_scenario(&mut session, &config) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, releasing session");
            None
        }
    };

    if let Err(e) = session.release(&policy).await {
        error!(error = %e, "Failed to restore cluster state");
    }

    let verdict = match outcome {
        Some(result) => result?,
        None => anyhow::bail!("interrupted"),
    };

    println!("{verdict}");
    if verdict.is_pass() {
        info!("Verification passed");
        Ok(())
    } else {
        anyhow::bail!(
            "{} replica(s) did not converge",
            verdict.mismatches().len()
        )
    }
}
