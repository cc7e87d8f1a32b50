use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use harbor_agent::{consul_effector, keep_registered, ConsulRegistry, HeartbeatConfig, Retry};
use harbor_core::feedback::{self, FeedbackReceiver};
use harbor_core::time::parse_duration;
use harbor_core::{
    resolver_target, InstanceHandle, Near, Registry, RegistryConfig, RegistryError, ResolveOptions, ServiceDescriptor,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Consul registration and discovery CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    consul: ConsulArgs,
}

#[derive(Args)]
struct ConsulArgs {
    #[arg(long, global = true, env = "CONSUL_HOST", default_value = harbor_core::config::DEFAULT_HOST)]
    consul_host: String,
    #[arg(long, global = true, env = "CONSUL_PORT", default_value_t = harbor_core::config::DEFAULT_PORT)]
    consul_port: u16,
    #[arg(long, global = true, env = "CONSUL_USER")]
    consul_user: Option<String>,
    #[arg(long, global = true, env = "CONSUL_PASS", hide_env_values = true)]
    consul_pass: Option<String>,
}

impl ConsulArgs {
    fn registry_config(&self) -> RegistryConfig {
        let config = RegistryConfig::new(self.consul_host.clone(), self.consul_port);
        match (&self.consul_user, &self.consul_pass) {
            (Some(user), Some(pass)) => config.with_credentials(user.clone(), pass.clone()),
            _ => config,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance and keep it alive until Ctrl+C
    Register {
        #[arg(long)]
        name: String,
        /// Instance address as host:port
        #[arg(long)]
        address: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Registration attempts before giving up; 0 retries forever
        #[arg(long, default_value_t = 0)]
        max_attempts: u32,
    },
    /// Print healthy addresses of a service
    Addresses {
        #[arg(long)]
        name: String,
    },
    /// Remove a registered instance by id
    Deregister {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Print the resolver target for a service
    Target(TargetArgs),
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    healthy: bool,
    #[arg(long, allow_negative_numbers = true)]
    limit: Option<i64>,
    /// `_agent`, `_ip` or a node name
    #[arg(long)]
    near: Option<String>,
    #[arg(long)]
    dc: Option<String>,
    #[arg(long, value_parser = duration_arg)]
    wait: Option<Duration>,
    #[arg(long, value_parser = duration_arg)]
    timeout: Option<Duration>,
    #[arg(long, value_parser = duration_arg)]
    max_backoff: Option<Duration>,
    #[arg(long)]
    token: Option<String>,
    /// Query the registry over HTTPS
    #[arg(long)]
    secure: bool,
    #[arg(long)]
    stale: Option<bool>,
    #[arg(long)]
    consistent: Option<bool>,
}

impl TargetArgs {
    fn options(&self) -> ResolveOptions {
        let mut options = ResolveOptions::new().with_healthy(self.healthy);
        if let Some(tag) = &self.tag {
            options = options.with_tag(tag.clone());
        }
        if let Some(limit) = self.limit {
            options = options.with_limit(limit);
        }
        if let Some(near) = &self.near {
            options = options.with_near(Near::parse(near));
        }
        if let Some(dc) = &self.dc {
            options = options.with_dc(dc.clone());
        }
        if let Some(wait) = self.wait {
            options = options.with_wait(wait);
        }
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }
        if let Some(max_backoff) = self.max_backoff {
            options = options.with_max_backoff(max_backoff);
        }
        if let Some(token) = &self.token {
            options = options.with_token(token.clone());
        }
        if self.secure {
            options = options.with_insecure(false);
        }
        if let Some(stale) = self.stale {
            options = options.with_allow_stale(stale);
        }
        if let Some(consistent) = self.consistent {
            options = options.with_require_consistent(consistent);
        }
        options
    }
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).ok_or_else(|| format!("invalid duration `{value}`, expected e.g. 500ms, 5s, 1m30s"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.consul.registry_config();

    match cli.command {
        Commands::Register {
            name,
            address,
            tags,
            max_attempts,
        } => {
            let service = ServiceDescriptor::from_host_port(name, &address)?.with_tags(tags);
            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                signal_token.cancel();
            });
            serve(&config, &service, max_attempts, &token).await?;
        }
        Commands::Addresses { name } => {
            let registry = ConsulRegistry::new(config)?;
            match registry.service_addresses(&name).await {
                Ok(addresses) => {
                    println!("Healthy instances of {}:", name);
                    for address in addresses {
                        println!("  {}", address);
                    }
                }
                Err(RegistryError::NoAddressesFound(_)) => println!("No healthy instances of {}", name),
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Deregister { id, name } => {
            let registry = ConsulRegistry::new(config)?;
            registry.deregister(&InstanceHandle::from_parts(name, id.clone())).await?;
            println!("Instance deregistered: {}", id);
        }
        Commands::Target(args) => {
            println!("{}", resolver_target(&config, &args.name, &args.options())?);
        }
    }

    Ok(())
}

/// Runs the registration with the standard Consul effector, logging feedback
/// records until the registration ends.
async fn serve(
    config: &RegistryConfig,
    service: &ServiceDescriptor,
    max_attempts: u32,
    token: &CancellationToken,
) -> Result<(), RegistryError> {
    let (tx, rx) = feedback::channel();
    let reporter = tokio::spawn(report_feedback(rx));
    let retry = Retry::new(consul_effector(HeartbeatConfig::default(), Some(tx.clone())))
        .max_attempts(max_attempts)
        .feedback(tx);

    let outcome = keep_registered(&retry, token, service, config).await;

    drop(retry);
    if reporter.await.is_err() {
        error!("Feedback reporter panicked");
    }
    outcome
}

async fn report_feedback(mut rx: FeedbackReceiver) {
    while let Some(record) = rx.recv().await {
        match &record.error {
            Some(err) => warn!(error = %err, "{}", record.message),
            None => info!("{}", record.message),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consul_flags_build_registry_config() {
        let cli = Cli::try_parse_from([
            "harbor",
            "--consul-host",
            "consul.internal",
            "--consul-port",
            "8501",
            "--consul-user",
            "ops",
            "--consul-pass",
            "s3cret",
            "addresses",
            "--name",
            "orders",
        ])
        .unwrap();
        let config = cli.consul.registry_config();
        assert_eq!(config.address(), "consul.internal:8501");
        assert_eq!(config.credentials(), Some(("ops", "s3cret")));
    }

    #[test]
    fn target_flags_map_onto_options() {
        let cli = Cli::try_parse_from([
            "harbor", "target", "--name", "orders", "--tag", "primary", "--healthy", "--wait", "30s", "--near", "_ip",
        ])
        .unwrap();
        let Commands::Target(args) = cli.command else {
            panic!("expected target command");
        };
        let options = args.options();
        assert_eq!(options.tag(), Some("primary"));
        assert_eq!(options.healthy(), Some(true));
        assert_eq!(options.wait(), Some(Duration::from_secs(30)));
        assert_eq!(options.near(), Some(&Near::Ip));
        assert_eq!(options.insecure(), None);
    }

    #[test]
    fn negative_limit_is_rejected_when_building_target() {
        let cli = Cli::try_parse_from(["harbor", "target", "--name", "orders", "--limit", "-1"]).unwrap();
        let Commands::Target(args) = cli.command else {
            panic!("expected target command");
        };
        assert!(resolver_target(&RegistryConfig::default(), &args.name, &args.options()).is_err());
    }

    #[test]
    fn malformed_duration_is_a_usage_error() {
        assert!(Cli::try_parse_from(["harbor", "target", "--name", "orders", "--wait", "soon"]).is_err());
    }
}
