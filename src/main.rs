use std::{collections::BTreeMap, sync::Arc};

use clap::Parser;
use cli::{Command, JumptunnelCli};
use cloud::aws::AwsClient;
use config::{JumptunnelConfig, find_config_file};
use tracing::{Level, error, info, warn};
use tunneling::{
    jumphost::JumphostSelector,
    session::AwsCliLauncher,
    tunnel::{TunnelError, TunnelManager},
};

mod cli;
mod cloud;
mod config;
mod tunneling;

#[tokio::main]
pub async fn main() -> Result<(), TunnelError> {
    let cli = JumptunnelCli::parse();
    let (args, details_only) = match cli.command {
        Command::CreateTunnel(args) => (args, false),
        Command::ServiceDetails(args) => (args, true),
    };
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    let services = args.service_names();
    if services.is_empty() {
        return Err(TunnelError::NoServices);
    }
    let config_path = find_config_file(args.config.as_deref())?;
    info!("using config file {}", config_path.display());
    let config = JumptunnelConfig::load(&config_path)?;

    let region = args.region.clone().or(config.aws.default_region);
    let profile = config.aws.profile;
    let client = Arc::new(AwsClient::new(region.clone(), profile.clone()).await);
    let mut manager = TunnelManager::new(
        config.tunnel,
        &args.env,
        client.clone(),
        JumphostSelector::new(client),
        Box::new(AwsCliLauncher::new(region, profile)),
    );

    if details_only {
        print_service_details(&manager, &services).await;
        Ok(())
    } else {
        run_tunnels(&mut manager, &services).await
    }
}

/// Keeps the tunnels open until Ctrl+C. Failed services are only fatal when nothing
/// could be opened at all.
async fn run_tunnels(manager: &mut TunnelManager, services: &[String]) -> Result<(), TunnelError> {
    let registry = manager.registry();
    if let Err(e) = manager.create_tunnels(services).await {
        if registry.is_empty() {
            error!("failed to create tunnels: {e}");
            return Err(e);
        }
        warn!("{e}");
    }
    for tunnel in registry.describe() {
        println!("{tunnel}");
    }
    println!("Tunnels created successfully. Press Ctrl+C to exit and close all tunnels");

    close_on_signal(manager, tokio::signal::ctrl_c()).await
}

/// Waits for `signal`, then closes every tunnel. The tunnels are closed even when
/// waiting for the signal fails.
async fn close_on_signal(
    manager: &TunnelManager,
    signal: impl Future<Output = std::io::Result<()>>,
) -> Result<(), TunnelError> {
    let signal = signal.await;
    match &signal {
        Ok(()) => info!("received Ctrl+C, closing {} tunnels", manager.registry().len()),
        Err(e) => error!("failed to wait for Ctrl+C, closing tunnels: {e}"),
    }
    let cleanup = manager.cleanup_tunnels().await;
    signal?;
    cleanup
}

async fn print_service_details(manager: &TunnelManager, services: &[String]) {
    for service in services {
        let Some(config) = manager.settings().get_service_config(service) else {
            warn!("failed to get details for {service}: unknown service");
            continue;
        };
        match manager.get_service_details(service, config).await {
            Ok(details) => print!("{}", format_details(service, &details)),
            Err(e) => warn!("failed to get details for {service}: {e}"),
        }
    }
}

/// `Service: <name>` followed by one `key=value` line per detail, sorted by key, and a
/// blank line.
fn format_details(service: &str, details: &BTreeMap<String, String>) -> String {
    let mut out = format!("\nService: {service}\n");
    for (key, value) in details {
        out.push_str(&format!("{key}={value}\n"));
    }
    out.push('\n');
    out
}
