use clap::{Args, Parser, Subcommand, builder::NonEmptyStringValueParser};

#[derive(Parser)]
#[command(version, about = "jumptunnel forwards local ports to services that are only reachable through a jumphost", long_about = None)]
pub(crate) struct JumptunnelCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// open port-forwarding tunnels to the given services
    CreateTunnel(CommonArgs),
    /// print the resolved details of the given services
    ServiceDetails(CommonArgs),
}

#[derive(Args, Debug, Clone)]
pub(crate) struct CommonArgs {
    /// custom config file
    #[arg(short, long)]
    pub config: Option<String>,
    /// environment name (dev, staging, prod, ...)
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub env: String,
    /// comma-separated list of services (e.g. "database,redis")
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub services: Vec<String>,
    /// AWS region, overrides the one in the config file
    #[arg(short, long)]
    pub region: Option<String>,
    /// enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl CommonArgs {
    /// trimmed service names, empty entries dropped
    pub fn service_names(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_tunnel() {
        let cli = JumptunnelCli::try_parse_from([
            "jumptunnel",
            "create-tunnel",
            "--env",
            "prod",
            "--services",
            "database, redis,,",
            "--region",
            "us-west-2",
        ])
        .unwrap();
        let Command::CreateTunnel(args) = cli.command else {
            panic!("expected create-tunnel");
        };
        assert_eq!(args.env, "prod");
        assert_eq!(args.region.as_deref(), Some("us-west-2"));
        assert_eq!(args.service_names(), vec!["database", "redis"]);
        assert!(!args.verbose);
    }

    #[test]
    fn env_and_services_are_required() {
        assert!(
            JumptunnelCli::try_parse_from(["jumptunnel", "service-details", "--env", "dev"])
                .is_err()
        );
        assert!(
            JumptunnelCli::try_parse_from(["jumptunnel", "create-tunnel", "--services", "db"])
                .is_err()
        );
        assert!(
            JumptunnelCli::try_parse_from([
                "jumptunnel",
                "create-tunnel",
                "--env",
                "",
                "--services",
                "db"
            ])
            .is_err()
        );
    }
}
