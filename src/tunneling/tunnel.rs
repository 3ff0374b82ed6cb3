use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cloud::{CloudError, ParameterStore, get_parameters_by_batch_of_paths},
    config::{ConfigError, PortRange, ServiceConfig, TunnelSettings},
};

use super::{
    jumphost::{Jumphost, JumphostSelector},
    port::find_available_port,
    resolver::ValueResolver,
    session::{SessionLauncher, SessionRegistry, SessionRequest, TunnelSession},
};

pub const HOST_KEY: &str = "host";
pub const REMOTE_PORT_KEY: &str = "remote_port";
pub const LOCAL_PORT_RANGE_KEY: &str = "local_port_range";

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("cannot specify both `value` and `ssm_param`")]
    ConflictingSource,
    #[error("neither `value` nor `ssm_param` specified")]
    MissingSource,
    #[error("failed to resolve {path} for environment {environment}: {source}")]
    ResolutionFailed {
        path: String,
        environment: String,
        #[source]
        source: CloudError,
    },
    #[error("failed to look up jumphost instances: {0}")]
    InstanceQuery(#[source] CloudError),
    #[error("no running instances found matching filter: {0}")]
    NoHealthyJumphost(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("no available ports in range {0}")]
    NoPortAvailable(PortRange),
    #[error("invalid port range {0}")]
    InvalidPortRange(PortRange),
    #[error("failed to start session for {1}: {0}")]
    LaunchFailed(std::io::Error, String),
    #[error("one or more tunnels failed to create ({failed:?}), last error: {last}")]
    TunnelsFailed {
        failed: Vec<String>,
        last: Box<TunnelError>,
    },
    #[error("failed to close tunnels {failed:?}: {first}")]
    CleanupFailed {
        failed: Vec<String>,
        first: std::io::Error,
    },
    #[error("no services requested")]
    NoServices,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {1}")]
    Io(std::io::Error, String),
}
impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        let str = value.to_string();
        Self::Io(value, str)
    }
}

/// Opens forwarding sessions through a jumphost of one environment and keeps track of them.
pub(crate) struct TunnelManager {
    settings: TunnelSettings,
    resolver: ValueResolver,
    selector: JumphostSelector,
    launcher: Box<dyn SessionLauncher>,
    registry: Arc<SessionRegistry>,
    /// resolved on first use, then kept for the manager's lifetime
    jumphost: Option<Jumphost>,
}

impl TunnelManager {
    pub fn new(
        settings: TunnelSettings,
        environment: &str,
        store: Arc<dyn ParameterStore>,
        selector: JumphostSelector,
        launcher: Box<dyn SessionLauncher>,
    ) -> Self {
        let resolver = ValueResolver::new(store, &settings.placeholder, environment);
        TunnelManager {
            settings,
            resolver,
            selector,
            launcher,
            registry: Arc::new(SessionRegistry::new()),
            jumphost: None,
        }
    }
    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }
    /// the registry is shared so cleanup can run from a signal handler
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }
    pub async fn jumphost(&mut self) -> Result<Jumphost, TunnelError> {
        if let Some(jumphost) = &self.jumphost {
            return Ok(jumphost.clone());
        }
        let jumphost = self
            .selector
            .select_jumphost(
                self.resolver.environment(),
                &self.settings.jumphost_filter,
                &self.settings.placeholder,
            )
            .await?;
        info!(
            "using jumphost: {} ({}, {})",
            jumphost.name,
            jumphost.id,
            jumphost.address.as_deref().unwrap_or("no private address")
        );
        self.jumphost = Some(jumphost.clone());
        Ok(jumphost)
    }
    /// Creates a tunnel for every service in `services`. A failing service does not stop
    /// the others and never closes the tunnels that were created; only a missing jumphost
    /// aborts the whole batch.
    pub async fn create_tunnels(&mut self, services: &[String]) -> Result<(), TunnelError> {
        if services.is_empty() {
            return Err(TunnelError::NoServices);
        }
        self.jumphost().await?;

        let mut failed = Vec::new();
        let mut last_error = None;
        for service in services {
            let result = match self.settings.get_service_config(service).cloned() {
                Some(config) => self.create_tunnel(service, &config).await,
                None => Err(TunnelError::UnknownService(service.clone())),
            };
            if let Err(e) = result {
                warn!("error creating tunnel for {service}: {e}");
                failed.push(service.clone());
                last_error = Some(e);
            }
        }
        match last_error {
            Some(last) => Err(TunnelError::TunnelsFailed {
                failed,
                last: Box::new(last),
            }),
            None => Ok(()),
        }
    }
    /// Starts the forwarding session of a single service. Returns once the session
    /// process is running, which says nothing about the tunnel being usable yet.
    pub async fn create_tunnel(
        &mut self,
        service: &str,
        config: &ServiceConfig,
    ) -> Result<(), TunnelError> {
        debug!("creating tunnel for service: {service}");
        let jumphost = self.jumphost().await?;
        let host = self.resolver.resolve(&config.host).await?;
        debug!("retrieved host for {service}: {host}");
        let remote_port = self.resolver.resolve(&config.remote_port).await?;
        debug!("retrieved remote port for {service}: {remote_port}");
        let local_port = find_available_port(&config.local_port_range)?;
        debug!("found available local port for {service}: {local_port}");

        let request = SessionRequest {
            target: jumphost.id,
            host,
            remote_port,
            local_port,
        };
        let handle = self
            .launcher
            .launch(&request)
            .map_err(|e| TunnelError::LaunchFailed(e, service.to_string()))?;
        let session = TunnelSession {
            service: service.to_string(),
            handle,
            local_port,
            host: request.host,
            remote_port: request.remote_port,
        };
        info!("created tunnel for {session}");
        if let Some(mut replaced) = self.registry.store(session) {
            warn!("replacing the running tunnel for {service}");
            if let Err(e) = replaced.handle.terminate().await {
                warn!("failed to close the replaced tunnel for {service}: {e}");
            }
        }
        Ok(())
    }
    /// Resolves what is known about a service without opening anything. Failing to fetch
    /// the extra `service_details` parameters only logs a warning.
    pub async fn get_service_details(
        &self,
        service: &str,
        config: &ServiceConfig,
    ) -> Result<BTreeMap<String, String>, TunnelError> {
        let mut details = BTreeMap::new();
        details.insert(
            HOST_KEY.to_string(),
            self.resolver.resolve(&config.host).await?,
        );
        details.insert(
            REMOTE_PORT_KEY.to_string(),
            self.resolver.resolve(&config.remote_port).await?,
        );

        if !config.service_details.is_empty() {
            let paths: Vec<String> = config
                .service_details
                .iter()
                .map(|p| self.resolver.substitute(p))
                .collect();
            debug!("getting parameters: {paths:?}");
            match get_parameters_by_batch_of_paths(self.resolver.store(), &paths).await {
                Ok(parameters) => {
                    for parameter in parameters {
                        let key = parameter
                            .name
                            .rsplit_once('/')
                            .map_or(parameter.name.as_str(), |(_, last)| last)
                            .to_string();
                        details.insert(key, parameter.value);
                    }
                }
                Err(e) => warn!("failed to get parameters for {service}: {e}"),
            }
        }

        details.insert(
            LOCAL_PORT_RANGE_KEY.to_string(),
            config.local_port_range.to_string(),
        );
        Ok(details)
    }
    pub async fn cleanup_tunnels(&self) -> Result<(), TunnelError> {
        self.registry.cleanup().await
    }
}
