use std::{collections::BTreeMap, process::Stdio, sync::Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::tunnel::TunnelError;

pub const PORT_FORWARDING_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// what a forwarding session connects: `localhost:local_port` -> `host:remote_port` via `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionRequest {
    /// jumphost instance id
    pub target: String,
    pub host: String,
    pub remote_port: String,
    pub local_port: u16,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait SessionHandle: Send {
    fn pid(&self) -> Option<u32>;
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// Starts forwarding processes. A successful launch only means the process started,
/// not that the tunnel is up.
#[cfg_attr(test, automock)]
pub(crate) trait SessionLauncher: Send + Sync {
    fn launch(&self, request: &SessionRequest) -> std::io::Result<Box<dyn SessionHandle>>;
}

/// Launches `aws ssm start-session` with the port forwarding document.
pub struct AwsCliLauncher {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}
impl AwsCliLauncher {
    pub fn new(region: Option<String>, profile: Option<String>) -> Self {
        AwsCliLauncher {
            program: String::from("aws"),
            region,
            profile,
        }
    }
    fn args(&self, request: &SessionRequest) -> Vec<String> {
        let parameters = json!({
            "host": [request.host],
            "portNumber": [request.remote_port],
            "localPortNumber": [request.local_port.to_string()],
        });
        let mut args = vec![
            String::from("ssm"),
            String::from("start-session"),
            String::from("--target"),
            request.target.clone(),
            String::from("--document-name"),
            String::from(PORT_FORWARDING_DOCUMENT),
            String::from("--parameters"),
            parameters.to_string(),
        ];
        if let Some(region) = &self.region {
            args.extend([String::from("--region"), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            args.extend([String::from("--profile"), profile.clone()]);
        }
        args
    }
}
impl SessionLauncher for AwsCliLauncher {
    fn launch(&self, request: &SessionRequest) -> std::io::Result<Box<dyn SessionHandle>> {
        let args = self.args(request);
        debug!("starting: {} {}", self.program, args.join(" "));
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        debug!("session process started with pid {:?}", child.id());
        Ok(Box::new(ChildSession { child }))
    }
}

struct ChildSession {
    child: Child,
}
#[async_trait]
impl SessionHandle for ChildSession {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
    async fn terminate(&mut self) -> std::io::Result<()> {
        // kill() also reaps the child
        self.child.kill().await
    }
}

pub(crate) struct TunnelSession {
    pub service: String,
    pub handle: Box<dyn SessionHandle>,
    pub local_port: u16,
    pub host: String,
    pub remote_port: String,
}
impl std::fmt::Display for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: localhost:{} -> {}:{}",
            self.service, self.local_port, self.host, self.remote_port
        )
    }
}

/// Running sessions by service name. Inserts and cleanup may happen from different tasks;
/// the lock is never held while a process is being terminated.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, TunnelSession>>,
}
impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers `session` under its service name and returns the session it replaced.
    pub fn store(&self, session: TunnelSession) -> Option<TunnelSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.service.clone(), session)
    }
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// one line per session, sorted by service name
    pub fn describe(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.to_string())
            .collect()
    }
    /// Terminates every registered session. A failing termination does not stop the
    /// others; the first error is returned along with every service that failed.
    pub async fn cleanup(&self) -> Result<(), TunnelError> {
        let sessions = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *sessions)
        };
        let mut failed = Vec::new();
        let mut first = None;
        for (service, mut session) in sessions {
            // read before terminating, a reaped child has no pid
            let pid = session.handle.pid();
            match session.handle.terminate().await {
                Ok(()) => info!("closed tunnel for {service}"),
                Err(e) => {
                    warn!("failed to close tunnel for {service} (pid {pid:?}): {e}");
                    failed.push(service);
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            Some(first) => Err(TunnelError::CleanupFailed { failed, first }),
            None => Ok(()),
        }
    }
}
