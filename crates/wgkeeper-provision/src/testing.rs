//! In-memory remote host for tests.
//!
//! [`FakeHost`] is a [`Connector`] whose sessions interpret the exact command
//! lines the engine sends, against an in-memory file map. All sessions opened
//! from one `FakeHost` (and its clones) share the same host state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProvisionError;
use crate::layout::{
    DEFAULT_ROUTE_IFACE, DISCOVER_PUBLIC_IP, GENERATE_KEYPAIR, HostLayout, READ_OS_RELEASE,
    WHICH_WG,
};
use crate::session::{Connector, HostTarget, RemoteShell};
use crate::templates::{self, ServerInterface};

const PACKAGE_MANAGERS: [&str; 4] = ["apt-get", "yum", "pacman", "apk"];

/// Ways a fake connection attempt can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Unreachable,
    AuthFailed,
    PrivilegeDenied,
}

#[derive(Debug)]
struct HostState {
    layout: HostLayout,
    files: HashMap<String, String>,
    os_release: String,
    package_managers: Vec<String>,
    wg_installed: bool,
    interface_up: bool,
    interface_comes_up: bool,
    public_ip: String,
    egress: String,
    fail_patterns: Vec<String>,
    connect_failure: Option<ConnectFailure>,
    connect_delay: Option<Duration>,
    commands: Vec<String>,
    connects: usize,
    closes: usize,
    restarts: usize,
    server_keygens: usize,
    client_keygens: usize,
}

fn failed(command: &str, stderr: &str) -> ProvisionError {
    ProvisionError::CommandFailed {
        command: command.to_string(),
        stderr: stderr.to_string(),
    }
}

fn unquote(arg: &str) -> &str {
    arg.trim()
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(arg)
}

impl HostState {
    fn non_empty(&self, path: &str) -> bool {
        self.files.get(path).is_some_and(|c| !c.is_empty())
    }

    fn execute(&mut self, command: &str) -> Result<String, ProvisionError> {
        self.commands.push(command.to_string());
        if self.fail_patterns.iter().any(|p| command.contains(p.as_str())) {
            return Err(failed(command, "injected failure"));
        }

        let layout = self.layout.clone();
        match command {
            WHICH_WG => {
                if self.wg_installed {
                    Ok("/usr/bin/wg\n".into())
                } else {
                    Err(failed(command, ""))
                }
            }
            READ_OS_RELEASE => Ok(self.os_release.clone()),
            GENERATE_KEYPAIR => {
                if !self.wg_installed {
                    return Err(failed(command, "wg: command not found"));
                }
                self.client_keygens += 1;
                let n = self.client_keygens;
                Ok(format!("client-priv-{n}\nclient-pub-{n}\n"))
            }
            DEFAULT_ROUTE_IFACE => Ok(format!("{}\n", self.egress)),
            DISCOVER_PUBLIC_IP => Ok(format!("{}\n", self.public_ip)),
            c if c == layout.ensure_dir() => Ok(String::new()),
            c if c == layout.has_server_keys() => {
                if self.non_empty(&layout.private_key_path()) {
                    Ok(String::new())
                } else {
                    Err(failed(command, ""))
                }
            }
            c if c == layout.generate_server_keys() => {
                self.server_keygens += 1;
                let n = self.server_keygens;
                self.files
                    .insert(layout.private_key_path(), format!("server-priv-{n}\n"));
                self.files
                    .insert(layout.public_key_path(), format!("server-pub-{n}\n"));
                Ok(String::new())
            }
            c if c == layout.derive_server_public_key() => {
                let private = self
                    .files
                    .get(&layout.private_key_path())
                    .ok_or_else(|| failed(command, "No such file or directory"))?;
                let public = private.replace("priv", "pub");
                self.files.insert(layout.public_key_path(), public);
                Ok(String::new())
            }
            c if c == layout.has_registry() => {
                if self.non_empty(&layout.registry_path()) {
                    Ok(String::new())
                } else {
                    Err(failed(command, ""))
                }
            }
            c if c == layout.commit_registry() => {
                let staged = self
                    .files
                    .remove(&layout.registry_staging_path())
                    .ok_or_else(|| failed(command, "No such file or directory"))?;
                self.files.insert(layout.registry_path(), staged);
                Ok(String::new())
            }
            c if c == layout.apply_sysctl() => Ok("net.ipv4.ip_forward = 1\n".into()),
            c if c == layout.enable_service() => {
                if self.interface_comes_up {
                    self.interface_up = true;
                }
                Ok(String::new())
            }
            c if c == layout.restart_service() => {
                self.restarts += 1;
                Ok(String::new())
            }
            c if c == layout.verify_interface() => {
                if self.interface_up {
                    Ok(format!("4: {}: <POINTOPOINT,NOARP,UP,LOWER_UP>\n", layout.interface))
                } else {
                    Err(failed(command, "Device does not exist."))
                }
            }
            c if c.starts_with("cat ") => self
                .files
                .get(unquote(&c[4..]))
                .cloned()
                .ok_or_else(|| failed(command, "No such file or directory")),
            c if c.starts_with("which ") => {
                let program = c["which ".len()..].trim();
                if self.package_managers.iter().any(|m| m == program) {
                    Ok(format!("/usr/bin/{program}\n"))
                } else {
                    Err(failed(command, ""))
                }
            }
            c => {
                let manager = PACKAGE_MANAGERS.iter().find(|m| {
                    c.split_whitespace()
                        .any(|word| word == **m)
                });
                match manager {
                    Some(m) if self.package_managers.iter().any(|a| a == m) => {
                        if c.contains("wireguard-tools") {
                            self.wg_installed = true;
                        }
                        Ok(String::new())
                    }
                    Some(m) => Err(failed(command, &format!("{m}: command not found"))),
                    None => Err(failed(command, "fake host: unknown command")),
                }
            }
        }
    }
}

/// A scripted remote host.
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A fresh Debian host with `apt-get` and no WireGuard.
    pub fn new() -> Self {
        let state = HostState {
            layout: HostLayout::default(),
            files: HashMap::new(),
            os_release: "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n".into(),
            package_managers: vec!["apt-get".into()],
            wg_installed: false,
            interface_up: false,
            interface_comes_up: true,
            public_ip: "203.0.113.10".into(),
            egress: "eth0".into(),
            fail_patterns: Vec::new(),
            connect_failure: None,
            connect_delay: None,
            commands: Vec::new(),
            connects: 0,
            closes: 0,
            restarts: 0,
            server_keygens: 0,
            client_keygens: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A host that already went through setup: WireGuard installed, server
    /// keys `server-priv-0` / `server-pub-0`, registry holding only the
    /// interface section. No commands are recorded.
    pub fn provisioned() -> Self {
        let host = Self::new();
        {
            let mut s = host.lock();
            let layout = s.layout.clone();
            s.wg_installed = true;
            s.interface_up = true;
            s.files
                .insert(layout.private_key_path(), "server-priv-0\n".into());
            s.files
                .insert(layout.public_key_path(), "server-pub-0\n".into());
            let registry = templates::server_interface(&ServerInterface {
                private_key: "server-priv-0",
                address: std::net::Ipv4Addr::new(10, 0, 0, 1),
                listen_port: 51820,
                interface: &layout.interface,
                egress: "eth0",
            });
            s.files.insert(layout.registry_path(), registry);
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_os_release(self, content: &str) -> Self {
        self.lock().os_release = content.to_string();
        self
    }

    #[must_use]
    pub fn with_package_managers(self, managers: &[&str]) -> Self {
        self.lock().package_managers = managers.iter().map(|m| (*m).to_string()).collect();
        self
    }

    /// Fail every command containing `pattern`.
    #[must_use]
    pub fn fail_on(self, pattern: &str) -> Self {
        self.lock().fail_patterns.push(pattern.to_string());
        self
    }

    #[must_use]
    pub fn refuse(self, failure: ConnectFailure) -> Self {
        self.lock().connect_failure = Some(failure);
        self
    }

    /// Delay every connection attempt.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    /// `systemctl enable --now` succeeds but the interface never appears.
    #[must_use]
    pub fn interface_stays_down(self) -> Self {
        self.lock().interface_comes_up = false;
        self
    }

    /// Stop failing commands and accept connections again.
    pub fn heal(&self) {
        let mut s = self.lock();
        s.fail_patterns.clear();
        s.connect_failure = None;
        s.connect_delay = None;
    }

    pub fn remove_file(&self, path: &str) {
        self.lock().files.remove(path);
    }

    pub fn set_registry(&self, content: &str) {
        let mut s = self.lock();
        let path = s.layout.registry_path();
        s.files.insert(path, content.to_string());
    }

    pub fn registry(&self) -> Option<String> {
        let s = self.lock();
        s.files.get(&s.layout.registry_path()).cloned()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn wireguard_installed(&self) -> bool {
        self.lock().wg_installed
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Whether exactly `command` was run.
    pub fn ran(&self, command: &str) -> bool {
        self.lock().commands.iter().any(|c| c == command)
    }

    /// Number of commands containing `pattern`.
    pub fn count_commands(&self, pattern: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn restarts(&self) -> usize {
        self.lock().restarts
    }

    pub fn server_keygens(&self) -> usize {
        self.lock().server_keygens
    }

    pub fn client_keygens(&self) -> usize {
        self.lock().client_keygens
    }
}

#[async_trait]
impl Connector for FakeHost {
    async fn connect(
        &self,
        target: &HostTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, ProvisionError> {
        let (failure, delay) = {
            let mut s = self.lock();
            s.connects += 1;
            (s.connect_failure, s.connect_delay)
        };

        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(ProvisionError::Unreachable {
                    host: target.address.clone(),
                    reason: format!("no session within {}s", timeout.as_secs()),
                });
            }
            tokio::time::sleep(delay).await;
        }

        match failure {
            None => Ok(Box::new(FakeShell { host: self.clone() })),
            Some(ConnectFailure::Unreachable) => Err(ProvisionError::Unreachable {
                host: target.address.clone(),
                reason: "connection refused".into(),
            }),
            Some(ConnectFailure::AuthFailed) => Err(ProvisionError::AuthFailed {
                host: target.address.clone(),
                user: target.user.clone(),
            }),
            Some(ConnectFailure::PrivilegeDenied) => Err(ProvisionError::PrivilegeDenied {
                host: target.address.clone(),
                user: target.user.clone(),
            }),
        }
    }
}

struct FakeShell {
    host: FakeHost,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run(&mut self, command: &str) -> Result<String, ProvisionError> {
        // Yield so concurrent sessions interleave at command boundaries.
        tokio::task::yield_now().await;
        self.host.lock().execute(command)
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut s = self.host.lock();
        let record = format!("write {path}");
        if s.fail_patterns.iter().any(|p| record.contains(p.as_str())) {
            s.commands.push(record);
            return Err(failed(path, "injected failure"));
        }
        s.commands.push(record);
        s.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), ProvisionError> {
        self.host.lock().closes += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::Credentials;

    fn target() -> HostTarget {
        HostTarget {
            id: 1,
            address: "192.0.2.1".into(),
            port: 22,
            user: "root".into(),
            credentials: Credentials::Password("pw".into()),
        }
    }

    #[tokio::test]
    async fn registry_commit_goes_through_staging() {
        let host = FakeHost::provisioned();
        let layout = HostLayout::default();
        let mut shell = host
            .connect(&target(), Duration::from_secs(1))
            .await
            .unwrap();

        shell
            .write_file(&layout.registry_staging_path(), "[Interface]\n")
            .await
            .unwrap();
        assert_ne!(host.registry().as_deref(), Some("[Interface]\n"));
        shell.run(&layout.commit_registry()).await.unwrap();
        assert_eq!(host.registry().as_deref(), Some("[Interface]\n"));
        assert!(host.file(&layout.registry_staging_path()).is_none());
        shell.close().await.unwrap();
        assert_eq!(host.closes(), 1);
    }

    #[tokio::test]
    async fn unknown_commands_fail() {
        let host = FakeHost::new();
        let mut shell = host
            .connect(&target(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(shell.run("reboot").await.is_err());
        assert!(host.ran("reboot"));
    }

    #[tokio::test]
    async fn refused_connection_records_attempt() {
        let host = FakeHost::new().refuse(ConnectFailure::PrivilegeDenied);
        let result = host.connect(&target(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProvisionError::PrivilegeDenied { .. })));
        assert_eq!(host.connects(), 1);
        host.heal();
        assert!(host.connect(&target(), Duration::from_secs(1)).await.is_ok());
    }
}
