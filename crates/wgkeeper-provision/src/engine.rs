//! Provisioning workflows.
//!
//! Each operation opens one session to the target host, runs its remote steps
//! in a fixed order and closes the session on every exit path. Operations on
//! the same server are serialized by a per-server lock held for the whole
//! operation, so registry rewrites and address allocation never interleave.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use wgkeeper_core::config::ProvisioningConfig;

use crate::error::{ProvisionError, ProvisionStage};
use crate::layout::{
    DEFAULT_ROUTE_IFACE, DISCOVER_PUBLIC_IP, GENERATE_KEYPAIR, HostLayout, READ_OS_RELEASE,
    SYSCTL_CONTENT, SYSCTL_PATH, WHICH_WG,
};
use crate::os::{self, FALLBACK_ORDER, OsFamily};
use crate::registry::{self, PeerRegistry};
use crate::session::{Connector, HostTarget, RemoteShell};
use crate::templates;

/// Margin by which the connector's own bound outlives the setup deadline.
const SETUP_CONNECT_GRACE: Duration = Duration::from_secs(1);

/// Per-call snapshot of the server side of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub public_key: String,
    pub public_ip: String,
    pub listen_port: u16,
}

/// Drives remote hosts through setup and peer lifecycle operations.
pub struct ProvisioningEngine {
    connector: Arc<dyn Connector>,
    config: ProvisioningConfig,
    layout: HostLayout,
    host_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ProvisioningEngine {
    pub fn new(connector: Arc<dyn Connector>, config: ProvisioningConfig) -> Self {
        let layout = HostLayout::from_config(&config);
        Self {
            connector,
            config,
            layout,
            host_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Local path of the client configuration file for `client_name`.
    pub fn artifact_path(&self, client_name: &str) -> PathBuf {
        self.config.artifact_dir.join(format!("{client_name}.conf"))
    }

    /// Install and configure WireGuard on `host`.
    ///
    /// Idempotent: an existing installation, key pair or registry is kept.
    /// Connecting is bounded by the setup timeout and reported as
    /// [`ProvisionError::SetupTimeout`] when it expires.
    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn setup_server(&self, host: &HostTarget) -> Result<(), ProvisionError> {
        let _guard = self.lock_host(host.id).await;

        let setup_timeout = Duration::from_secs(self.config.setup_timeout_secs);
        // Only the setup deadline may expire the connect.
        let connect = self
            .connector
            .connect(host, setup_timeout + SETUP_CONNECT_GRACE);
        let mut shell = match tokio::time::timeout(setup_timeout, connect).await {
            Ok(shell) => shell?,
            Err(_) => {
                return Err(ProvisionError::SetupTimeout {
                    host: host.address.clone(),
                    secs: self.config.setup_timeout_secs,
                });
            }
        };

        let result = self.setup_on(shell.as_mut(), host).await;
        finish(shell, host, result).await?;
        info!("Server ready");
        Ok(())
    }

    /// Add a peer for `client_name` and write its client configuration file.
    ///
    /// Returns the artifact path. If the name is already taken on the host a
    /// `-2`, `-3`, ... suffix is added and the path follows the final name.
    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn create_client_config(
        &self,
        host: &HostTarget,
        client_name: &str,
    ) -> Result<PathBuf, ProvisionError> {
        validate_client_name(client_name)?;
        let _guard = self.lock_host(host.id).await;

        let mut shell = self.open(host).await?;
        let result = self.create_on(shell.as_mut(), host, client_name).await;
        let (name, artifact) = finish(shell, host, result).await?;

        let path = self
            .write_artifact(&name, &artifact)
            .await
            .map_err(|e| e.at_stage(ProvisionStage::WriteArtifact))?;
        info!(client = %name, path = %path.display(), "Client provisioned");
        Ok(path)
    }

    /// Remove the peer, restart the service and delete the local artifact.
    /// A peer missing from the registry or a missing artifact is not an error.
    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn remove_client(
        &self,
        host: &HostTarget,
        client_name: &str,
    ) -> Result<(), ProvisionError> {
        let artifact = self.artifact_path(client_name);
        self.remove(host, client_name, &artifact).await
    }

    /// Remove the client whose configuration file is `config_path`.
    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn revoke_client_config(
        &self,
        host: &HostTarget,
        config_path: &Path,
    ) -> Result<(), ProvisionError> {
        let name = client_name_from_path(config_path)?;
        self.remove(host, &name, config_path).await
    }

    /// Comment the client's peer out of the registry.
    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn block_client(
        &self,
        host: &HostTarget,
        config_path: &Path,
    ) -> Result<(), ProvisionError> {
        let name = client_name_from_path(config_path)?;
        self.set_blocked(host, &name, true).await
    }

    /// Restore a blocked client's peer.
    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn unblock_client(
        &self,
        host: &HostTarget,
        config_path: &Path,
    ) -> Result<(), ProvisionError> {
        let name = client_name_from_path(config_path)?;
        self.set_blocked(host, &name, false).await
    }

    #[instrument(skip(self, host), fields(server_id = host.id, address = %host.address))]
    pub async fn is_client_blocked(
        &self,
        host: &HostTarget,
        config_path: &Path,
    ) -> Result<bool, ProvisionError> {
        let name = client_name_from_path(config_path)?;
        let _guard = self.lock_host(host.id).await;
        let mut shell = self.open(host).await?;
        let result = PeerRegistry::new(shell.as_mut(), &self.layout)
            .is_blocked(&name)
            .await;
        finish(shell, host, result).await
    }

    /// Read the server's public key, public address and listen port,
    /// generating the server key pair if it is missing.
    pub async fn server_info(
        &self,
        shell: &mut dyn RemoteShell,
        host: &HostTarget,
    ) -> Result<ServerInfo, ProvisionError> {
        let public_key = match read_trimmed(shell, &self.layout.read_public_key()).await {
            Some(key) => key,
            None => {
                if !self.ensure_server_keys(shell).await? {
                    shell.run(&self.layout.derive_server_public_key()).await?;
                }
                read_trimmed(shell, &self.layout.read_public_key())
                    .await
                    .ok_or_else(|| ProvisionError::CommandFailed {
                        command: self.layout.read_public_key(),
                        stderr: "server public key is empty".into(),
                    })?
            }
        };

        let public_ip = shell
            .run(DISCOVER_PUBLIC_IP)
            .await
            .ok()
            .and_then(|out| {
                out.lines()
                    .map(str::trim)
                    .find(|line| line.parse::<std::net::IpAddr>().is_ok())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                debug!("Public IP discovery failed, using configured address");
                host.address.clone()
            });

        let listen_port = PeerRegistry::new(shell, &self.layout)
            .read()
            .await
            .ok()
            .and_then(|text| registry::listen_port(&text))
            .unwrap_or(self.config.listen_port);

        Ok(ServerInfo {
            public_key,
            public_ip,
            listen_port,
        })
    }

    // ---------------------------------------------------------------------
    // Private helpers
    // ---------------------------------------------------------------------

    const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    fn server_address(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.config.tunnel_network.octets();
        Ipv4Addr::new(a, b, c, 1)
    }

    async fn lock_host(&self, server_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.host_locks.lock().await;
            Arc::clone(locks.entry(server_id).or_default())
        };
        lock.lock_owned().await
    }

    async fn open(&self, host: &HostTarget) -> Result<Box<dyn RemoteShell>, ProvisionError> {
        self.connector.connect(host, self.connect_timeout()).await
    }

    async fn setup_on(
        &self,
        shell: &mut dyn RemoteShell,
        host: &HostTarget,
    ) -> Result<(), ProvisionError> {
        if shell.run(WHICH_WG).await.is_ok() {
            debug!("WireGuard already installed");
        } else {
            self.install_wireguard(shell).await?;
        }

        shell.run(&self.layout.ensure_dir()).await?;
        self.ensure_server_keys(shell).await?;

        if shell.run(&self.layout.has_registry()).await.is_err() {
            let private_key = read_trimmed(shell, &self.layout.read_private_key())
                .await
                .ok_or_else(|| ProvisionError::CommandFailed {
                    command: self.layout.read_private_key(),
                    stderr: "server private key is empty".into(),
                })?;
            let egress = read_trimmed(shell, DEFAULT_ROUTE_IFACE)
                .await
                .unwrap_or_else(|| "eth0".to_string());
            let content = templates::server_interface(&templates::ServerInterface {
                private_key: &private_key,
                address: self.server_address(),
                listen_port: self.config.listen_port,
                interface: &self.layout.interface,
                egress: &egress,
            });
            PeerRegistry::new(shell, &self.layout)
                .commit(&content)
                .await?;
            info!(%egress, "Registry created");
        }

        shell.write_file(SYSCTL_PATH, SYSCTL_CONTENT).await?;
        shell.run(&self.layout.apply_sysctl()).await?;
        shell.run(&self.layout.enable_service()).await?;

        if let Err(e) = shell.run(&self.layout.verify_interface()).await {
            warn!(server_id = host.id, error = %e, "Interface missing after setup");
            return Err(ProvisionError::InterfaceVerificationFailed(
                self.layout.interface.clone(),
            ));
        }
        Ok(())
    }

    async fn install_wireguard(&self, shell: &mut dyn RemoteShell) -> Result<(), ProvisionError> {
        let release = shell.run(READ_OS_RELEASE).await.unwrap_or_default();
        let family = OsFamily::detect(&release);
        info!(os = family.as_str(), "Installing WireGuard");

        if family != OsFamily::Unknown {
            return run_install_steps(shell, family).await;
        }

        for candidate in FALLBACK_ORDER {
            let Some(manager) = candidate.package_manager() else {
                continue;
            };
            if shell.run(&format!("which {manager}")).await.is_err() {
                continue;
            }
            match run_install_steps(shell, candidate).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(%manager, error = %e, "Install attempt failed"),
            }
        }
        Err(ProvisionError::UnsupportedOs(os::describe(&release)))
    }

    /// Generate the server key pair unless a private key exists. Returns
    /// whether keys were generated.
    async fn ensure_server_keys(&self, shell: &mut dyn RemoteShell) -> Result<bool, ProvisionError> {
        if shell.run(&self.layout.has_server_keys()).await.is_ok() {
            return Ok(false);
        }
        shell.run(&self.layout.generate_server_keys()).await?;
        info!("Server key pair generated");
        Ok(true)
    }

    async fn create_on(
        &self,
        shell: &mut dyn RemoteShell,
        host: &HostTarget,
        requested: &str,
    ) -> Result<(String, String), ProvisionError> {
        let (private_key, public_key) = generate_client_keys(shell)
            .await
            .map_err(|e| e.at_stage(ProvisionStage::GenerateClientKeys))?;

        let info = self
            .server_info(shell, host)
            .await
            .map_err(|e| e.at_stage(ProvisionStage::ReadServerInfo))?;

        let mut peers = PeerRegistry::new(shell, &self.layout);
        let (name, address) = peers
            .allocate(requested, self.config.tunnel_network)
            .await
            .map_err(|e| e.at_stage(ProvisionStage::AllocateAddress))?;
        if name != requested {
            info!(%requested, assigned = %name, "Client name taken, using suffixed name");
        }
        debug!(client = %name, %address, "Address allocated");

        peers
            .append_peer(&name, &public_key, address)
            .await
            .map_err(|e| e.at_stage(ProvisionStage::AppendPeer))?;
        shell
            .run(&self.layout.restart_service())
            .await
            .map_err(|e| e.at_stage(ProvisionStage::RestartService))?;

        let artifact = templates::client_config(&templates::ClientConfig {
            private_key: &private_key,
            address,
            dns: &self.config.dns,
            server_public_key: &info.public_key,
            endpoint_host: &info.public_ip,
            endpoint_port: info.listen_port,
            keepalive_secs: self.config.keepalive_secs,
        });
        Ok((name, artifact))
    }

    async fn remove(
        &self,
        host: &HostTarget,
        name: &str,
        artifact: &Path,
    ) -> Result<(), ProvisionError> {
        let _guard = self.lock_host(host.id).await;
        let mut shell = self.open(host).await?;
        let result = self.remove_on(shell.as_mut(), name).await;
        finish(shell, host, result).await?;

        match tokio::fs::remove_file(artifact).await {
            Ok(()) => debug!(path = %artifact.display(), "Artifact deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(client = %name, "Client removed");
        Ok(())
    }

    async fn remove_on(&self, shell: &mut dyn RemoteShell, name: &str) -> Result<(), ProvisionError> {
        if PeerRegistry::new(shell, &self.layout).remove_peer(name).await? {
            shell.run(&self.layout.restart_service()).await?;
        } else {
            debug!(client = %name, "Peer not in registry");
        }
        Ok(())
    }

    async fn set_blocked(
        &self,
        host: &HostTarget,
        name: &str,
        blocked: bool,
    ) -> Result<(), ProvisionError> {
        let _guard = self.lock_host(host.id).await;
        let mut shell = self.open(host).await?;
        let result = self.set_blocked_on(shell.as_mut(), name, blocked).await;
        finish(shell, host, result).await?;
        info!(client = %name, blocked, "Client access updated");
        Ok(())
    }

    async fn set_blocked_on(
        &self,
        shell: &mut dyn RemoteShell,
        name: &str,
        blocked: bool,
    ) -> Result<(), ProvisionError> {
        if PeerRegistry::new(shell, &self.layout)
            .set_blocked(name, blocked)
            .await?
        {
            shell.run(&self.layout.restart_service()).await?;
        } else {
            debug!(client = %name, blocked, "Peer already in requested state");
        }
        Ok(())
    }

    async fn write_artifact(&self, name: &str, content: &str) -> Result<PathBuf, ProvisionError> {
        tokio::fs::create_dir_all(&self.config.artifact_dir).await?;
        let path = self.artifact_path(name);

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }
}

/// Close the session, keeping the operation's own result.
async fn finish<T>(
    shell: Box<dyn RemoteShell>,
    host: &HostTarget,
    result: Result<T, ProvisionError>,
) -> Result<T, ProvisionError> {
    if let Err(e) = shell.close().await {
        warn!(server_id = host.id, error = %e, "Closing session failed");
    }
    result
}

async fn read_trimmed(shell: &mut dyn RemoteShell, command: &str) -> Option<String> {
    let out = shell.run(command).await.ok()?;
    let trimmed = out.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

async fn run_install_steps(
    shell: &mut dyn RemoteShell,
    family: OsFamily,
) -> Result<(), ProvisionError> {
    for step in family.install_steps() {
        match shell.run(step.command).await {
            Ok(_) => {}
            Err(e) if step.may_fail => {
                debug!(command = step.command, error = %e, "Optional install step failed");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn generate_client_keys(
    shell: &mut dyn RemoteShell,
) -> Result<(String, String), ProvisionError> {
    let out = shell.run(GENERATE_KEYPAIR).await?;
    let mut lines = out.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next()) {
        (Some(private_key), Some(public_key)) => {
            Ok((private_key.to_string(), public_key.to_string()))
        }
        _ => Err(ProvisionError::CommandFailed {
            command: "wg genkey".into(),
            stderr: "unexpected key generator output".into(),
        }),
    }
}

/// Client names become registry markers and file names.
fn validate_client_name(name: &str) -> Result<(), ProvisionError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidConfigPath(name.to_string()))
    }
}

/// The client name is the artifact's base name without extension.
fn client_name_from_path(path: &Path) -> Result<String, ProvisionError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::InvalidConfigPath(path.display().to_string()))
}
