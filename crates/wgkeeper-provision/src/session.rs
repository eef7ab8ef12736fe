//! Remote command execution.
//!
//! [`Connector`] opens an authenticated session to one host; the returned
//! [`RemoteShell`] runs commands with elevated privileges until it is closed.
//! The production implementation drives the system OpenSSH client: one
//! multiplexed master connection per session, with every command sent through
//! its control socket.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use wgkeeper_core::config::ProvisioningConfig;

use crate::error::ProvisionError;
use crate::shell::quote;

/// Bound on the initial TCP reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while the master connection comes up.
const MASTER_POLL: Duration = Duration::from_millis(150);

/// How a session authenticates.
#[derive(Clone)]
pub enum Credentials {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// A provisioning target.
#[derive(Debug, Clone)]
pub struct HostTarget {
    /// Server id; per-host serialization is keyed on it.
    pub id: i64,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
}

impl HostTarget {
    pub fn is_root(&self) -> bool {
        self.user == "root"
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// A live, privileged command session on one host.
///
/// Methods take `&mut self`: a session runs one command at a time.
#[async_trait]
pub trait RemoteShell: Send {
    /// Run `command` and return its stdout verbatim.
    async fn run(&mut self, command: &str) -> Result<String, ProvisionError>;

    /// Stream `content` into `path`, overwriting it.
    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), ProvisionError>;

    /// Tear the session down.
    async fn close(self: Box<Self>) -> Result<(), ProvisionError>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, authenticate and verify non-interactive privilege escalation,
    /// all within `timeout`.
    async fn connect(
        &self,
        target: &HostTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, ProvisionError>;
}

/// [`Connector`] backed by the system `ssh` (and `sshpass` for passwords).
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    command_timeout: Duration,
}

impl OpenSshConnector {
    pub const fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    pub const fn from_config(config: &ProvisioningConfig) -> Self {
        Self::new(Duration::from_secs(config.command_timeout_secs))
    }

    async fn establish(
        &self,
        target: &HostTarget,
        timeout: Duration,
    ) -> Result<OpenSshSession, ProvisionError> {
        probe_tcp(target).await?;

        let control_dir = tempfile::Builder::new()
            .prefix("wgkeeper-ssh-")
            .tempdir()?;
        let control_path = control_dir.path().join("master.sock");

        let mut master = ssh_command(target, &control_path, true);
        master
            .args(["-o", &format!("ConnectTimeout={}", timeout.as_secs().max(1))])
            .args(["-N", &target.destination()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut master = master.spawn()?;

        wait_for_master(target, &control_path, &mut master).await?;
        debug!(host = %target.address, "SSH master connection established");

        let session = OpenSshSession {
            host: target.address.clone(),
            destination: target.destination(),
            port: target.port,
            user: target.user.clone(),
            is_root: target.is_root(),
            control_path,
            _control_dir: control_dir,
            master,
            command_timeout: self.command_timeout,
        };
        session.verify_privilege().await
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(
        &self,
        target: &HostTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, ProvisionError> {
        match tokio::time::timeout(timeout, self.establish(target, timeout)).await {
            Ok(Ok(session)) => {
                info!(host = %target.address, user = %target.user, "Remote session opened");
                Ok(Box::new(session))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProvisionError::Unreachable {
                host: target.address.clone(),
                reason: format!("no session within {}s", timeout.as_secs()),
            }),
        }
    }
}

async fn probe_tcp(target: &HostTarget) -> Result<(), ProvisionError> {
    let unreachable = |reason: String| ProvisionError::Unreachable {
        host: target.address.clone(),
        reason,
    };
    match tokio::time::timeout(
        PROBE_TIMEOUT,
        TcpStream::connect((target.address.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(unreachable(format!("port {}: {e}", target.port))),
        Err(_) => Err(unreachable(format!(
            "port {} did not answer within {}s",
            target.port,
            PROBE_TIMEOUT.as_secs()
        ))),
    }
}

/// Base `ssh` invocation sharing the session's control socket. Only the
/// master authenticates; command invocations ride on its connection.
fn ssh_command(target: &HostTarget, control_path: &Path, master: bool) -> Command {
    let mut cmd = match (&target.credentials, master) {
        (Credentials::Password(password), true) => {
            let mut c = Command::new("sshpass");
            c.env("SSHPASS", password).args(["-e", "ssh"]);
            c
        }
        _ => Command::new("ssh"),
    };
    cmd.args([
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
        "-p",
        &target.port.to_string(),
    ]);
    cmd.arg("-o")
        .arg(format!("ControlPath={}", control_path.display()));

    if master {
        cmd.args(["-o", "ControlMaster=yes"]);
        match &target.credentials {
            Credentials::Password(_) => {
                cmd.args([
                    "-o",
                    "PubkeyAuthentication=no",
                    "-o",
                    "PreferredAuthentications=password,keyboard-interactive",
                    "-o",
                    "NumberOfPasswordPrompts=1",
                ]);
            }
            Credentials::KeyFile(path) => {
                cmd.args(["-o", "BatchMode=yes", "-i"]).arg(path);
            }
        }
    } else {
        cmd.args(["-o", "ControlMaster=no", "-o", "BatchMode=yes"]);
    }
    cmd
}

/// Poll the control socket until the master is up, or classify the master's
/// exit.
async fn wait_for_master(
    target: &HostTarget,
    control_path: &Path,
    master: &mut Child,
) -> Result<(), ProvisionError> {
    loop {
        if let Some(status) = master.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = master.stderr.take() {
                pipe.read_to_string(&mut stderr).await?;
            }
            // sshpass exits 5 on a rejected password
            let auth_failed = status.code() == Some(5)
                || stderr.contains("Permission denied")
                || stderr.contains("Authentication failed");
            return Err(if auth_failed {
                ProvisionError::AuthFailed {
                    host: target.address.clone(),
                    user: target.user.clone(),
                }
            } else {
                ProvisionError::Unreachable {
                    host: target.address.clone(),
                    reason: format!("ssh exited with {status}: {}", stderr.trim()),
                }
            });
        }

        let check = ssh_command(target, control_path, false)
            .args(["-O", "check", &target.destination()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        if check.success() {
            return Ok(());
        }
        tokio::time::sleep(MASTER_POLL).await;
    }
}

/// A session multiplexed over one OpenSSH master connection.
pub struct OpenSshSession {
    host: String,
    destination: String,
    port: u16,
    user: String,
    is_root: bool,
    control_path: PathBuf,
    // Removed on drop, taking the socket with it.
    _control_dir: tempfile::TempDir,
    master: Child,
    command_timeout: Duration,
}

impl OpenSshSession {
    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "ControlMaster=no",
            "-o",
            "BatchMode=yes",
            "-o",
            "LogLevel=ERROR",
            "-p",
            &self.port.to_string(),
        ]);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd
    }

    fn elevate(&self, command: &str) -> String {
        if self.is_root {
            command.to_string()
        } else {
            format!("sudo -n sh -c {}", quote(command))
        }
    }

    async fn verify_privilege(mut self) -> Result<Self, ProvisionError> {
        if self.is_root {
            return Ok(self);
        }
        match self.exec("sudo -n true", None).await {
            Ok(_) => Ok(self),
            Err(e) => {
                warn!(host = %self.host, user = %self.user, error = %e, "Privilege check failed");
                let denied = ProvisionError::PrivilegeDenied {
                    host: self.host.clone(),
                    user: self.user.clone(),
                };
                if let Err(e) = Box::new(self).close().await {
                    debug!(error = %e, "Closing rejected session failed");
                }
                Err(denied)
            }
        }
    }

    async fn exec(&mut self, remote: &str, stdin: Option<&str>) -> Result<String, ProvisionError> {
        debug!(host = %self.host, "exec: {remote}");
        let mut cmd = self.command();
        cmd.arg(&self.destination)
            .arg(remote)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = cmd.spawn()?;
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.command_timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ProvisionError::CommandFailed {
                    command: remote.to_string(),
                    stderr: format!("timed out after {}s", self.command_timeout.as_secs()),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(host = %self.host, status = %output.status, %stderr, "Remote command failed");
            return Err(ProvisionError::CommandFailed {
                command: remote.to_string(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RemoteShell for OpenSshSession {
    async fn run(&mut self, command: &str) -> Result<String, ProvisionError> {
        let remote = self.elevate(command);
        self.exec(&remote, None).await
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), ProvisionError> {
        let remote = self.elevate(&format!("cat > {}", quote(path)));
        self.exec(&remote, Some(content)).await.map(|_| ())
    }

    async fn close(mut self: Box<Self>) -> Result<(), ProvisionError> {
        let exit = self
            .command()
            .args(["-O", "exit", &self.destination])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = &exit {
            debug!(host = %self.host, error = %e, "ssh -O exit failed");
        }
        if tokio::time::timeout(Duration::from_secs(5), self.master.wait())
            .await
            .is_err()
        {
            self.master.start_kill()?;
        }
        debug!(host = %self.host, "Remote session closed");
        Ok(())
    }
}
