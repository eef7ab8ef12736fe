//! wgkeeper provisioning library.
//!
//! Drives remote Linux hosts through an authenticated shell session to
//! install WireGuard, maintain the peer registry (`/etc/wireguard/wg0.conf`)
//! and produce client configuration files.
//!
//! - [`session`]: the remote shell abstraction and its OpenSSH implementation
//! - [`registry`]: text transformations over the peer registry
//! - [`engine`]: the ordered provisioning workflows

pub mod engine;
pub mod error;
pub mod layout;
pub mod os;
pub mod registry;
pub mod session;
pub mod shell;
pub mod templates;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use engine::{ProvisioningEngine, ServerInfo};
pub use error::{ProvisionError, ProvisionStage};
pub use session::{Connector, Credentials, HostTarget, OpenSshConnector, RemoteShell};
