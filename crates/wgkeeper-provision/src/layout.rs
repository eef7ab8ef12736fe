//! Remote file locations and the command lines run against a host.
//!
//! Every command the engine sends is built here so the paths stay in one
//! place.

use wgkeeper_core::config::ProvisioningConfig;

use crate::shell::quote;

/// Sysctl drop-in enabling IPv4 forwarding.
pub const SYSCTL_PATH: &str = "/etc/sysctl.d/99-wireguard.conf";

/// Content of [`SYSCTL_PATH`].
pub const SYSCTL_CONTENT: &str = "net.ipv4.ip_forward = 1\n";

/// Installed check.
pub const WHICH_WG: &str = "which wg";

pub const READ_OS_RELEASE: &str = "cat /etc/os-release";

/// Prints a fresh private key on the first line and its public key on the
/// second. The private key never appears on a command line.
pub const GENERATE_KEYPAIR: &str =
    "umask 077 && k=$(wg genkey) && printf '%s\\n' \"$k\" && printf '%s' \"$k\" | wg pubkey";

/// Default-route interface, used as the NAT egress.
pub const DEFAULT_ROUTE_IFACE: &str = "ip route show default | awk '{print $5; exit}'";

pub const DISCOVER_PUBLIC_IP: &str = "curl -s --max-time 5 ifconfig.me || \
     curl -s --max-time 5 api.ipify.org || \
     curl -s --max-time 5 icanhazip.com || \
     hostname -I | awk '{print $1}'";

/// Paths and unit names for one WireGuard interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub interface: String,
    pub dir: String,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::from_config(&ProvisioningConfig::default())
    }
}

impl HostLayout {
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            dir: config.registry_dir.trim_end_matches('/').to_string(),
        }
    }

    /// The peer registry, e.g. `/etc/wireguard/wg0.conf`.
    pub fn registry_path(&self) -> String {
        format!("{}/{}.conf", self.dir, self.interface)
    }

    pub fn private_key_path(&self) -> String {
        format!("{}/server_private.key", self.dir)
    }

    pub fn public_key_path(&self) -> String {
        format!("{}/server_public.key", self.dir)
    }

    pub fn service_unit(&self) -> String {
        format!("wg-quick@{}", self.interface)
    }

    pub fn ensure_dir(&self) -> String {
        format!("mkdir -p {0} && chmod 700 {0}", quote(&self.dir))
    }

    /// Succeeds iff the server private key exists and is non-empty.
    pub fn has_server_keys(&self) -> String {
        format!("test -s {}", quote(&self.private_key_path()))
    }

    pub fn generate_server_keys(&self) -> String {
        format!(
            "umask 077 && wg genkey | tee {} | wg pubkey > {}",
            quote(&self.private_key_path()),
            quote(&self.public_key_path())
        )
    }

    /// Recreate a missing public key from the existing private key.
    pub fn derive_server_public_key(&self) -> String {
        format!(
            "wg pubkey < {} > {}",
            quote(&self.private_key_path()),
            quote(&self.public_key_path())
        )
    }

    pub fn read_private_key(&self) -> String {
        read_file(&self.private_key_path())
    }

    pub fn read_public_key(&self) -> String {
        read_file(&self.public_key_path())
    }

    /// Succeeds iff the registry exists and is non-empty.
    pub fn has_registry(&self) -> String {
        format!("test -s {}", quote(&self.registry_path()))
    }

    pub fn read_registry(&self) -> String {
        read_file(&self.registry_path())
    }

    /// Temp path the registry is staged at before being moved into place.
    pub fn registry_staging_path(&self) -> String {
        format!("{}.tmp", self.registry_path())
    }

    pub fn commit_registry(&self) -> String {
        let staged = quote(&self.registry_staging_path());
        format!(
            "chmod 600 {staged} && mv -f {staged} {}",
            quote(&self.registry_path())
        )
    }

    pub fn apply_sysctl(&self) -> String {
        format!("sysctl -p {}", quote(SYSCTL_PATH))
    }

    pub fn enable_service(&self) -> String {
        format!("systemctl enable --now {}", self.service_unit())
    }

    pub fn restart_service(&self) -> String {
        format!("systemctl restart {}", self.service_unit())
    }

    pub fn verify_interface(&self) -> String {
        format!("ip link show {}", quote(&self.interface))
    }
}

pub fn read_file(path: &str) -> String {
    format!("cat {}", quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_paths() {
        let layout = HostLayout::default();
        assert_eq!(layout.registry_path(), "/etc/wireguard/wg0.conf");
        assert_eq!(layout.private_key_path(), "/etc/wireguard/server_private.key");
        assert_eq!(layout.public_key_path(), "/etc/wireguard/server_public.key");
        assert_eq!(layout.service_unit(), "wg-quick@wg0");
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let config = ProvisioningConfig {
            registry_dir: "/etc/wireguard/".into(),
            interface: "wg1".into(),
            ..ProvisioningConfig::default()
        };
        let layout = HostLayout::from_config(&config);
        assert_eq!(layout.registry_path(), "/etc/wireguard/wg1.conf");
        assert_eq!(layout.restart_service(), "systemctl restart wg-quick@wg1");
    }

    #[test]
    fn commit_moves_staged_file_over_registry() {
        let layout = HostLayout::default();
        assert_eq!(
            layout.commit_registry(),
            "chmod 600 '/etc/wireguard/wg0.conf.tmp' && \
             mv -f '/etc/wireguard/wg0.conf.tmp' '/etc/wireguard/wg0.conf'"
        );
    }
}
