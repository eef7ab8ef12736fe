use std::collections::HashMap;

/// Distribution families with a known WireGuard install procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    DebianLike,
    RhelLike,
    Arch,
    Alpine,
    Unknown,
}

/// One install command. `may_fail` steps are attempted but their failure is
/// ignored (e.g. enabling an optional repository).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallStep {
    pub command: &'static str,
    pub may_fail: bool,
}

const fn step(command: &'static str) -> InstallStep {
    InstallStep {
        command,
        may_fail: false,
    }
}

const DEBIAN_STEPS: &[InstallStep] = &[
    step("DEBIAN_FRONTEND=noninteractive apt-get update"),
    step("DEBIAN_FRONTEND=noninteractive apt-get install -y wireguard wireguard-tools"),
];

const RHEL_STEPS: &[InstallStep] = &[
    InstallStep {
        command: "yum install -y epel-release",
        may_fail: true,
    },
    step("yum install -y wireguard-tools"),
];

const ARCH_STEPS: &[InstallStep] = &[step("pacman -Sy --noconfirm wireguard-tools")];

const ALPINE_STEPS: &[InstallStep] = &[step("apk add --update wireguard-tools")];

/// Families probed in order when the distribution is not recognised.
pub const FALLBACK_ORDER: [OsFamily; 4] = [
    OsFamily::DebianLike,
    OsFamily::RhelLike,
    OsFamily::Arch,
    OsFamily::Alpine,
];

impl OsFamily {
    /// Classify the content of `/etc/os-release` by `ID`, then `ID_LIKE`.
    pub fn detect(os_release: &str) -> Self {
        let release = parse_os_release(os_release);
        let id = release.get("ID").map_or("", String::as_str);
        let family = Self::from_id(id);
        if family != Self::Unknown {
            return family;
        }
        release
            .get("ID_LIKE")
            .map_or("", String::as_str)
            .split_whitespace()
            .map(Self::from_id)
            .find(|f| *f != Self::Unknown)
            .unwrap_or(Self::Unknown)
    }

    fn from_id(id: &str) -> Self {
        match id.to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" | "raspbian" | "linuxmint" | "pop" => Self::DebianLike,
            "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "ol" | "amzn" => Self::RhelLike,
            "arch" | "manjaro" | "endeavouros" => Self::Arch,
            "alpine" => Self::Alpine,
            _ => Self::Unknown,
        }
    }

    /// The install table for this family. `Unknown` has none.
    pub const fn install_steps(self) -> &'static [InstallStep] {
        match self {
            Self::DebianLike => DEBIAN_STEPS,
            Self::RhelLike => RHEL_STEPS,
            Self::Arch => ARCH_STEPS,
            Self::Alpine => ALPINE_STEPS,
            Self::Unknown => &[],
        }
    }

    /// Package manager binary, used to probe hosts of unknown family.
    pub const fn package_manager(self) -> Option<&'static str> {
        match self {
            Self::DebianLike => Some("apt-get"),
            Self::RhelLike => Some("yum"),
            Self::Arch => Some("pacman"),
            Self::Alpine => Some("apk"),
            Self::Unknown => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DebianLike => "debian-like",
            Self::RhelLike => "rhel-like",
            Self::Arch => "arch",
            Self::Alpine => "alpine",
            Self::Unknown => "unknown",
        }
    }
}

/// `PRETTY_NAME`, else `ID`, else `"unknown"`.
pub fn describe(os_release: &str) -> String {
    let release = parse_os_release(os_release);
    release
        .get("PRETTY_NAME")
        .or_else(|| release.get("ID"))
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parse `/etc/os-release` content into key-value pairs.
fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim_matches('"').trim_matches('\'');
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ubuntu() {
        let release = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(OsFamily::detect(release), OsFamily::DebianLike);
    }

    #[test]
    fn detects_rocky_by_id() {
        let release = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(OsFamily::detect(release), OsFamily::RhelLike);
    }

    #[test]
    fn falls_back_to_id_like() {
        let release = "ID=someforkos\nID_LIKE=\"arch\"\n";
        assert_eq!(OsFamily::detect(release), OsFamily::Arch);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        assert_eq!(OsFamily::detect("ID=haiku\n"), OsFamily::Unknown);
        assert_eq!(OsFamily::detect(""), OsFamily::Unknown);
    }

    #[test]
    fn describe_prefers_pretty_name() {
        assert_eq!(describe("ID=void\nPRETTY_NAME=\"Void Linux\"\n"), "Void Linux");
        assert_eq!(describe("ID=void\n"), "void");
        assert_eq!(describe(""), "unknown");
    }

    #[test]
    fn rhel_epel_step_may_fail() {
        let steps = OsFamily::RhelLike.install_steps();
        assert!(steps[0].may_fail);
        assert!(!steps[1].may_fail);
    }

    #[test]
    fn every_fallback_family_has_a_table() {
        for family in FALLBACK_ORDER {
            assert!(!family.install_steps().is_empty(), "{}", family.as_str());
            assert!(family.package_manager().is_some());
        }
        assert!(OsFamily::Unknown.install_steps().is_empty());
    }
}
