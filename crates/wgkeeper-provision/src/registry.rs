//! The remote peer registry: the WireGuard interface configuration file.
//!
//! A peer occupies one block:
//!
//! ```text
//!
//! # <name>
//! [Peer]
//! PublicKey = <key>
//! AllowedIPs = <address>/32
//! ```
//!
//! Blocking rewrites the name line to `#BLOCKED <name>` and prefixes the three
//! peer lines with `#`, so `wg-quick` ignores the peer while its name and
//! address stay reserved. The functions below are pure transformations over
//! the file text; [`PeerRegistry`] binds them to a remote shell.

use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::layout::HostLayout;
use crate::session::RemoteShell;

const BLOCKED_PREFIX: &str = "#BLOCKED ";
const LAST_CLIENT_OCTET: u8 = 254;

fn active_marker(name: &str) -> String {
    format!("# {name}")
}

fn blocked_marker(name: &str) -> String {
    format!("{BLOCKED_PREFIX}{name}")
}

fn strip_eol(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn is_peer_line(line: &str) -> bool {
    let body = strip_eol(line);
    let body = body.strip_prefix('#').unwrap_or(body);
    body == "[Peer]" || body.starts_with("PublicKey") || body.starts_with("AllowedIPs")
}

/// Marker line index and whether it is the blocked form.
fn find_marker(lines: &[&str], name: &str) -> Option<(usize, bool)> {
    let active = active_marker(name);
    let blocked = blocked_marker(name);
    lines.iter().enumerate().find_map(|(i, line)| {
        let line = strip_eol(line);
        if line == active {
            Some((i, false))
        } else if line == blocked {
            Some((i, true))
        } else {
            None
        }
    })
}

/// Number of peer lines directly following the marker at `marker`.
fn block_body_len(lines: &[&str], marker: usize) -> usize {
    lines[marker + 1..]
        .iter()
        .take(3)
        .take_while(|line| is_peer_line(line))
        .count()
}

/// Render a peer block, including its leading blank separator line.
pub fn peer_block(name: &str, public_key: &str, address: Ipv4Addr) -> String {
    format!("\n# {name}\n[Peer]\nPublicKey = {public_key}\nAllowedIPs = {address}/32\n")
}

/// Append a peer block. Does not check for name collisions.
pub fn append_peer(text: &str, name: &str, public_key: &str, address: Ipv4Addr) -> String {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&peer_block(name, public_key, address));
    out
}

/// Remove every block whose name line matches `name` exactly, active or
/// blocked, together with the blank separator line before it. Unknown names
/// leave the text unchanged.
pub fn remove_peer(text: &str, name: &str) -> String {
    let mut lines: Vec<&str> = text.split_inclusive('\n').collect();
    while let Some((marker, _)) = find_marker(&lines, name) {
        let end = marker + 1 + block_body_len(&lines, marker);
        let start = if marker > 0 && strip_eol(lines[marker - 1]).is_empty() {
            marker - 1
        } else {
            marker
        };
        lines.drain(start..end);
    }
    lines.concat()
}

/// Toggle a peer between active and blocked.
///
/// Returns `Ok(None)` when the peer is already in the requested state and
/// `PeerNotFound` when no block carries `name`.
pub fn set_blocked(text: &str, name: &str, blocked: bool) -> Result<Option<String>, ProvisionError> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let Some((marker, is_blocked)) = find_marker(&lines, name) else {
        return Err(ProvisionError::PeerNotFound(name.to_string()));
    };
    if is_blocked == blocked {
        return Ok(None);
    }

    let body_end = marker + 1 + block_body_len(&lines, marker);
    let mut out = String::with_capacity(text.len() + 16);
    for (i, line) in lines.iter().enumerate() {
        if i == marker {
            let eol = &line[strip_eol(line).len()..];
            let new_marker = if blocked {
                blocked_marker(name)
            } else {
                active_marker(name)
            };
            out.push_str(&new_marker);
            out.push_str(eol);
        } else if i > marker && i < body_end {
            if blocked {
                out.push('#');
                out.push_str(line);
            } else {
                out.push_str(line.strip_prefix('#').unwrap_or(line));
            }
        } else {
            out.push_str(line);
        }
    }
    Ok(Some(out))
}

/// True iff the `#BLOCKED <name>` line is present.
pub fn is_blocked(text: &str, name: &str) -> bool {
    let marker = blocked_marker(name);
    text.lines().any(|line| line.trim_end_matches('\r') == marker)
}

/// True iff a block (active or blocked) carries `name`.
pub fn contains_peer(text: &str, name: &str) -> bool {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    find_marker(&lines, name).is_some()
}

/// `base` if unused, otherwise the first free `base-2`, `base-3`, ...
pub fn unique_name(text: &str, base: &str) -> String {
    if !contains_peer(text, base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !contains_peer(text, candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Next free client address in the /24 of `network`.
///
/// Scans every `AllowedIPs` line, including commented-out ones of blocked
/// peers, and returns one past the highest host octet in use. The server
/// holds `.1`, so an empty registry yields `.2`.
pub fn next_free_address(text: &str, network: Ipv4Addr) -> Result<Ipv4Addr, ProvisionError> {
    let [a, b, c, _] = network.octets();
    let highest = text
        .lines()
        .filter_map(|line| {
            let line = line.trim_start_matches('#').trim();
            let (key, value) = line.split_once('=')?;
            (key.trim() == "AllowedIPs").then_some(value)
        })
        .flat_map(|value| value.split(','))
        .filter_map(|entry| entry.trim().split('/').next()?.parse::<Ipv4Addr>().ok())
        .filter(|addr| addr.octets()[..3] == [a, b, c])
        .map(|addr| addr.octets()[3])
        .fold(1u8, u8::max);

    if highest >= LAST_CLIENT_OCTET {
        return Err(ProvisionError::AddressPoolExhausted(network));
    }
    Ok(Ipv4Addr::new(a, b, c, highest + 1))
}

/// `ListenPort` of the interface section, if present.
pub fn listen_port(text: &str) -> Option<u16> {
    text.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        (key.trim() == "ListenPort").then(|| value.trim().parse().ok())?
    })
}

/// The registry file on one host, accessed through an open session.
pub struct PeerRegistry<'a> {
    shell: &'a mut dyn RemoteShell,
    layout: &'a HostLayout,
}

impl<'a> PeerRegistry<'a> {
    pub fn new(shell: &'a mut dyn RemoteShell, layout: &'a HostLayout) -> Self {
        Self { shell, layout }
    }

    pub async fn read(&mut self) -> Result<String, ProvisionError> {
        self.shell.run(&self.layout.read_registry()).await
    }

    /// Replace the registry: stage next to it, `chmod 600`, then `mv` over it.
    pub async fn commit(&mut self, content: &str) -> Result<(), ProvisionError> {
        self.shell
            .write_file(&self.layout.registry_staging_path(), content)
            .await?;
        self.shell.run(&self.layout.commit_registry()).await?;
        debug!(path = %self.layout.registry_path(), bytes = content.len(), "Registry committed");
        Ok(())
    }

    /// Pick the final peer name and its tunnel address in one read.
    ///
    /// Fails open when the registry is unreadable: `requested` is kept and the
    /// first client address is returned. The append that follows reads the
    /// file again and reports the real error.
    pub async fn allocate(
        &mut self,
        requested: &str,
        network: Ipv4Addr,
    ) -> Result<(String, Ipv4Addr), ProvisionError> {
        let text = match self.read().await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Registry unreadable, allocating first client address");
                String::new()
            }
        };
        let name = unique_name(&text, requested);
        let address = next_free_address(&text, network)?;
        Ok((name, address))
    }

    pub async fn append_peer(
        &mut self,
        name: &str,
        public_key: &str,
        address: Ipv4Addr,
    ) -> Result<(), ProvisionError> {
        let text = self.read().await?;
        self.commit(&append_peer(&text, name, public_key, address))
            .await
    }

    /// Returns whether the registry changed.
    pub async fn remove_peer(&mut self, name: &str) -> Result<bool, ProvisionError> {
        let text = self.read().await?;
        let updated = remove_peer(&text, name);
        if updated == text {
            return Ok(false);
        }
        self.commit(&updated).await?;
        Ok(true)
    }

    /// Returns whether the registry changed.
    pub async fn set_blocked(&mut self, name: &str, blocked: bool) -> Result<bool, ProvisionError> {
        let text = self.read().await?;
        match set_blocked(&text, name, blocked)? {
            Some(updated) => {
                self.commit(&updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn is_blocked(&mut self, name: &str) -> Result<bool, ProvisionError> {
        let text = self.read().await?;
        Ok(is_blocked(&text, name))
    }
}
