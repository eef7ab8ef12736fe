use std::net::Ipv4Addr;

/// Parameters for the server's `[Interface]` section.
#[derive(Debug, Clone)]
pub struct ServerInterface<'a> {
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub listen_port: u16,
    pub interface: &'a str,
    /// NAT egress interface.
    pub egress: &'a str,
}

/// Generate the base registry content: the server's `[Interface]` section.
pub fn server_interface(params: &ServerInterface<'_>) -> String {
    format!(
        r"[Interface]
PrivateKey = {private_key}
Address = {address}/24
ListenPort = {port}
PostUp = iptables -A FORWARD -i {iface} -j ACCEPT; iptables -t nat -A POSTROUTING -o {egress} -j MASQUERADE
PostDown = iptables -D FORWARD -i {iface} -j ACCEPT; iptables -t nat -D POSTROUTING -o {egress} -j MASQUERADE
",
        private_key = params.private_key,
        address = params.address,
        port = params.listen_port,
        iface = params.interface,
        egress = params.egress,
    )
}

/// Parameters for a client configuration file.
#[derive(Debug, Clone)]
pub struct ClientConfig<'a> {
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub dns: &'a [String],
    pub server_public_key: &'a str,
    pub endpoint_host: &'a str,
    pub endpoint_port: u16,
    pub keepalive_secs: u16,
}

/// Generate the client configuration file handed to the subscriber.
pub fn client_config(params: &ClientConfig<'_>) -> String {
    format!(
        r"[Interface]
PrivateKey = {private_key}
Address = {address}/32
DNS = {dns}

[Peer]
PublicKey = {server_key}
AllowedIPs = 0.0.0.0/0
Endpoint = {host}:{port}
PersistentKeepalive = {keepalive}
",
        private_key = params.private_key,
        address = params.address,
        dns = params.dns.join(", "),
        server_key = params.server_public_key,
        host = params.endpoint_host,
        port = params.endpoint_port,
        keepalive = params.keepalive_secs,
    )
}
