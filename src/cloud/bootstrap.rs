//! Bridge bootstrap script synthesis.
//!
//! Produces the base64 user-data payload handed to `LaunchBridge`. The
//! script installs the encrypted-tunnel userland, enables forwarding,
//! generates one server keypair, and brings up one WireGuard interface per
//! tunnel id — each bound to its own listen port and peered with exactly
//! one client public key, matching the per-tunnel port model the client
//! side implements (`tunnel.rs`'s `listen_port = base_port + id`). Tags the
//! instance with its own public key — the sole cross-boundary channel back
//! to the orchestrator per spec.md §4.2/§6.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Inputs baked into the bridge's first-boot script.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub overlay_cidr: String,
    pub listen_ports: Vec<u16>,
    /// One client public key per tunnel id, index-aligned with `listen_ports`.
    pub client_public_keys: Vec<String>,
    pub private_subnet_cidr: String,
    pub instance_id_tag_key: &'static str,
}

impl BootstrapSpec {
    pub const TAG_KEY: &'static str = "WireGuardPublicKey";
}

/// Render the idempotent shell script. Safe to re-run: every step either
/// checks current state first or uses an operation that is a no-op when
/// already applied (`ip link add ... || true`, `iptables -C ... || iptables -A ...`).
pub fn render_script(spec: &BootstrapSpec) -> String {
    let mut tunnel_blocks = String::new();
    for (i, (key, port)) in spec.client_public_keys.iter().zip(spec.listen_ports.iter()).enumerate() {
        let iface = format!("wg-mole{i}");
        let server_addr = server_address_for_tunnel(&spec.overlay_cidr, i as u32);
        let client_addr = ip_for_tunnel(&spec.overlay_cidr, i as u32);
        tunnel_blocks.push_str(&format!(
            r#"
cat > /etc/wireguard/{iface}.conf <<IFACE{i}
[Interface]
PrivateKey = $(cat /etc/wireguard/server_private.key)
Address = {server_addr}
ListenPort = {port}

[Peer]
PublicKey = {key}
AllowedIPs = {client_addr}/32
IFACE{i}

ip link add dev {iface} type wireguard 2>/dev/null || true
wg setconf {iface} /etc/wireguard/{iface}.conf
ip addr replace {server_addr} dev {iface}
ip link set up dev {iface}
"#,
            iface = iface,
            i = i,
            server_addr = server_addr,
            port = port,
            key = key,
            client_addr = client_addr,
        ));
    }

    format!(
        r#"#!/bin/bash
set -euo pipefail

# Idempotent bridge bootstrap. Safe to re-run on instance reboot.

if ! command -v wg >/dev/null 2>&1; then
    apt-get update -y
    apt-get install -y wireguard-tools
fi

sysctl -w net.ipv4.ip_forward=1
grep -q '^net.ipv4.ip_forward' /etc/sysctl.conf || echo 'net.ipv4.ip_forward=1' >> /etc/sysctl.conf

if [ ! -f /etc/wireguard/server_private.key ]; then
    umask 077
    wg genkey > /etc/wireguard/server_private.key
    wg pubkey < /etc/wireguard/server_private.key > /etc/wireguard/server_public.key
fi
SERVER_PUBLIC_KEY=$(cat /etc/wireguard/server_public.key)
{tunnel_blocks}
iptables -t nat -C POSTROUTING -s {private_cidr} -o wg-mole+ -j MASQUERADE 2>/dev/null || \
    iptables -t nat -A POSTROUTING -s {private_cidr} -o wg-mole+ -j MASQUERADE
iptables -C FORWARD -i wg-mole+ -j ACCEPT 2>/dev/null || iptables -A FORWARD -i wg-mole+ -j ACCEPT
iptables -C FORWARD -o wg-mole+ -j ACCEPT 2>/dev/null || iptables -A FORWARD -o wg-mole+ -j ACCEPT

INSTANCE_ID=$(curl -s http://169.254.169.254/latest/meta-data/instance-id)
aws ec2 modify-instance-attribute --instance-id "$INSTANCE_ID" --no-source-dest-check || true
aws ec2 create-tags --resources "$INSTANCE_ID" --tags "Key={tag_key},Value=$SERVER_PUBLIC_KEY"
"#,
        tunnel_blocks = tunnel_blocks,
        private_cidr = spec.private_subnet_cidr,
        tag_key = spec.instance_id_tag_key,
    )
}

/// Base64-encode the rendered script for the instance launch call.
pub fn render_user_data(spec: &BootstrapSpec) -> String {
    STANDARD.encode(render_script(spec))
}

/// Client-side overlay address for tunnel `index`, mirroring
/// `tunnel::overlay_address_for`: octet3 = index+1, octet4 = 2.
fn ip_for_tunnel(cidr: &str, index: u32) -> String {
    address_for_tunnel(cidr, index, 2)
}

/// Server-side address for the same tunnel's segment: octet3 = index+1,
/// octet4 = 1.
fn server_address_for_tunnel(cidr: &str, index: u32) -> String {
    format!("{}/24", address_for_tunnel(cidr, index, 1))
}

fn address_for_tunnel(cidr: &str, index: u32, last_octet: u8) -> String {
    let base = cidr.split('/').next().unwrap_or("10.200.0.0");
    let mut octets: Vec<u8> = base.split('.').filter_map(|o| o.parse().ok()).collect();
    if octets.len() == 4 {
        octets[2] = (index + 1) as u8;
        octets[3] = last_octet;
        format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BootstrapSpec {
        BootstrapSpec {
            overlay_cidr: "10.200.0.0/16".into(),
            listen_ports: vec![51820, 51821],
            client_public_keys: vec!["CLIENTKEYONE=".into(), "CLIENTKEYTWO=".into()],
            private_subnet_cidr: "10.100.1.0/24".into(),
            instance_id_tag_key: BootstrapSpec::TAG_KEY,
        }
    }

    #[test]
    fn script_tags_itself_with_the_agreed_key() {
        let script = render_script(&spec());
        assert!(script.contains("Key=WireGuardPublicKey"));
    }

    #[test]
    fn script_has_one_interface_per_tunnel_with_a_distinct_listen_port() {
        let script = render_script(&spec());
        assert!(script.contains("wg-mole0"));
        assert!(script.contains("wg-mole1"));
        assert!(script.contains("ListenPort = 51820"));
        assert!(script.contains("ListenPort = 51821"));
        assert!(script.contains("CLIENTKEYONE="));
        assert!(script.contains("CLIENTKEYTWO="));
    }

    #[test]
    fn each_interface_peers_with_exactly_one_client_key() {
        let script = render_script(&spec());
        assert_eq!(script.matches("[Peer]").count(), 2);
        assert_eq!(script.matches("[Interface]").count(), 2);
    }

    #[test]
    fn shared_forwarding_rules_match_every_tunnel_interface_by_wildcard() {
        let script = render_script(&spec());
        assert!(script.contains("-o wg-mole+"));
        assert!(script.contains("-i wg-mole+"));
    }

    #[test]
    fn user_data_is_valid_base64_of_the_script() {
        let script = render_script(&spec());
        let encoded = render_user_data(&spec());
        let decoded = STANDARD.decode(&encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), script);
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render_script(&spec()), render_script(&spec()));
    }
}
