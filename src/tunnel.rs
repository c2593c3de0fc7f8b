//! Tunnel manager (C4)
//!
//! Maintains an indexed set of encrypted point-to-point tunnels on the
//! client host: config synthesis, interface up/down, per-tunnel CPU
//! pinning, ECMP install, and health/metric sampling. Generalized from the
//! teacher's single-tunnel `TunnelManager` (`client/core/src/tunnel.rs`)
//! into an indexed N-tunnel registry per spec.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use parking_lot::RwLock;
use thiserror::Error;

use crate::crypto::{self, KeyPair};
use crate::platform::PlatformOps;

pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;
const HANDSHAKE_TIMEOUT_MULTIPLE: u64 = 3;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("requested tunnel count {requested} exceeds MaxTunnels {max}")]
    ExceedsMax { requested: u32, max: u32 },
    #[error("tunnel count at MinTunnels ({min}); cannot remove")]
    AtMin { min: u32 },
    #[error("tunnel count at MaxTunnels ({max}); cannot add")]
    AtMax { max: u32 },
    #[error("no tunnels are active")]
    Empty,
    #[error("tunnel {0} not found")]
    NotFound(u32),
    #[error("platform operation failed: {0}")]
    Platform(String),
    #[error("key generation failed: {0}")]
    Crypto(#[from] crate::error::CryptoError),
}

/// Lifecycle status of a single tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Inactive,
    Active,
    Error,
}

/// A single encrypted point-to-point tunnel, owned by the tunnel manager.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: u32,
    pub interface_name: String,
    pub private_key: String,
    pub public_key: String,
    pub overlay_address: String,
    pub listen_port: u16,
    pub peer_public_key: String,
    pub peer_endpoint: String,
    pub mtu: u32,
    pub pinned_core: Option<usize>,
    pub status: TunnelStatus,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake: Option<DateTime<Utc>>,
}

/// Read-only snapshot returned by `get_active_tunnels`.
#[derive(Debug, Clone)]
pub struct TunnelSnapshot {
    pub id: u32,
    pub status: TunnelStatus,
    pub listen_port: u16,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// One metric sample for a single tunnel, emitted by `monitor_performance`.
#[derive(Debug, Clone)]
pub struct TunnelSample {
    pub id: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub throughput_bps: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Rendered `[Interface]`/`[Peer]` INI text for a tunnel, produced by a
/// pure function of its configuration so tests can compare it to a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfigText(pub String);

/// Parameters shared by every tunnel in the set, fixed at manager creation.
#[derive(Debug, Clone)]
pub struct TunnelManagerParams {
    pub overlay_base: Ipv4Network,
    pub base_port: u16,
    pub bridge_public_address: String,
    pub server_public_key: String,
    pub private_subnet_cidr: String,
    pub mtu: u32,
    pub max_tunnels: u32,
    pub min_tunnels: u32,
    pub reserved_cores: usize,
    pub total_cores: usize,
    pub config_dir: PathBuf,
}

struct Registry {
    tunnels: BTreeMap<u32, Tunnel>,
}

/// Maintains `id -> Tunnel`. CreateTunnels/AddTunnel/RemoveTunnel/
/// ConfigureECMP are writers; GetActiveTunnels/MonitorPerformance are
/// readers, per the concurrency model in spec.md §5.
pub struct TunnelManager {
    registry: RwLock<Registry>,
    params: TunnelManagerParams,
    platform: Box<dyn PlatformOps>,
}

impl TunnelManager {
    pub fn new(params: TunnelManagerParams, platform: Box<dyn PlatformOps>) -> Self {
        Self {
            registry: RwLock::new(Registry {
                tunnels: BTreeMap::new(),
            }),
            params,
            platform,
        }
    }

    /// Create ids 0..n atomically with fresh keys, one per id; rolls back
    /// everything it created if any single tunnel fails to come up.
    pub fn create_tunnels(&self, n: u32) -> Result<(), TunnelError> {
        let keys: Vec<KeyPair> = (0..n)
            .map(|_| crypto::generate_keypair())
            .collect::<Result<_, _>>()?;
        self.create_tunnels_with_keys(keys)
    }

    /// Create ids 0..keys.len() atomically, using the supplied keypair for
    /// each id instead of generating a fresh one. Lets a caller (the
    /// orchestrator) generate all N keypairs up front, so the same public
    /// keys baked into the bridge's bootstrap script are the ones actually
    /// brought up here — `create_tunnels` above is a convenience wrapper
    /// for callers that don't need that coordination (e.g. tests).
    pub fn create_tunnels_with_keys(&self, keys: Vec<KeyPair>) -> Result<(), TunnelError> {
        let n = keys.len() as u32;
        if n > self.params.max_tunnels {
            return Err(TunnelError::ExceedsMax {
                requested: n,
                max: self.params.max_tunnels,
            });
        }

        let mut created = Vec::new();
        for (id, key) in keys.into_iter().enumerate() {
            let id = id as u32;
            match self.bring_up_with_keys(id, key.private_key, key.public_key) {
                Ok(tunnel) => created.push(tunnel),
                Err(e) => {
                    for t in &created {
                        let _ = self.platform.bring_down(&t.interface_name);
                        let _ = self.remove_config_file(t.id);
                    }
                    return Err(e);
                }
            }
        }

        let mut reg = self.registry.write();
        for t in created {
            reg.tunnels.insert(t.id, t);
        }
        Ok(())
    }

    /// Create id = current highest + 1.
    pub fn add_tunnel(&self) -> Result<u32, TunnelError> {
        let next_id = {
            let reg = self.registry.read();
            reg.tunnels.keys().next_back().map(|id| id + 1).unwrap_or(0)
        };
        if next_id >= self.params.max_tunnels {
            return Err(TunnelError::AtMax {
                max: self.params.max_tunnels,
            });
        }

        let tunnel = self.bring_up_new(next_id)?;
        self.registry.write().tunnels.insert(next_id, tunnel);
        Ok(next_id)
    }

    /// Destroy the highest id.
    pub fn remove_tunnel(&self) -> Result<u32, TunnelError> {
        let count = self.registry.read().tunnels.len() as u32;
        if count <= self.params.min_tunnels {
            return Err(TunnelError::AtMin {
                min: self.params.min_tunnels,
            });
        }

        let highest_id = {
            let reg = self.registry.read();
            *reg.tunnels.keys().next_back().ok_or(TunnelError::Empty)?
        };
        self.destroy(highest_id)?;
        Ok(highest_id)
    }

    /// Destroy and re-create a tunnel with the same id, preserving its keys
    /// (per spec.md §9's Open-Question decision), after a fatal interface
    /// error.
    pub fn replace_tunnel(&self, id: u32) -> Result<(), TunnelError> {
        let (private_key, public_key) = {
            let reg = self.registry.read();
            let t = reg.tunnels.get(&id).ok_or(TunnelError::NotFound(id))?;
            (t.private_key.clone(), t.public_key.clone())
        };

        self.destroy(id)?;
        let tunnel = self.bring_up_with_keys(id, private_key, public_key)?;
        self.registry.write().tunnels.insert(id, tunnel);
        Ok(())
    }

    fn destroy(&self, id: u32) -> Result<(), TunnelError> {
        let tunnel = self
            .registry
            .write()
            .tunnels
            .remove(&id)
            .ok_or(TunnelError::NotFound(id))?;
        self.platform
            .bring_down(&tunnel.interface_name)
            .map_err(TunnelError::Platform)?;
        // Destruction unconditionally cleans the config file, even if
        // bring_down already failed above.
        let _ = self.remove_config_file(id);
        Ok(())
    }

    /// Install an equal-weight multi-path route toward the overlay
    /// destination across all active tunnel interfaces. Must complete
    /// quickly enough that a caller invoking this right after Add/Remove
    /// sees at most a brief reconvergence window.
    pub fn configure_ecmp(&self) -> Result<(), TunnelError> {
        let reg = self.registry.read();
        let interfaces: Vec<String> = reg
            .tunnels
            .values()
            .filter(|t| t.status == TunnelStatus::Active)
            .map(|t| t.interface_name.clone())
            .collect();
        drop(reg);

        if interfaces.is_empty() {
            return Ok(());
        }

        self.platform
            .install_route(&self.params.private_subnet_cidr, &interfaces)
            .map_err(TunnelError::Platform)
    }

    /// Snapshot of every tunnel's status (reader).
    pub fn get_active_tunnels(&self) -> Vec<TunnelSnapshot> {
        self.registry
            .read()
            .tunnels
            .values()
            .map(|t| TunnelSnapshot {
                id: t.id,
                status: t.status,
                listen_port: t.listen_port,
                tx_bytes: t.tx_bytes,
                rx_bytes: t.rx_bytes,
            })
            .collect()
    }

    /// Start a restartable sampling session: each call to `sample` awaits
    /// one 5-second tick and returns the delta-derived per-tunnel rate
    /// since the previous sample (reader).
    pub fn monitor_performance(&self) -> PerformanceMonitor<'_> {
        PerformanceMonitor {
            manager: self,
            last: RwLock::new(BTreeMap::new()),
        }
    }

    /// Apply freshly measured byte counters for a tunnel (called by the
    /// component that actually reads kernel counters; exposed here so the
    /// scaler and tests can drive it without a real interface).
    pub fn record_counters(&self, id: u32, tx_bytes: u64, rx_bytes: u64, handshake_ok: bool) {
        let mut reg = self.registry.write();
        if let Some(t) = reg.tunnels.get_mut(&id) {
            t.tx_bytes = tx_bytes;
            t.rx_bytes = rx_bytes;
            if handshake_ok {
                t.last_handshake = Some(Utc::now());
                if t.status == TunnelStatus::Inactive {
                    t.status = TunnelStatus::Active;
                }
            }
        }
    }

    /// Flip tunnels whose handshake is older than
    /// `3 * PersistentKeepalive` into `Error`, surfacing them to the
    /// scaler as replacement candidates.
    pub fn check_handshake_timeouts(&self, now: DateTime<Utc>) -> Vec<u32> {
        let timeout = chrono::Duration::seconds(
            (HANDSHAKE_TIMEOUT_MULTIPLE * PERSISTENT_KEEPALIVE_SECS as u64) as i64,
        );
        let mut timed_out = Vec::new();
        let mut reg = self.registry.write();
        for t in reg.tunnels.values_mut() {
            if t.status != TunnelStatus::Active {
                continue;
            }
            let stale = match t.last_handshake {
                Some(ts) => now - ts > timeout,
                None => true,
            };
            if stale {
                t.status = TunnelStatus::Error;
                timed_out.push(t.id);
            }
        }
        timed_out
    }

    fn bring_up_new(&self, id: u32) -> Result<Tunnel, TunnelError> {
        let keys = crypto::generate_keypair()?;
        self.bring_up_with_keys(id, keys.private_key, keys.public_key)
    }

    fn bring_up_with_keys(
        &self,
        id: u32,
        private_key: String,
        public_key: String,
    ) -> Result<Tunnel, TunnelError> {
        let interface_name = format!("mole{id}");
        let overlay_address = overlay_address_for(&self.params.overlay_base, id);
        let listen_port = self.params.base_port + id as u16;
        let peer_endpoint = format!("{}:{}", self.params.bridge_public_address, listen_port);
        let core = compute_pinned_core(id, self.params.reserved_cores, self.params.total_cores);

        let tunnel = Tunnel {
            id,
            interface_name: interface_name.clone(),
            private_key,
            public_key,
            overlay_address,
            listen_port,
            peer_public_key: self.params.server_public_key.clone(),
            peer_endpoint,
            mtu: self.params.mtu,
            pinned_core: core,
            status: TunnelStatus::Inactive,
            tx_bytes: 0,
            rx_bytes: 0,
            last_handshake: None,
        };

        let config_text = synthesize_config(&tunnel, &self.params.private_subnet_cidr);
        self.write_config_file(&tunnel, &config_text)
            .map_err(|e| TunnelError::Platform(e.to_string()))?;

        self.platform
            .bring_up(&tunnel.interface_name, &config_text)
            .map_err(TunnelError::Platform)?;

        if let Some(core) = core {
            // Pinning failure is a warning, not fatal, per spec.md §4.4.
            if let Err(e) = self.platform.pin_process(&tunnel.interface_name, core) {
                tracing::warn!("CPU pin failed for {}: {}", tunnel.interface_name, e);
            }
        }

        let mut tunnel = tunnel;
        tunnel.status = TunnelStatus::Active;
        Ok(tunnel)
    }

    fn write_config_file(&self, tunnel: &Tunnel, text: &TunnelConfigText) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.params.config_dir)?;
        let path = self.config_path(tunnel.id);
        std::fs::write(&path, &text.0)?;
        set_owner_only(&path)
    }

    fn remove_config_file(&self, id: u32) -> std::io::Result<()> {
        let path = self.config_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn config_path(&self, id: u32) -> PathBuf {
        self.params.config_dir.join(format!("mole{id}.conf"))
    }
}

/// A restartable, pull-based sampling session over one manager. `sample`
/// sleeps for the 5-second tick then returns the rate derived from
/// `Δbytes / Δtime` against the previous call — the elephant-flow and
/// burst-detection inputs the scaler consumes. Dropping and re-creating a
/// `PerformanceMonitor` restarts the baseline from the manager's current
/// counters, satisfying "the stream is restartable".
pub struct PerformanceMonitor<'a> {
    manager: &'a TunnelManager,
    last: RwLock<BTreeMap<u32, (u64, u64, SystemTime)>>,
}

impl<'a> PerformanceMonitor<'a> {
    pub const SAMPLE_PERIOD: Duration = Duration::from_secs(5);

    pub async fn sample(&self) -> Vec<TunnelSample> {
        tokio::time::sleep(Self::SAMPLE_PERIOD).await;
        let now = SystemTime::now();
        let sampled_at = Utc::now();

        let snapshots = self.manager.get_active_tunnels();
        let mut last = self.last.write();
        let mut out = Vec::with_capacity(snapshots.len());

        for s in snapshots {
            let total = s.tx_bytes + s.rx_bytes;
            let throughput_bps = match last.get(&s.id) {
                Some((prev_total, _, prev_time)) => {
                    let elapsed = now
                        .duration_since(*prev_time)
                        .unwrap_or(Self::SAMPLE_PERIOD)
                        .as_secs_f64()
                        .max(0.001);
                    let delta_bytes = total.saturating_sub(*prev_total);
                    (delta_bytes as f64 * 8.0) / elapsed
                }
                None => 0.0,
            };

            last.insert(s.id, (total, total, now));
            out.push(TunnelSample {
                id: s.id,
                tx_bytes: s.tx_bytes,
                rx_bytes: s.rx_bytes,
                throughput_bps,
                sampled_at,
            });
        }

        out
    }
}

/// Per-tunnel CPU affinity: reserve R cores for the host, then round-robin
/// the rest starting after the reserved set.
pub fn compute_pinned_core(tunnel_id: u32, reserved: usize, total: usize) -> Option<usize> {
    if total <= reserved {
        return None;
    }
    let usable = total - reserved;
    Some(reserved + (tunnel_id as usize % usable))
}

/// Client-side overlay address: `BaseCIDR` with octet 3 = id+1, octet 4 = 2.
pub fn overlay_address_for(base: &Ipv4Network, id: u32) -> String {
    let octets = base.ip().octets();
    format!(
        "{}.{}.{}.2/32",
        octets[0],
        octets[1],
        (id + 1) as u8
    )
}

/// Pure function: renders the `[Interface]`/`[Peer]` config text for a
/// tunnel. Deterministic for fixed keys and fixed peer endpoint, as
/// required by spec.md §8's round-trip property.
pub fn synthesize_config(tunnel: &Tunnel, allowed_ips: &str) -> TunnelConfigText {
    let post_up = format!(
        "ip rule add from {addr} table {table}; ip route add default dev {iface} table {table}",
        addr = tunnel.overlay_address.split('/').next().unwrap_or(""),
        table = 100 + tunnel.id,
        iface = tunnel.interface_name,
    );
    let post_down = format!(
        "ip rule del from {addr} table {table}",
        addr = tunnel.overlay_address.split('/').next().unwrap_or(""),
        table = 100 + tunnel.id,
    );

    let text = format!(
        "[Interface]\nPrivateKey = {private_key}\nAddress = {address}\nListenPort = {port}\nMTU = {mtu}\nPostUp = {post_up}\nPostDown = {post_down}\n\n[Peer]\nPublicKey = {peer_key}\nEndpoint = {endpoint}\nAllowedIPs = {allowed_ips}\nPersistentKeepalive = {keepalive}\n",
        private_key = tunnel.private_key,
        address = tunnel.overlay_address,
        port = tunnel.listen_port,
        mtu = tunnel.mtu,
        post_up = post_up,
        post_down = post_down,
        peer_key = tunnel.peer_public_key,
        endpoint = tunnel.peer_endpoint,
        allowed_ips = allowed_ips,
        keepalive = PERSISTENT_KEEPALIVE_SECS,
    );

    TunnelConfigText(text)
}

#[cfg(unix)]
fn set_owner_only(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_owner_only(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn params() -> TunnelManagerParams {
        TunnelManagerParams {
            overlay_base: Ipv4Network::from_str("10.200.0.0/16").unwrap(),
            base_port: 51820,
            bridge_public_address: "203.0.113.10".into(),
            server_public_key: "SERVERPUBKEYSERVERPUBKEYSERVERPUBKEY=".into(),
            private_subnet_cidr: "10.0.1.0/24".into(),
            mtu: 1420,
            max_tunnels: 8,
            min_tunnels: 1,
            reserved_cores: 1,
            total_cores: 5,
            config_dir: std::env::temp_dir().join("cloud-mole-test-tunnels"),
        }
    }

    fn manager() -> TunnelManager {
        TunnelManager::new(params(), crate::platform::get_platform())
    }

    #[test]
    fn overlay_addresses_are_unique_per_id() {
        let base = Ipv4Network::from_str("10.200.0.0/16").unwrap();
        let a = overlay_address_for(&base, 0);
        let b = overlay_address_for(&base, 1);
        assert_ne!(a, b);
        assert_eq!(a, "10.200.1.2/32");
        assert_eq!(b, "10.200.2.2/32");
    }

    #[test]
    fn cpu_affinity_round_robins_after_reserved_cores() {
        assert_eq!(compute_pinned_core(0, 1, 5), Some(1));
        assert_eq!(compute_pinned_core(1, 1, 5), Some(2));
        assert_eq!(compute_pinned_core(4, 1, 5), Some(1)); // wraps: 1 + 4 % 4
        assert_eq!(compute_pinned_core(0, 4, 4), None);
    }

    #[test]
    fn create_tunnels_produces_dense_ids_with_unique_ports() {
        let mgr = manager();
        mgr.create_tunnels(3).unwrap();
        let active = mgr.get_active_tunnels();
        let mut ids: Vec<u32> = active.iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);

        let mut ports: Vec<u16> = active.iter().map(|t| t.listen_port).collect();
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), 3, "listen ports must be unique");
    }

    #[test]
    fn create_tunnels_with_keys_uses_the_supplied_keys_not_fresh_ones() {
        let mgr = manager();
        let keys = vec![crypto::generate_keypair().unwrap(), crypto::generate_keypair().unwrap()];
        let expected: Vec<String> = keys.iter().map(|k| k.public_key.clone()).collect();

        mgr.create_tunnels_with_keys(keys).unwrap();

        let mut actual: Vec<String> = {
            let reg = mgr.registry.read();
            reg.tunnels.values().map(|t| t.public_key.clone()).collect()
        };
        actual.sort();
        let mut expected = expected;
        expected.sort();
        assert_eq!(actual, expected);
    }

    #[test]
    fn create_tunnels_rejects_over_max() {
        let mgr = manager();
        let err = mgr.create_tunnels(9).unwrap_err();
        assert!(matches!(err, TunnelError::ExceedsMax { .. }));
    }

    #[test]
    fn remove_tunnel_refuses_below_min() {
        let mgr = manager();
        mgr.create_tunnels(1).unwrap();
        let err = mgr.remove_tunnel().unwrap_err();
        assert!(matches!(err, TunnelError::AtMin { .. }));
    }

    #[test]
    fn add_then_remove_keeps_ids_dense() {
        let mgr = manager();
        mgr.create_tunnels(2).unwrap();
        mgr.add_tunnel().unwrap();
        let mut ids: Vec<u32> = mgr.get_active_tunnels().iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);

        mgr.remove_tunnel().unwrap();
        let mut ids: Vec<u32> = mgr.get_active_tunnels().iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn config_synthesis_is_deterministic() {
        let tunnel = Tunnel {
            id: 0,
            interface_name: "mole0".into(),
            private_key: "PRIVATEKEYPRIVATEKEYPRIVATEKEYPRIVATEKEY=".into(),
            public_key: "PUBLICKEYPUBLICKEYPUBLICKEYPUBLICKEYPUB=".into(),
            overlay_address: "10.200.1.2/32".into(),
            listen_port: 51820,
            peer_public_key: "SERVERKEYSERVERKEYSERVERKEYSERVERKEYSER=".into(),
            peer_endpoint: "203.0.113.10:51820".into(),
            mtu: 1420,
            pinned_core: Some(1),
            status: TunnelStatus::Inactive,
            tx_bytes: 0,
            rx_bytes: 0,
            last_handshake: None,
        };

        let a = synthesize_config(&tunnel, "10.0.1.0/24");
        let b = synthesize_config(&tunnel, "10.0.1.0/24");
        assert_eq!(a, b);
        assert!(a.0.contains("ListenPort = 51820"));
        assert!(a.0.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn replace_tunnel_preserves_keys() {
        let mgr = manager();
        mgr.create_tunnels(1).unwrap();
        let before = mgr.get_active_tunnels();
        let before_key = {
            let reg = mgr.registry.read();
            reg.tunnels.get(&0).unwrap().public_key.clone()
        };
        mgr.replace_tunnel(0).unwrap();
        let after_key = {
            let reg = mgr.registry.read();
            reg.tunnels.get(&0).unwrap().public_key.clone()
        };
        assert_eq!(before.len(), 1);
        assert_eq!(before_key, after_key);
    }
}
