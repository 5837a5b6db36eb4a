use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use parking_lot::Mutex;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use uuid::Uuid;

use crate::clock::now_ms;
use crate::config::Config;
use crate::protocol::{DiscoveryAnnouncement, DiscoveryResponse, RoomSummary, ANNOUNCE_TYPE, PROTOCOL_VERSION};
use crate::registry::RoomRegistry;

/// A room seen on the LAN, via broadcast or probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEntry {
    pub instance_id: Uuid,
    #[serde(flatten)]
    pub room: RoomSummary,
    pub server_url: String,
    pub last_seen_at: u64,
}

struct ProbeCache {
    taken_at: Instant,
    entries: HashMap<String, DiscoveryEntry>,
}

/// LAN room discovery: periodic UDP announcements of hosted rooms, a
/// listener collecting announcements from peers, and an HTTP subnet probe
/// for networks where broadcast does not carry (overlay VPNs). Everything
/// here is best-effort; failures are logged and swallowed.
pub struct DiscoveryService {
    instance_id: Uuid,
    config: Arc<Config>,
    registry: Arc<RoomRegistry>,
    discovered: Mutex<HashMap<String, DiscoveryEntry>>,
    probe_cache: Mutex<Option<ProbeCache>>,
    known_hosts: Mutex<HashSet<Ipv4Addr>>,
    http: reqwest::Client,
}

impl DiscoveryService {
    pub fn new(instance_id: Uuid, config: Arc<Config>, registry: Arc<RoomRegistry>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            instance_id,
            config,
            registry,
            discovered: Mutex::new(HashMap::new()),
            probe_cache: Mutex::new(None),
            known_hosts: Mutex::new(HashSet::new()),
            http,
        })
    }

    /// Spawn the announcer, listener and sweep tasks. A listener that
    /// cannot bind leaves probe-only discovery in place.
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_announcer().await });

        match bind_listener(self.config.discovery_port) {
            Ok(socket) => {
                let service = Arc::clone(self);
                tokio::spawn(async move { service.run_listener(socket).await });
            }
            Err(err) => {
                tracing::warn!(
                    "discovery listener could not bind port {}: {err}",
                    self.config.discovery_port
                );
            }
        }

        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_sweeper().await });
    }

    /// Everything currently known about nearby rooms: the broadcast map and
    /// the probe cache merged, the fresher sighting winning per room.
    pub async fn discover(&self) -> Vec<DiscoveryEntry> {
        let probed = self.probe().await;
        let broadcast = self.discovered.lock().clone();
        let mut merged = merge_entries(broadcast, probed);
        let mut out: Vec<DiscoveryEntry> = merged.drain().map(|(_, entry)| entry).collect();
        out.sort_by(|a, b| a.room.room_id.cmp(&b.room.room_id));
        out
    }

    /// Scan the local private subnets for peer instances. Results are
    /// cached; repeat calls inside the window issue no requests.
    pub async fn probe(&self) -> HashMap<String, DiscoveryEntry> {
        if let Some(entries) = self.fresh_probe_entries() {
            return entries;
        }

        let candidates = {
            let known = self.known_hosts.lock().clone();
            order_candidates(candidate_hosts(&local_interfaces()), &known)
        };

        let port = self.config.probe_port;
        let timeout = self.config.probe_timeout;
        let results: Vec<Option<(Ipv4Addr, DiscoveryResponse)>> =
            futures_util::stream::iter(candidates)
                .map(|ip| {
                    let client = self.http.clone();
                    async move {
                        probe_host(&client, ip, port, timeout).await.map(|resp| (ip, resp))
                    }
                })
                .buffer_unordered(self.config.probe_concurrency)
                .collect()
                .await;

        let now = now_ms();
        let mut entries = HashMap::new();
        let mut responsive = HashSet::new();
        for (ip, response) in results.into_iter().flatten() {
            if response.instance_id == self.instance_id
                || response.protocol_version != PROTOCOL_VERSION
            {
                continue;
            }
            responsive.insert(ip);
            for room in response.rooms {
                let key = format!("{}:{}", response.instance_id, room.room_id);
                entries.insert(
                    key,
                    DiscoveryEntry {
                        instance_id: response.instance_id,
                        server_url: format!("http://{ip}:{port}"),
                        last_seen_at: now,
                        room,
                    },
                );
            }
        }

        *self.known_hosts.lock() = responsive;
        *self.probe_cache.lock() = Some(ProbeCache { taken_at: Instant::now(), entries: entries.clone() });
        entries
    }

    fn fresh_probe_entries(&self) -> Option<HashMap<String, DiscoveryEntry>> {
        let cache = self.probe_cache.lock();
        cache
            .as_ref()
            .filter(|c| c.taken_at.elapsed() <= self.config.probe_cache_window)
            .map(|c| c.entries.clone())
    }

    async fn run_announcer(&self) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!("discovery announcer could not open a socket: {err}");
                return;
            }
        };
        if let Err(err) = socket.set_broadcast(true) {
            tracing::warn!("discovery announcer could not enable broadcast: {err}");
            return;
        }

        let mut tick = tokio::time::interval(self.config.announce_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let rooms = self.registry.summaries().await;
            if rooms.is_empty() {
                continue;
            }
            let targets = broadcast_targets();
            let now = now_ms();
            for room in rooms {
                let announcement = DiscoveryAnnouncement {
                    kind: ANNOUNCE_TYPE.to_string(),
                    protocol_version: PROTOCOL_VERSION,
                    instance_id: self.instance_id,
                    room,
                    port: self.config.port,
                    announced_at: now,
                };
                let Ok(bytes) = serde_json::to_vec(&announcement) else { continue };
                for target in &targets {
                    let dest = SocketAddrV4::new(*target, self.config.discovery_port);
                    if let Err(err) = socket.send_to(&bytes, dest).await {
                        tracing::debug!("announcement to {dest} failed: {err}");
                    }
                }
            }
        }
    }

    async fn run_listener(&self, socket: UdpSocket) {
        let mut buf = [0u8; 4096];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    if let Some((key, entry)) =
                        entry_from_packet(&buf[..len], addr, self.instance_id, now_ms())
                    {
                        self.discovered.lock().insert(key, entry);
                    }
                }
                Err(err) => {
                    tracing::debug!("discovery recv error: {err}");
                }
            }
        }
    }

    async fn run_sweeper(&self) {
        let ttl_ms = self.config.discovery_ttl.as_millis() as u64;
        let mut tick = tokio::time::interval(self.config.announce_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let now = now_ms();
            self.discovered.lock().retain(|_, entry| now.saturating_sub(entry.last_seen_at) <= ttl_ms);
        }
    }
}

/// UDP socket for incoming announcements: reuse-addr so several instances
/// can share a machine, broadcast enabled.
fn bind_listener(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Parse and validate one announcement datagram. Our own announcements and
/// anything malformed are dropped.
fn entry_from_packet(
    data: &[u8],
    sender: SocketAddr,
    self_id: Uuid,
    now: u64,
) -> Option<(String, DiscoveryEntry)> {
    let announcement: DiscoveryAnnouncement = serde_json::from_slice(data).ok()?;
    if announcement.kind != ANNOUNCE_TYPE
        || announcement.protocol_version != PROTOCOL_VERSION
        || announcement.instance_id == self_id
        || announcement.room.room_id.is_empty()
        || announcement.port == 0
    {
        return None;
    }
    let key = format!("{}:{}", announcement.instance_id, announcement.room.room_id);
    let entry = DiscoveryEntry {
        instance_id: announcement.instance_id,
        server_url: format!("http://{}:{}", sender.ip(), announcement.port),
        last_seen_at: now,
        room: announcement.room,
    };
    Some((key, entry))
}

async fn probe_host(
    client: &reqwest::Client,
    ip: Ipv4Addr,
    port: u16,
    timeout: std::time::Duration,
) -> Option<DiscoveryResponse> {
    let url = format!("http://{ip}:{port}/api/discovery");
    let response = client.get(&url).timeout(timeout).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}

/// Merge two sighting maps, keeping the fresher entry per key.
fn merge_entries(
    mut base: HashMap<String, DiscoveryEntry>,
    other: HashMap<String, DiscoveryEntry>,
) -> HashMap<String, DiscoveryEntry> {
    for (key, entry) in other {
        match base.get(&key) {
            Some(existing) if existing.last_seen_at >= entry.last_seen_at => {}
            _ => {
                base.insert(key, entry);
            }
        }
    }
    base
}

/// Private / local-use IPv4 ranges worth probing.
fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    match o[0] {
        10 => true,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        100 => (64..=127).contains(&o[1]),
        169 => o[1] == 254,
        198 => o[1] == 18 || o[1] == 19,
        _ => false,
    }
}

/// Prefix length of a contiguous netmask, e.g. 255.255.252.0 → 22.
fn prefix_len(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let len = bits.leading_ones();
    if bits.checked_shl(len).unwrap_or(0) == 0 {
        Some(len as u8)
    } else {
        None
    }
}

fn host_count(prefix: u8) -> u32 {
    (1u32 << (32 - prefix as u32)).saturating_sub(2)
}

/// All host addresses of the subnet containing `ip`, excluding the network
/// and broadcast addresses and `ip` itself.
fn subnet_hosts(ip: Ipv4Addr, prefix: u8) -> Vec<Ipv4Addr> {
    if prefix >= 31 || prefix == 0 {
        return Vec::new();
    }
    let ip_u = u32::from(ip);
    let mask = u32::MAX << (32 - prefix as u32);
    let network = ip_u & mask;
    let broadcast = network | !mask;
    (network + 1..broadcast).filter(|host| *host != ip_u).map(Ipv4Addr::from).collect()
}

/// Local private-range interfaces as `(address, prefix length)`.
fn local_interfaces() -> Vec<(Ipv4Addr, Option<u8>)> {
    let Ok(interfaces) = NetworkInterface::show() else { return Vec::new() };
    let mut out = Vec::new();
    for iface in interfaces {
        for addr in iface.addr {
            if let network_interface::Addr::V4(v4) = addr {
                if is_private_ipv4(v4.ip) {
                    out.push((v4.ip, v4.netmask.and_then(prefix_len)));
                }
            }
        }
    }
    out
}

/// Candidate probe targets across all private interfaces. Small subnets are
/// scanned whole; anything bigger (or maskless) falls back to the /24
/// around the interface address.
fn candidate_hosts(interfaces: &[(Ipv4Addr, Option<u8>)]) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (ip, prefix) in interfaces {
        let effective = match prefix {
            Some(p) if (20..=30).contains(p) && host_count(*p) <= 2048 => *p,
            _ => 24,
        };
        for host in subnet_hosts(*ip, effective) {
            if seen.insert(host) {
                out.push(host);
            }
        }
    }
    out
}

/// Previously responsive hosts go first so a warm rescan finds its peers
/// inside the first concurrency batch.
fn order_candidates(hosts: Vec<Ipv4Addr>, known: &HashSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let (mut first, rest): (Vec<Ipv4Addr>, Vec<Ipv4Addr>) =
        hosts.into_iter().partition(|host| known.contains(host));
    first.extend(rest);
    first
}

/// Broadcast destinations: every private interface's broadcast address plus
/// the limited-broadcast address.
fn broadcast_targets() -> Vec<Ipv4Addr> {
    let mut targets = vec![Ipv4Addr::BROADCAST];
    let Ok(interfaces) = NetworkInterface::show() else { return targets };
    for iface in interfaces {
        for addr in iface.addr {
            if let network_interface::Addr::V4(v4) = addr {
                if let Some(broadcast) = v4.broadcast {
                    if is_private_ipv4(v4.ip) && !targets.contains(&broadcast) {
                        targets.push(broadcast);
                    }
                }
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DiscoveryPlayback;

    fn summary(room_id: &str) -> RoomSummary {
        RoomSummary {
            room_id: room_id.into(),
            room_name: room_id.into(),
            host_nickname: "Host".into(),
            requires_password: false,
            member_count: 1,
            max_members: 6,
            media_name: None,
            subtitle_name: None,
            playback_state: DiscoveryPlayback::Idle,
        }
    }

    fn entry(instance: Uuid, room_id: &str, last_seen_at: u64) -> DiscoveryEntry {
        DiscoveryEntry {
            instance_id: instance,
            room: summary(room_id),
            server_url: "http://192.168.1.2:4000".into(),
            last_seen_at,
        }
    }

    #[test]
    fn private_ranges() {
        assert!(is_private_ipv4("10.1.2.3".parse().unwrap()));
        assert!(is_private_ipv4("172.16.0.1".parse().unwrap()));
        assert!(is_private_ipv4("172.31.255.1".parse().unwrap()));
        assert!(!is_private_ipv4("172.32.0.1".parse().unwrap()));
        assert!(is_private_ipv4("192.168.0.1".parse().unwrap()));
        assert!(is_private_ipv4("100.64.0.1".parse().unwrap()));
        assert!(is_private_ipv4("100.127.255.1".parse().unwrap()));
        assert!(!is_private_ipv4("100.128.0.1".parse().unwrap()));
        assert!(is_private_ipv4("169.254.10.10".parse().unwrap()));
        assert!(is_private_ipv4("198.18.0.1".parse().unwrap()));
        assert!(is_private_ipv4("198.19.200.1".parse().unwrap()));
        assert!(!is_private_ipv4("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn prefix_lengths() {
        assert_eq!(prefix_len("255.255.255.0".parse().unwrap()), Some(24));
        assert_eq!(prefix_len("255.255.252.0".parse().unwrap()), Some(22));
        assert_eq!(prefix_len("255.255.255.255".parse().unwrap()), Some(32));
        assert_eq!(prefix_len("0.0.0.0".parse().unwrap()), Some(0));
        // Non-contiguous masks are rejected.
        assert_eq!(prefix_len("255.0.255.0".parse().unwrap()), None);
    }

    #[test]
    fn subnet_host_enumeration() {
        let hosts = subnet_hosts("192.168.1.17".parse().unwrap(), 24);
        // 254 hosts minus ourselves.
        assert_eq!(hosts.len(), 253);
        assert!(hosts.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!hosts.contains(&"192.168.1.0".parse().unwrap()));
        assert!(!hosts.contains(&"192.168.1.255".parse().unwrap()));
        assert!(!hosts.contains(&"192.168.1.17".parse().unwrap()));
    }

    #[test]
    fn large_subnets_fall_back_to_slash_24() {
        // /20 has 4094 hosts, more than a scan will take on.
        let candidates = candidate_hosts(&[("10.0.5.9".parse().unwrap(), Some(20))]);
        assert_eq!(candidates.len(), 253);
        assert!(candidates.iter().all(|ip| ip.octets()[2] == 5));

        // /22 (1022 hosts) is scanned whole.
        let candidates = candidate_hosts(&[("10.0.5.9".parse().unwrap(), Some(22))]);
        assert_eq!(candidates.len(), 1021);
    }

    #[test]
    fn known_hosts_probe_first() {
        let hosts: Vec<Ipv4Addr> =
            (1..=10).map(|n| Ipv4Addr::new(192, 168, 1, n)).collect();
        let known: HashSet<Ipv4Addr> = [Ipv4Addr::new(192, 168, 1, 7)].into();
        let ordered = order_candidates(hosts, &known);
        assert_eq!(ordered[0], Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(ordered.len(), 10);
    }

    #[test]
    fn merge_prefers_fresher_sighting() {
        let instance = Uuid::new_v4();
        let mut base = HashMap::new();
        base.insert("k".to_string(), entry(instance, "AAAA", 100));
        let mut other = HashMap::new();
        other.insert("k".to_string(), entry(instance, "AAAA", 200));
        other.insert("k2".to_string(), entry(instance, "BBBB", 50));

        let merged = merge_entries(base, other);
        assert_eq!(merged["k"].last_seen_at, 200);
        assert_eq!(merged.len(), 2);

        // The fresher broadcast side survives a staler probe result too.
        let mut base = HashMap::new();
        base.insert("k".to_string(), entry(instance, "AAAA", 300));
        let mut other = HashMap::new();
        other.insert("k".to_string(), entry(instance, "AAAA", 200));
        let merged = merge_entries(base, other);
        assert_eq!(merged["k"].last_seen_at, 300);
    }

    #[test]
    fn packet_validation() {
        let self_id = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let sender: SocketAddr = "192.168.1.50:43153".parse().unwrap();
        let make = |instance: Uuid, room_id: &str, port: u16, kind: &str, version: u32| {
            serde_json::to_vec(&DiscoveryAnnouncement {
                kind: kind.into(),
                protocol_version: version,
                instance_id: instance,
                room: summary(room_id),
                port,
                announced_at: 1,
            })
            .unwrap()
        };

        let (key, entry) =
            entry_from_packet(&make(peer, "ABC123", 4000, ANNOUNCE_TYPE, 1), sender, self_id, 9)
                .unwrap();
        assert_eq!(key, format!("{peer}:ABC123"));
        assert_eq!(entry.server_url, "http://192.168.1.50:4000");
        assert_eq!(entry.last_seen_at, 9);

        // Self, empty room, zero port, wrong type or version: all dropped.
        assert!(entry_from_packet(&make(self_id, "ABC123", 4000, ANNOUNCE_TYPE, 1), sender, self_id, 9).is_none());
        assert!(entry_from_packet(&make(peer, "", 4000, ANNOUNCE_TYPE, 1), sender, self_id, 9).is_none());
        assert!(entry_from_packet(&make(peer, "ABC123", 0, ANNOUNCE_TYPE, 1), sender, self_id, 9).is_none());
        assert!(entry_from_packet(&make(peer, "ABC123", 4000, "other:announce", 1), sender, self_id, 9).is_none());
        assert!(entry_from_packet(&make(peer, "ABC123", 4000, ANNOUNCE_TYPE, 2), sender, self_id, 9).is_none());
        assert!(entry_from_packet(b"not json", sender, self_id, 9).is_none());
    }

    #[tokio::test]
    async fn probe_cache_serves_within_window() {
        let config = Arc::new(crate::config::Config::from_env());
        let publisher = crate::ws::Publisher::new();
        let storage = crate::storage::Storage::new(std::env::temp_dir().join("wt-test"));
        let registry = Arc::new(RoomRegistry::new(Arc::clone(&config), publisher, storage));
        let service = DiscoveryService::new(Uuid::new_v4(), config, registry);

        assert!(service.fresh_probe_entries().is_none());

        let mut entries = HashMap::new();
        entries.insert("k".to_string(), entry(Uuid::new_v4(), "AAAA", 1));
        *service.probe_cache.lock() = Some(ProbeCache { taken_at: Instant::now(), entries });

        // Inside the window the cached map comes back without any scanning.
        let cached = service.fresh_probe_entries().expect("cache hit");
        assert!(cached.contains_key("k"));
        let probed = service.probe().await;
        assert!(probed.contains_key("k"));

        // A cache from before the window is ignored.
        let stale = Instant::now()
            .checked_sub(service.config.probe_cache_window + std::time::Duration::from_millis(1));
        if let Some(taken_at) = stale {
            *service.probe_cache.lock() =
                Some(ProbeCache { taken_at, entries: HashMap::new() });
            assert!(service.fresh_probe_entries().is_none());
        }
    }

    #[test]
    fn sweep_eviction_window() {
        let instance = Uuid::new_v4();
        let mut map = HashMap::new();
        map.insert("fresh".to_string(), entry(instance, "AAAA", 6_000));
        map.insert("stale".to_string(), entry(instance, "BBBB", 1_000));
        let ttl_ms = 4_500u64;
        let now = 6_500u64;
        map.retain(|_, e| now.saturating_sub(e.last_seen_at) <= ttl_ms);
        assert!(map.contains_key("fresh"));
        assert!(!map.contains_key("stale"));
    }
}
