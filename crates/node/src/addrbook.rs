//! Known-peer address book with outbound-group bucketing.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::wire::NetAddress;

const LOG_TARGET: &str = "addrbook";

const ADDR_BOOK_MAX: usize = 5_000;
const ADDR_BOOK_WANT: usize = 1_000;
/// Timestamps this far in the future are clamped to five days in the past.
const FUTURE_CLAMP_SECS: u64 = 10 * 60;
const CLAMP_PENALTY_SECS: u64 = 5 * 24 * 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AddrEntry {
    services: u64,
    last_seen: u64,
    last_attempt: u64,
    last_success: u64,
    attempts: u32,
}

#[derive(Debug, Default)]
pub struct AddressBook {
    entries: Mutex<HashMap<SocketAddr, AddrEntry>>,
    path: Option<PathBuf>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the address book backed by a JSON file; a missing or corrupt
    /// file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<SocketAddr, AddrEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(target: LOG_TARGET, "discarding corrupt address book: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            entries: Mutex::new(entries),
            path: Some(path),
        }
    }

    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let Ok(entries) = self.entries.lock() else {
            return;
        };
        match serde_json::to_vec(&*entries) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(path, bytes) {
                    warn!(target: LOG_TARGET, "failed to persist address book: {err}");
                }
            }
            Err(err) => warn!(target: LOG_TARGET, "failed to encode address book: {err}"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn need_more_addresses(&self) -> bool {
        self.len() < ADDR_BOOK_WANT
    }

    /// Merges advertised addresses, clamping timestamps that sit more than
    /// ten minutes in the future to five days ago.
    pub fn add_addresses(&self, addresses: &[NetAddress]) -> usize {
        let now = unix_now();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut added = 0;
        for address in addresses {
            if entries.len() >= ADDR_BOOK_MAX {
                break;
            }
            let mut last_seen = address.timestamp as u64;
            if last_seen > now + FUTURE_CLAMP_SECS {
                last_seen = now.saturating_sub(CLAMP_PENALTY_SECS);
            }
            let entry = entries.entry(address.addr).or_insert_with(|| {
                added += 1;
                AddrEntry {
                    services: address.services,
                    last_seen,
                    last_attempt: 0,
                    last_success: 0,
                    attempts: 0,
                }
            });
            entry.services = address.services;
            entry.last_seen = entry.last_seen.max(last_seen);
        }
        if added > 0 {
            debug!(target: LOG_TARGET, "learned {added} new addresses");
        }
        added
    }

    pub fn attempt(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(&addr) {
                entry.last_attempt = unix_now();
                entry.attempts = entry.attempts.saturating_add(1);
            }
        }
    }

    /// Marks a fully negotiated connection; resets the failure counter.
    pub fn good(&self, addr: SocketAddr, services: u64) {
        let now = unix_now();
        if let Ok(mut entries) = self.entries.lock() {
            let entry = entries.entry(addr).or_insert_with(|| AddrEntry {
                services,
                last_seen: now,
                last_attempt: now,
                last_success: 0,
                attempts: 0,
            });
            entry.services = services;
            entry.last_success = now;
            entry.last_seen = now;
            entry.attempts = 0;
        }
    }

    /// Records the peer as seen; used when a connection closes.
    pub fn connected(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(&addr) {
                entry.last_seen = unix_now();
            }
        }
    }

    /// Picks a dial candidate carrying the required services, preferring
    /// addresses whose outbound group is not already represented. When every
    /// eligible address sits in an occupied group, diversity yields and one
    /// of them is returned anyway.
    pub fn get_address(
        &self,
        required_services: u64,
        occupied_groups: &HashMap<String, usize>,
    ) -> Option<SocketAddr> {
        let Ok(entries) = self.entries.lock() else {
            return None;
        };
        let now = unix_now();
        let eligible: Vec<SocketAddr> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.services & required_services == required_services
                    && now.saturating_sub(entry.last_attempt) > retry_cooldown(entry.attempts)
            })
            .map(|(addr, _)| *addr)
            .collect();
        let mut candidates: Vec<SocketAddr> = eligible
            .iter()
            .filter(|addr| {
                occupied_groups
                    .get(&group_key(addr.ip()))
                    .copied()
                    .unwrap_or(0)
                    == 0
            })
            .copied()
            .collect();
        if candidates.is_empty() {
            candidates = eligible;
        }
        candidates.shuffle(&mut rand::thread_rng());
        candidates.first().copied()
    }
}

/// Coarse network bucket used for outbound diversity: /16 for IPv4, /32 for
/// IPv6.
pub fn group_key(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip4) => {
            let octets = ip4.octets();
            format!("{}.{}", octets[0], octets[1])
        }
        IpAddr::V6(ip6) => {
            let segments = ip6.segments();
            format!("{:x}:{:x}", segments[0], segments[1])
        }
    }
}

fn retry_cooldown(attempts: u32) -> u64 {
    match attempts {
        0 => 0,
        1 => 60,
        2 => 300,
        _ => 900,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_addr(ip: &str, port: u16) -> NetAddress {
        NetAddress {
            timestamp: unix_now() as u32,
            services: 1,
            addr: SocketAddr::new(ip.parse().unwrap(), port),
        }
    }

    #[test]
    fn future_timestamps_are_clamped() {
        let book = AddressBook::new();
        let mut address = net_addr("1.2.3.4", 8333);
        address.timestamp = (unix_now() + 3600) as u32;
        book.add_addresses(&[address]);
        let entries = book.entries.lock().unwrap();
        let entry = entries.get(&address.addr).unwrap();
        assert!(entry.last_seen <= unix_now().saturating_sub(CLAMP_PENALTY_SECS));
    }

    #[test]
    fn unoccupied_groups_are_preferred() {
        let book = AddressBook::new();
        book.add_addresses(&[net_addr("1.2.3.4", 8333), net_addr("5.6.7.8", 8333)]);

        let mut occupied = HashMap::new();
        occupied.insert("1.2".to_string(), 1);
        for _ in 0..10 {
            let addr = book.get_address(1, &occupied).expect("candidate");
            assert_eq!(group_key(addr.ip()), "5.6");
        }
    }

    #[test]
    fn occupied_groups_still_serve_when_exhausted() {
        let book = AddressBook::new();
        book.add_addresses(&[net_addr("1.2.3.4", 8333), net_addr("1.2.9.9", 8333)]);

        // Both candidates share the occupied group, so diversity gives way.
        let mut occupied = HashMap::new();
        occupied.insert("1.2".to_string(), 1);
        let addr = book.get_address(1, &occupied).expect("fallback candidate");
        assert_eq!(group_key(addr.ip()), "1.2");
    }

    #[test]
    fn required_services_filter() {
        let book = AddressBook::new();
        book.add_addresses(&[net_addr("5.6.7.8", 8333)]);
        assert_eq!(book.get_address(1 | 64, &HashMap::new()), None);
        assert!(book.get_address(1, &HashMap::new()).is_some());
    }

    #[test]
    fn group_keys_bucket_by_prefix() {
        assert_eq!(group_key("1.2.3.4".parse().unwrap()), "1.2");
        assert_eq!(group_key("1.2.200.200".parse().unwrap()), "1.2");
        assert_ne!(
            group_key("1.3.3.4".parse().unwrap()),
            group_key("1.2.3.4".parse().unwrap())
        );
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        {
            let book = AddressBook::open(&path);
            book.add_addresses(&[net_addr("9.9.9.9", 8333)]);
            book.save();
        }
        let book = AddressBook::open(&path);
        assert_eq!(book.len(), 1);
    }
}
