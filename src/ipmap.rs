//! Candidate server addresses, learned per hostname.
//!
//! An [`IpSet`] holds every address known for one host, in preference order,
//! with at most one address marked as confirmed working. An [`IpMap`] hands
//! out one set per hostname for the lifetime of the process, so every user
//! of a host shares what the others have learned.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;

#[derive(Default)]
struct Inner {
    /// Known addresses, best candidate first.
    ips: Vec<IpAddr>,
    /// Address confirmed to be working, if any. Always a member of `ips`.
    confirmed: Option<IpAddr>,
}

/// Collection of candidate IP addresses for a single host.
///
/// Addresses are stored canonicalized, so IPv4-mapped IPv6 forms compare
/// equal to their IPv4 counterparts and the set never holds duplicates.
#[derive(Default)]
pub struct IpSet {
    inner: RwLock<Inner>,
}

impl IpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `hostname` (a domain name or IP literal) and union the
    /// results into the set. Resolver failures leave the set unchanged.
    ///
    /// The lookup runs before the write lock is taken.
    pub async fn add(&self, hostname: &str) {
        let resolved: Vec<IpAddr> = match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                log::debug!("lookup of {hostname} failed: {e}");
                return;
            }
        };

        let mut inner = self.inner.write().unwrap();
        for ip in resolved {
            let ip = ip.to_canonical();
            if !inner.ips.contains(&ip) {
                inner.ips.push(ip);
            }
        }
    }

    /// Whether the set holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().ips.is_empty()
    }

    /// An owned snapshot of the addresses in random order.
    pub fn get_all(&self) -> Vec<IpAddr> {
        let mut snapshot = self.inner.read().unwrap().ips.clone();
        // Shuffle outside the lock.
        snapshot.shuffle(&mut rand::rng());
        snapshot
    }

    /// An owned snapshot of the addresses in preference order.
    pub fn ordered(&self) -> Vec<IpAddr> {
        self.inner.read().unwrap().ips.clone()
    }

    /// The confirmed-working address, if one is set.
    pub fn confirmed(&self) -> Option<IpAddr> {
        self.inner.read().unwrap().confirmed
    }

    /// Mark `ip` as the confirmed address if it parses as an IP address.
    /// Invalid input is ignored. The address joins the set if it is not
    /// already a member.
    pub fn confirm(&self, ip: &str) {
        let Ok(ip) = ip.parse::<IpAddr>() else {
            return;
        };
        let ip = ip.to_canonical();
        let mut inner = self.inner.write().unwrap();
        if !inner.ips.contains(&ip) {
            inner.ips.push(ip);
        }
        inner.confirmed = Some(ip);
    }

    /// Clear the confirmed slot if it currently holds `ip`.
    pub fn disconfirm(&self, ip: IpAddr) {
        let ip = ip.to_canonical();
        let mut inner = self.inner.write().unwrap();
        if inner.confirmed == Some(ip) {
            inner.confirmed = None;
        }
    }

    /// Move `ip` to the front of the preference order. The relative order of
    /// all other addresses is preserved. Unknown addresses are ignored.
    pub fn promote(&self, ip: IpAddr) {
        let ip = ip.to_canonical();
        let mut inner = self.inner.write().unwrap();
        if let Some(pos) = inner.ips.iter().position(|c| *c == ip) {
            if pos > 0 {
                inner.ips.remove(pos);
                inner.ips.insert(0, ip);
            }
        }
    }
}

/// Maps hostnames to [`IpSet`]s, creating each set on first use.
#[derive(Default)]
pub struct IpMap {
    map: RwLock<HashMap<String, Arc<IpSet>>>,
}

impl IpMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set for `hostname`, populated by resolving it on first use.
    /// Subsequent calls return the same set.
    pub async fn get(&self, hostname: &str) -> Arc<IpSet> {
        if let Some(set) = self.map.read().unwrap().get(hostname) {
            return set.clone();
        }

        // Populate without holding the map lock; the resolver may block.
        let set = Arc::new(IpSet::new());
        set.add(hostname).await;

        let mut map = self.map.write().unwrap();
        match map.get(hostname) {
            // A concurrent call installed a set while we were resolving.
            // Keep the installed one so every caller sees the same set.
            Some(existing) => existing.clone(),
            None => {
                map.insert(hostname.to_string(), set.clone());
                set
            }
        }
    }
}
