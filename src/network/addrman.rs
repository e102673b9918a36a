//! Address manager for outbound connections
//!
//! Keeps the hosts we know about, hands out candidates for new
//! connections and scores them on the feedback the peer group reports
//! when a connection ends: a clean close counts as success, an error as
//! failure.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{info, warn};
use rand::Rng;

// =============================================================================
// Address Entry
// =============================================================================

/// A known host with its connection history
#[derive(Debug, Clone)]
pub struct AddrEntry {
    pub host: String,
    /// Where we learned about this host
    pub source: Option<String>,
    /// Failed attempts since the last success
    pub attempts: u32,
    pub successes: u32,
    pub last_success: Option<Instant>,
    pub last_attempt: Option<Instant>,
}

impl AddrEntry {
    pub fn new(host: String, source: Option<String>) -> Self {
        Self {
            host,
            source,
            attempts: 0,
            successes: 0,
            last_success: None,
            last_attempt: None,
        }
    }

    /// Too many failures without a single success
    pub fn is_terrible(&self) -> bool {
        self.successes == 0 && self.attempts >= 3
    }

    /// Relative selection weight
    pub fn chance(&self) -> f64 {
        let mut chance = 1.0;
        if self.attempts > 0 {
            chance *= 0.66_f64.powi(self.attempts.min(8) as i32);
        }
        if self.successes > 0 {
            chance *= 2.0;
        }
        chance
    }

    fn attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    fn good(&mut self) {
        self.successes += 1;
        self.attempts = 0;
        self.last_success = Some(Instant::now());
    }

    fn failed(&mut self) {
        self.attempts += 1;
    }
}

// =============================================================================
// Address Manager
// =============================================================================

#[derive(Debug, Default)]
pub struct AddrManager {
    by_host: HashMap<String, AddrEntry>,
    /// Hosts handed out and not yet reported back
    in_use: HashSet<String>,
}

impl AddrManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts(hosts: &[String]) -> Self {
        let mut manager = Self::new();
        manager.add_many(hosts.iter().cloned(), None);
        manager
    }

    pub fn size(&self) -> usize {
        self.by_host.len()
    }

    pub fn entry(&self, host: &str) -> Option<&AddrEntry> {
        self.by_host.get(host)
    }

    /// Add a host. Returns false if it was already known.
    pub fn add(&mut self, host: String, source: Option<String>) -> bool {
        if self.by_host.contains_key(&host) {
            return false;
        }
        self.by_host
            .insert(host.clone(), AddrEntry::new(host, source));
        true
    }

    pub fn add_many<I>(&mut self, hosts: I, source: Option<String>) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        hosts
            .into_iter()
            .filter(|host| self.add(host.clone(), source.clone()))
            .count()
    }

    /// Pick a host for a new connection and mark it in use.
    ///
    /// Selection is weighted by connection history; terrible hosts are
    /// only used when nothing else is left.
    pub fn next_host(&mut self) -> Option<String> {
        let mut eligible: Vec<&AddrEntry> = self
            .by_host
            .values()
            .filter(|e| !self.in_use.contains(&e.host) && !e.is_terrible())
            .collect();
        if eligible.is_empty() {
            eligible = self
                .by_host
                .values()
                .filter(|e| !self.in_use.contains(&e.host))
                .collect();
        }
        if eligible.is_empty() {
            return None;
        }

        let total: f64 = eligible.iter().map(|e| e.chance()).sum();
        let mut target = rand::thread_rng().gen::<f64>() * total;
        let mut chosen = eligible[eligible.len() - 1].host.clone();
        for entry in &eligible {
            target -= entry.chance();
            if target <= 0.0 {
                chosen = entry.host.clone();
                break;
            }
        }

        if let Some(entry) = self.by_host.get_mut(&chosen) {
            entry.attempt();
        }
        self.in_use.insert(chosen.clone());
        Some(chosen)
    }

    /// The connection to `host` ended cleanly
    pub fn mark_success(&mut self, host: &str) {
        self.in_use.remove(host);
        if let Some(entry) = self.by_host.get_mut(host) {
            entry.good();
        }
    }

    /// The connection to `host` failed or was rejected
    pub fn mark_failed(&mut self, host: &str) {
        self.in_use.remove(host);
        if let Some(entry) = self.by_host.get_mut(host) {
            entry.failed();
        }
    }

    pub fn is_in_use(&self, host: &str) -> bool {
        self.in_use.contains(host)
    }
}

/// Resolve DNS seeds into `ip:port` hosts
pub async fn resolve_seeds(seeds: &[&str], port: u16) -> Vec<String> {
    use tokio::net::lookup_host;

    let mut hosts = Vec::new();
    for seed in seeds {
        info!("Resolving DNS seed: {}", seed);
        match lookup_host((*seed, port)).await {
            Ok(addrs) => hosts.extend(addrs.map(|addr| addr.to_string())),
            Err(e) => warn!("Failed to resolve DNS seed {}: {}", seed, e),
        }
    }

    info!("Resolved {} addresses from DNS seeds", hosts.len());
    hosts
}
