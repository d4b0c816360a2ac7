//! Rotating proxy pool
//!
//! Tracks a set of outbound egress endpoints, validates their liveness with a
//! bounded probe request, and hands one out per fetch attempt. Entries that
//! fail validation are evicted for the remainder of the run; the pool only
//! shrinks. When every entry is gone, callers fall back to a direct
//! connection.

use rand::Rng;
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Unknown,
    Alive,
    Dead,
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    addr: String,
    liveness: Liveness,
}

/// Shared pool of proxy endpoints
///
/// Safe under concurrent callers: selection and eviction both go through the
/// entry lock, and a freshly validated entry is re-checked under the lock so
/// an address evicted by one task is never handed out by another.
pub struct ProxyPool {
    entries: Mutex<Vec<ProxyEntry>>,
    clients: Mutex<HashMap<String, Client>>,
    probe_url: String,
}

impl ProxyPool {
    /// Creates a pool over the configured proxy addresses
    ///
    /// `probe_url` is the known-good URL used for liveness checks.
    pub fn new(addrs: &[String], probe_url: &str) -> Self {
        let entries = addrs
            .iter()
            .map(|addr| ProxyEntry {
                addr: addr.clone(),
                liveness: Liveness::Unknown,
            })
            .collect();

        Self {
            entries: Mutex::new(entries),
            clients: Mutex::new(HashMap::new()),
            probe_url: probe_url.to_string(),
        }
    }

    /// Returns a cached HTTP client routed through the given proxy
    ///
    /// Clients are built once per address so TLS setup is not repeated on
    /// every attempt.
    pub fn client_for(&self, addr: &str) -> Result<Client, reqwest::Error> {
        {
            let clients = self.clients.lock().unwrap();
            if let Some(client) = clients.get(addr) {
                return Ok(client.clone());
            }
        }

        let client = Client::builder()
            .proxy(Proxy::all(addr)?)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        self.clients
            .lock()
            .unwrap()
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Selects a live proxy address, validating lazily
    ///
    /// Picks at random among entries not yet known dead. Entries with
    /// unknown liveness are probed first; failures are evicted and selection
    /// continues. Returns `None` once the pool is exhausted (or was empty),
    /// at which point the caller should fall back to a direct connection.
    pub async fn acquire(&self) -> Option<String> {
        loop {
            let candidate = {
                let entries = self.entries.lock().unwrap();
                let live: Vec<&ProxyEntry> = entries
                    .iter()
                    .filter(|e| e.liveness != Liveness::Dead)
                    .collect();
                if live.is_empty() {
                    return None;
                }
                let pick = rand::thread_rng().gen_range(0..live.len());
                live[pick].clone()
            };

            if candidate.liveness == Liveness::Alive {
                return Some(candidate.addr);
            }

            if self.validate(&candidate.addr).await {
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.iter_mut().find(|e| e.addr == candidate.addr) {
                    // A concurrent caller may have evicted it while we probed
                    if entry.liveness == Liveness::Dead {
                        continue;
                    }
                    entry.liveness = Liveness::Alive;
                    return Some(candidate.addr);
                }
            } else {
                self.evict(&candidate.addr);
            }
        }
    }

    /// Probes the proxy with a bounded-timeout request against the probe URL
    pub async fn validate(&self, addr: &str) -> bool {
        let client = match self.client_for(addr) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(proxy = addr, error = %e, "failed to build proxy client");
                return false;
            }
        };

        match client
            .get(&self.probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(proxy = addr, "proxy validated");
                true
            }
            Ok(response) => {
                tracing::warn!(
                    proxy = addr,
                    status = response.status().as_u16(),
                    "proxy probe returned non-success status"
                );
                false
            }
            Err(e) => {
                tracing::warn!(proxy = addr, error = %e, "proxy probe failed");
                false
            }
        }
    }

    /// Removes an address from the working set for the rest of the run
    pub fn evict(&self, addr: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.addr == addr) {
            if entry.liveness != Liveness::Dead {
                entry.liveness = Liveness::Dead;
                tracing::warn!(proxy = addr, "proxy evicted");
            }
        }
    }

    /// Marks an address as known-alive without probing
    pub fn mark_alive(&self, addr: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.addr == addr) {
            if entry.liveness != Liveness::Dead {
                entry.liveness = Liveness::Alive;
            }
        }
    }

    /// Number of entries not yet evicted
    pub fn available(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.liveness != Liveness::Dead)
            .count()
    }
}
