use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::{SafeStrMap, StoreError};

/// A named L2 domain with a leasable IPv4 pool.
///
/// Never mutated after creation except through the lease table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub tenant: String,
    #[serde(rename = "ipAddr")]
    pub ip_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(rename = "ipRange")]
    pub ip_range: u32,
    #[serde(default)]
    pub provider: Provider,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Esp,
    Vxlan,
    Fabric,
    #[default]
    Overlan,
}

/// A reserved address within a network's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Registry of networks plus the address-lease table.
///
/// Constructed per application context and passed down explicitly; tests
/// build their own.
#[derive(Debug)]
pub struct NetworkStore {
    nets: SafeStrMap<Network>,
    leased: RwLock<HashMap<String, BTreeSet<Ipv4Addr>>>,
}

impl NetworkStore {
    pub fn new(cap: usize) -> Self {
        Self {
            nets: SafeStrMap::new(cap),
            leased: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, net: Network) -> Result<(), StoreError> {
        let tenant = net.tenant.clone();
        self.nets.set(&tenant, net).await
    }

    pub async fn del(&self, tenant: &str) -> bool {
        self.leased.write().await.remove(tenant);
        self.nets.del(tenant).await
    }

    pub async fn get(&self, tenant: &str) -> Option<Network> {
        self.nets.get(tenant).await
    }

    pub async fn list(&self) -> Vec<Network> {
        self.nets
            .snapshot()
            .await
            .into_iter()
            .map(|(_, n)| n)
            .collect()
    }

    /// Reserves the first unleased address in `[base, base + ip_range)`,
    /// or `None` when the pool is exhausted.
    pub async fn free_addr(&self, tenant: &str) -> Option<Lease> {
        let net = self.nets.get(tenant).await?;
        let mut leased = self.leased.write().await;
        let used = leased.entry(tenant.to_string()).or_default();

        let base = u32::from(net.ip_addr);
        for i in 0..net.ip_range {
            let addr = Ipv4Addr::from(base.wrapping_add(i));
            if used.insert(addr) {
                return Some(Lease {
                    ip: addr,
                    netmask: net.netmask,
                });
            }
        }
        None
    }

    /// Returns a leased address to the free set.
    pub async fn release(&self, tenant: &str, ip: Ipv4Addr) -> bool {
        let mut leased = self.leased.write().await;
        leased.get_mut(tenant).is_some_and(|used| used.remove(&ip))
    }

    /// Loads the persisted network set, replacing nothing that already
    /// exists under a different tenant.
    pub async fn load(&self, path: &Path) -> anyhow::Result<usize> {
        let data =
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let nets: Vec<Network> = serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", path.display()))?;

        let mut count = 0;
        for n in nets {
            self.add(n).await.map_err(|e| anyhow::anyhow!("network store: {e}"))?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut nets = self.list().await;
        nets.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        let data = serde_json::to_vec_pretty(&nets)?;
        std::fs::write(path, data).with_context(|| format!("write {}", path.display()))
    }
}
