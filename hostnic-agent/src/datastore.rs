use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DataStoreError {
    #[error("nic {0} already in datastore")]
    DuplicateNic(String),

    #[error("ip {1} already on nic {0}")]
    DuplicateIp(String, Ipv4Addr),

    #[error("nic {0} not found")]
    UnknownNic(String),

    #[error("ip {0} not found")]
    UnknownIp(Ipv4Addr),

    #[error("no free ip in pool")]
    NoFreeIp,

    #[error("ip {0} is already assigned to another pod")]
    AlreadyAssigned(Ipv4Addr),

    #[error("pod {0} has no assigned ip")]
    UnknownPod(PodKey),

    #[error("nic {0} still has assigned addresses")]
    NicInUse(String),
}

/// Identifies a pod uniquely on this node. Two sandboxes of the same
/// pod have distinct container ids and are therefore distinct keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
    pub container_id: String,
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}({})", self.namespace, self.name, self.container_id)
    }
}

#[derive(Clone, Debug)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub container_id: String,
}

impl PodInfo {
    pub fn key(&self) -> PodKey {
        PodKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            container_id: self.container_id.clone(),
        }
    }
}

#[derive(Clone, Debug)]
enum Assignment {
    Free,
    Assigned { pod: PodKey, since: SystemTime },
}

impl Assignment {
    fn is_assigned(&self) -> bool {
        matches!(self, Assignment::Assigned { .. })
    }
}

#[derive(Clone, Debug)]
struct Nic {
    id: String,
    device_index: u32,
    is_primary: bool,
    // BTreeMap keeps addresses in byte order so allocation within a nic
    // is deterministic.
    ips: BTreeMap<Ipv4Addr, Assignment>,
}

impl Nic {
    fn assigned(&self) -> usize {
        self.ips.values().filter(|a| a.is_assigned()).count()
    }
}

/// Read-only view of one nic, handed to the reconciler.
#[derive(Clone, Debug)]
pub struct NicSnapshot {
    pub id: String,
    pub device_index: u32,
    pub is_primary: bool,
    /// (address, assigned) pairs in allocation order.
    pub ips: Vec<(Ipv4Addr, bool)>,
}

impl NicSnapshot {
    pub fn all_free(&self) -> bool {
        self.ips.iter().all(|(_, assigned)| !assigned)
    }
}

/// In-memory bookkeeping of attached nics, the addresses they carry and
/// which pod owns which address. This is the only state shared between
/// the RPC handlers and the reconciler; the owner wraps it in a mutex
/// and no operation suspends or performs I/O.
#[derive(Default)]
pub struct DataStore {
    nics: HashMap<String, Nic>,
    // pod key -> (nic id, address); the authoritative record stays on
    // the nic, this index only makes the idempotence checks O(1).
    pods: HashMap<PodKey, (String, Ipv4Addr)>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a nic the cloud reports as attached. An exact duplicate is
    /// reported as `DuplicateNic`; callers treat it as non-fatal.
    pub fn add_nic(
        &mut self,
        id: &str,
        device_index: u32,
        is_primary: bool,
    ) -> Result<(), DataStoreError> {
        if self.nics.contains_key(id) {
            return Err(DataStoreError::DuplicateNic(id.to_string()));
        }
        info!("datastore: add nic {id} device {device_index} primary {is_primary}");
        self.nics.insert(
            id.to_string(),
            Nic {
                id: id.to_string(),
                device_index,
                is_primary,
                ips: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Record a free address carried by a nic.
    pub fn add_ip(&mut self, nic_id: &str, ip: Ipv4Addr) -> Result<(), DataStoreError> {
        let nic = self
            .nics
            .get_mut(nic_id)
            .ok_or_else(|| DataStoreError::UnknownNic(nic_id.to_string()))?;
        if nic.ips.contains_key(&ip) {
            return Err(DataStoreError::DuplicateIp(nic_id.to_string(), ip));
        }
        debug!("datastore: add ip {ip} on nic {nic_id}");
        nic.ips.insert(ip, Assignment::Free);
        Ok(())
    }

    /// Bind a free address to a pod and return it together with the
    /// device index of the carrying nic. Nics are scanned in ascending
    /// device-index order and never include the primary nic. Calling
    /// again with the same pod key returns the existing binding.
    pub fn assign_pod(&mut self, pod: &PodInfo) -> Result<(Ipv4Addr, u32), DataStoreError> {
        let key = pod.key();
        if let Some((nic_id, ip)) = self.pods.get(&key) {
            let device = self.nics[nic_id].device_index;
            debug!("datastore: pod {key} already assigned {ip}");
            return Ok((*ip, device));
        }

        let mut nics: Vec<&mut Nic> = self.nics.values_mut().filter(|n| !n.is_primary).collect();
        nics.sort_by_key(|n| n.device_index);

        for nic in nics {
            let free = nic
                .ips
                .iter()
                .find(|(_, a)| !a.is_assigned())
                .map(|(ip, _)| *ip);
            if let Some(ip) = free {
                nic.ips.insert(
                    ip,
                    Assignment::Assigned {
                        pod: key.clone(),
                        since: SystemTime::now(),
                    },
                );
                let device = nic.device_index;
                let nic_id = nic.id.clone();
                self.pods.insert(key.clone(), (nic_id, ip));
                info!("datastore: assigned {ip} (device {device}) to pod {key}");
                return Ok((ip, device));
            }
        }
        Err(DataStoreError::NoFreeIp)
    }

    /// Bind a pod to the specific address it already holds; used by
    /// bootstrap recovery when the orchestrator still knows the pod.
    /// Idempotent per pod key like `assign_pod`.
    pub fn assign_pod_address(
        &mut self,
        pod: &PodInfo,
        ip: Ipv4Addr,
    ) -> Result<(Ipv4Addr, u32), DataStoreError> {
        let key = pod.key();
        if let Some((nic_id, existing)) = self.pods.get(&key) {
            let device = self.nics[nic_id].device_index;
            return Ok((*existing, device));
        }
        for nic in self.nics.values_mut() {
            let Some(assignment) = nic.ips.get(&ip) else {
                continue;
            };
            if assignment.is_assigned() {
                return Err(DataStoreError::AlreadyAssigned(ip));
            }
            nic.ips.insert(
                ip,
                Assignment::Assigned {
                    pod: key.clone(),
                    since: SystemTime::now(),
                },
            );
            self.pods.insert(key.clone(), (nic.id.clone(), ip));
            info!("datastore: recovered {ip} (device {}) for pod {key}", nic.device_index);
            return Ok((ip, nic.device_index));
        }
        Err(DataStoreError::UnknownIp(ip))
    }

    /// Return a pod's address to the free pool. A second call for the
    /// same key reports `UnknownPod`, which callers treat as success.
    pub fn unassign_pod(&mut self, pod: &PodInfo) -> Result<(Ipv4Addr, u32), DataStoreError> {
        let key = pod.key();
        let (nic_id, ip) = self
            .pods
            .remove(&key)
            .ok_or_else(|| DataStoreError::UnknownPod(key.clone()))?;
        let nic = self
            .nics
            .get_mut(&nic_id)
            .ok_or(DataStoreError::UnknownNic(nic_id))?;
        if let Some(Assignment::Assigned { since, .. }) = nic.ips.insert(ip, Assignment::Free) {
            let age = since.elapsed().unwrap_or_default();
            info!("datastore: released {ip} from pod {key} after {age:?}");
        }
        Ok((ip, nic.device_index))
    }

    /// Fallback used when the caller only knows an address, e.g. while
    /// cleaning up an orphan. Frees the address if it was assigned.
    pub fn unassign_pod_by_ip(&mut self, ip: Ipv4Addr) -> Result<u32, DataStoreError> {
        for nic in self.nics.values_mut() {
            if let Some(assignment) = nic.ips.get(&ip) {
                if let Assignment::Assigned { pod, .. } = assignment {
                    let pod = pod.clone();
                    self.pods.remove(&pod);
                    nic.ips.insert(ip, Assignment::Free);
                    info!("datastore: released {ip} from pod {pod} (by ip)");
                }
                return Ok(nic.device_index);
            }
        }
        Err(DataStoreError::UnknownIp(ip))
    }

    /// Drop a nic and every address on it. Refused while any address is
    /// still bound to a pod.
    pub fn remove_nic(&mut self, nic_id: &str) -> Result<(), DataStoreError> {
        let nic = self
            .nics
            .get(nic_id)
            .ok_or_else(|| DataStoreError::UnknownNic(nic_id.to_string()))?;
        if nic.assigned() > 0 {
            return Err(DataStoreError::NicInUse(nic_id.to_string()));
        }
        info!("datastore: remove nic {nic_id}");
        self.nics.remove(nic_id);
        Ok(())
    }

    /// (total, assigned) over the non-primary nics.
    pub fn stats(&self) -> (usize, usize) {
        let mut total = 0;
        let mut assigned = 0;
        for nic in self.nics.values().filter(|n| !n.is_primary) {
            total += nic.ips.len();
            assigned += nic.assigned();
        }
        (total, assigned)
    }

    /// Consistent point-in-time view for the reconciler, in ascending
    /// device-index order.
    pub fn snapshot(&self) -> Vec<NicSnapshot> {
        let mut out: Vec<NicSnapshot> = self
            .nics
            .values()
            .map(|n| NicSnapshot {
                id: n.id.clone(),
                device_index: n.device_index,
                is_primary: n.is_primary,
                ips: n.ips.iter().map(|(ip, a)| (*ip, a.is_assigned())).collect(),
            })
            .collect();
        out.sort_by_key(|n| n.device_index);
        out
    }

    /// Device index of the nic carrying `ip`, used by bootstrap recovery
    /// to find the routing table for a surviving pod.
    pub fn nic_index_by_ip(&self, ip: Ipv4Addr) -> Option<u32> {
        self.nics
            .values()
            .find(|n| n.ips.contains_key(&ip))
            .map(|n| n.device_index)
    }

    /// Addresses currently bound to a pod.
    pub fn assigned_ips(&self) -> Vec<Ipv4Addr> {
        self.pods.values().map(|(_, ip)| *ip).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pod(name: &str) -> PodInfo {
        PodInfo {
            namespace: "default".into(),
            name: name.into(),
            container_id: format!("cid-{name}"),
        }
    }

    fn store_with_pool() -> DataStore {
        let mut ds = DataStore::new();
        ds.add_nic("nic-primary", 0, true).unwrap();
        ds.add_ip("nic-primary", Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        ds.add_nic("nic-b", 2, false).unwrap();
        ds.add_ip("nic-b", Ipv4Addr::new(10, 0, 0, 12)).unwrap();
        ds.add_nic("nic-a", 1, false).unwrap();
        ds.add_ip("nic-a", Ipv4Addr::new(10, 0, 0, 11)).unwrap();
        ds
    }

    #[test]
    fn test_add_nic_duplicate() {
        let mut ds = DataStore::new();
        ds.add_nic("nic-a", 1, false).unwrap();
        assert_eq!(
            ds.add_nic("nic-a", 1, false),
            Err(DataStoreError::DuplicateNic("nic-a".into()))
        );
    }

    #[test]
    fn test_add_ip_unknown_nic() {
        let mut ds = DataStore::new();
        assert_eq!(
            ds.add_ip("nope", Ipv4Addr::new(10, 0, 0, 1)),
            Err(DataStoreError::UnknownNic("nope".into()))
        );
    }

    #[test]
    fn test_assign_prefers_lowest_device_index() {
        let mut ds = store_with_pool();
        let (ip, device) = ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 11));
        assert_eq!(device, 1);
    }

    #[test]
    fn test_assign_never_uses_primary() {
        let mut ds = store_with_pool();
        ds.assign_pod(&pod("p1")).unwrap();
        ds.assign_pod(&pod("p2")).unwrap();
        assert_eq!(ds.assign_pod(&pod("p3")), Err(DataStoreError::NoFreeIp));
        // the primary address stays untouched
        assert_eq!(ds.stats(), (2, 2));
    }

    #[test]
    fn test_assign_is_idempotent_per_pod_key() {
        let mut ds = store_with_pool();
        let first = ds.assign_pod(&pod("p1")).unwrap();
        let second = ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(first, second);
        assert_eq!(ds.stats(), (2, 1));
    }

    #[test]
    fn test_unassign_then_unassign_reports_unknown() {
        let mut ds = store_with_pool();
        let (ip, device) = ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(ds.unassign_pod(&pod("p1")), Ok((ip, device)));
        assert_eq!(
            ds.unassign_pod(&pod("p1")),
            Err(DataStoreError::UnknownPod(pod("p1").key()))
        );
    }

    #[test]
    fn test_reassign_after_release_may_differ() {
        let mut ds = store_with_pool();
        let (first, _) = ds.assign_pod(&pod("p1")).unwrap();
        ds.unassign_pod(&pod("p1")).unwrap();
        let (second, _) = ds.assign_pod(&pod("p1")).unwrap();
        // the intermediate release returned the first address to the pool
        assert_eq!(ds.stats(), (2, 1));
        assert_eq!(first, second); // deterministic order picks it again
    }

    #[test]
    fn test_unassign_by_ip() {
        let mut ds = store_with_pool();
        let (ip, device) = ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(ds.unassign_pod_by_ip(ip), Ok(device));
        assert_eq!(ds.stats(), (2, 0));
        // pod index was cleaned up as well
        assert_eq!(
            ds.unassign_pod(&pod("p1")),
            Err(DataStoreError::UnknownPod(pod("p1").key()))
        );
        assert_eq!(
            ds.unassign_pod_by_ip(Ipv4Addr::new(192, 0, 2, 1)),
            Err(DataStoreError::UnknownIp(Ipv4Addr::new(192, 0, 2, 1)))
        );
    }

    #[test]
    fn test_remove_nic_in_use() {
        let mut ds = store_with_pool();
        let (_, device) = ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(device, 1);
        assert_eq!(
            ds.remove_nic("nic-a"),
            Err(DataStoreError::NicInUse("nic-a".into()))
        );
        ds.unassign_pod(&pod("p1")).unwrap();
        ds.remove_nic("nic-a").unwrap();
        assert_eq!(ds.stats(), (1, 0));
    }

    #[test]
    fn test_stats_track_assignments() {
        let mut ds = store_with_pool();
        assert_eq!(ds.stats(), (2, 0));
        ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(ds.stats(), (2, 1));
        ds.unassign_pod(&pod("p1")).unwrap();
        assert_eq!(ds.stats(), (2, 0));
    }

    #[test]
    fn test_assignment_counts_stay_consistent() {
        // invariant: assigned ips across nics == pod bindings
        let mut ds = store_with_pool();
        ds.add_ip("nic-a", Ipv4Addr::new(10, 0, 0, 13)).unwrap();
        for name in ["a", "b", "c"] {
            ds.assign_pod(&pod(name)).unwrap();
        }
        ds.unassign_pod(&pod("b")).unwrap();
        let (_, assigned) = ds.stats();
        assert_eq!(assigned, ds.assigned_ips().len());
        assert_eq!(assigned, 2);
    }

    #[test]
    fn test_snapshot_order_and_lookup() {
        let ds = store_with_pool();
        let snap = ds.snapshot();
        let indices: Vec<u32> = snap.iter().map(|n| n.device_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(ds.nic_index_by_ip(Ipv4Addr::new(10, 0, 0, 12)), Some(2));
        assert_eq!(ds.nic_index_by_ip(Ipv4Addr::new(192, 0, 2, 1)), None);
    }

    #[test]
    fn test_assign_pod_address_recovers_specific_ip() {
        let mut ds = store_with_pool();
        let target = Ipv4Addr::new(10, 0, 0, 12);
        let (ip, device) = ds.assign_pod_address(&pod("p1"), target).unwrap();
        assert_eq!((ip, device), (target, 2));
        // idempotent per key
        assert_eq!(ds.assign_pod_address(&pod("p1"), target), Ok((target, 2)));
        // a different pod cannot take the same address
        assert_eq!(
            ds.assign_pod_address(&pod("p2"), target),
            Err(DataStoreError::AlreadyAssigned(target))
        );
        // an address the datastore never saw is rejected
        assert_eq!(
            ds.assign_pod_address(&pod("p3"), Ipv4Addr::new(192, 0, 2, 9)),
            Err(DataStoreError::UnknownIp(Ipv4Addr::new(192, 0, 2, 9)))
        );
    }

    #[test]
    fn test_ip_order_within_nic_is_deterministic() {
        let mut ds = DataStore::new();
        ds.add_nic("nic-a", 1, false).unwrap();
        ds.add_ip("nic-a", Ipv4Addr::new(10, 0, 0, 30)).unwrap();
        ds.add_ip("nic-a", Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        let (ip, _) = ds.assign_pod(&pod("p1")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
    }
}
