use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datastore::DataStoreError;
use crate::ipam::Ipamd;
use crate::retry::{Backoff, retry};
use crate::{Error, Result, metrics};

const RECONCILE_PERIOD: Duration = Duration::from_secs(5);

/// Ground-truth reconcile against the cloud once a minute; the pool
/// check runs every tick.
const CLOUD_SYNC_EVERY: u64 = 12;

/// How long a freshly attached nic may take to show up in the describe
/// output.
const ATTACH_WAIT: Backoff = Backoff::new(5, Duration::from_secs(2));

impl Ipamd {
    /// The periodic task keeping the free pool between the low and high
    /// water marks. Ticks never overlap and each tick adjusts by at
    /// most one nic to bound churn.
    pub async fn run_pool_reconciler(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(RECONCILE_PERIOD);
        let mut n: u64 = 0;
        info!("pool reconciler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pool reconciler stopped");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile_once(n % CLOUD_SYNC_EVERY == 0).await {
                        warn!(%e, "pool reconcile failed");
                    }
                    n += 1;
                }
            }
        }
    }

    pub(crate) async fn reconcile_once(&self, sync_cloud: bool) -> Result<()> {
        if sync_cloud {
            if let Err(e) = self.sync_with_cloud().await {
                warn!(%e, "cloud reconcile failed");
            }
        }

        let (total, assigned) = self.stats();
        metrics::set_pool_stats(total, assigned);
        let free = total - assigned;
        if free < self.config.pool_size {
            debug!("pool below low water mark ({free} < {})", self.config.pool_size);
            self.grow_pool().await?;
        } else if free > self.config.max_pool_size {
            debug!(
                "pool above high water mark ({free} > {})",
                self.config.max_pool_size
            );
            self.shrink_pool_once().await?;
        }
        Ok(())
    }

    pub(crate) async fn grow_pool(&self) -> Result<()> {
        let _guard = self.grow_lock.lock().await;
        self.grow_pool_locked().await
    }

    /// Synchronous grow attempted by an Add that found the pool empty.
    /// Bounded once: if the reconciler (or another Add) is already
    /// growing, report exhaustion instead of queueing.
    pub(crate) async fn try_grow_pool(&self) -> Result<()> {
        match self.grow_lock.try_lock() {
            Ok(_guard) => self.grow_pool_locked().await,
            Err(_) => Err(Error::Other("pool grow already in progress".to_string())),
        }
    }

    async fn grow_pool_locked(&self) -> Result<()> {
        let tags = self.config.nic_tags();
        let vxnet = &self.node.vxnet.id;

        let nic = retry(Backoff::cloud(), "create nic", || {
            self.cloud.create_nic(vxnet, &tags)
        })
        .await?;
        retry(Backoff::cloud(), "attach nic", || {
            self.cloud.attach_nic(&nic.id)
        })
        .await?;

        // Created is not hot: wait until the cloud reports it attached.
        let attached = retry(ATTACH_WAIT, "await nic attach", || async {
            self.cloud
                .attached_nics(vxnet)
                .await?
                .into_iter()
                .find(|n| n.id == nic.id)
                .ok_or_else(|| Error::Cloud(format!("nic {} not attached yet", nic.id)))
        })
        .await?;

        let device_index = self.setup_nic(&attached).await?;
        info!("pool grown by nic {} (device {device_index})", attached.id);
        Ok(())
    }

    pub(crate) async fn shrink_pool_once(&self) -> Result<()> {
        let candidate = {
            let ds = self.datastore.lock().unwrap();
            ds.snapshot()
                .into_iter()
                .find(|n| !n.is_primary && !n.ips.is_empty() && n.all_free())
        };
        let Some(nic) = candidate else {
            debug!("pool above high water mark but no fully free nic to detach");
            return Ok(());
        };

        // A concurrent Add may have grabbed the last address between the
        // snapshot and here; the datastore refuses and we retry next
        // tick.
        match self.datastore.lock().unwrap().remove_nic(&nic.id) {
            Ok(()) => {}
            Err(DataStoreError::NicInUse(_)) => {
                debug!("shrink of {} raced with an assign, retrying next tick", nic.id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        retry(Backoff::cloud(), "detach nic", || {
            self.cloud.detach_nic(&nic.id)
        })
        .await?;
        retry(Backoff::cloud(), "delete nic", || {
            self.cloud.delete_nic(&nic.id)
        })
        .await?;
        info!("pool shrunk by nic {}", nic.id);
        Ok(())
    }

    /// Reconcile the datastore against what the cloud actually reports
    /// attached: adopt unknown nics, drop vanished ones.
    pub(crate) async fn sync_with_cloud(&self) -> Result<()> {
        let cloud_nics = self.cloud.attached_nics(&self.node.vxnet.id).await?;
        let cloud_ids: HashSet<&str> = cloud_nics.iter().map(|n| n.id.as_str()).collect();
        let snapshot = self.datastore.lock().unwrap().snapshot();
        let known: HashSet<&str> = snapshot.iter().map(|n| n.id.as_str()).collect();

        for nic in &cloud_nics {
            if !known.contains(nic.id.as_str()) {
                info!("adopting nic {} found attached in the cloud", nic.id);
                if let Err(e) = self.setup_nic(nic).await {
                    warn!(%e, "failed to adopt nic {}", nic.id);
                }
            }
        }

        for nic in snapshot.iter().filter(|n| !n.is_primary) {
            if cloud_ids.contains(nic.id.as_str()) {
                continue;
            }
            for (ip, assigned) in &nic.ips {
                if *assigned {
                    warn!("assignment {ip} on vanished nic {} is orphaned", nic.id);
                }
            }
            match self.datastore.lock().unwrap().remove_nic(&nic.id) {
                Ok(()) => info!("dropped nic {} no longer attached in the cloud", nic.id),
                Err(DataStoreError::NicInUse(_)) => {
                    warn!("keeping vanished nic {} until its pods release it", nic.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cloud::CloudApi;
    use crate::datastore::PodInfo;
    use crate::ipam::testing::*;

    fn pod(name: &str) -> PodInfo {
        PodInfo {
            namespace: "default".into(),
            name: name.into(),
            container_id: format!("cid-{name}"),
        }
    }

    #[tokio::test]
    async fn test_grows_pool_to_low_water_mark() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let ipamd = test_ipamd(cloud.clone(), network.clone());

        // pool_size is 3 and one tick attaches at most one nic
        for _ in 0..3 {
            ipamd.reconcile_once(false).await.unwrap();
        }
        assert_eq!(ipamd.stats(), (3, 0));
        assert_eq!(cloud.create_calls.load(Ordering::SeqCst), 3);
        assert_eq!(cloud.attach_calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            network
                .calls()
                .iter()
                .filter(|c| c.starts_with("setup_nic_network"))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_steady_state_makes_no_cloud_mutations() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let ipamd = test_ipamd(cloud.clone(), network.clone());
        for _ in 0..3 {
            ipamd.reconcile_once(false).await.unwrap();
        }

        let mutations = cloud.cloud_mutations();
        for _ in 0..5 {
            ipamd.reconcile_once(false).await.unwrap();
        }
        assert_eq!(cloud.cloud_mutations(), mutations);
    }

    #[tokio::test]
    async fn test_shrinks_pool_above_high_water_mark() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let mut ipamd = test_ipamd(cloud.clone(), network.clone());
        ipamd.config.max_pool_size = 1;

        for _ in 0..3 {
            ipamd.reconcile_once(false).await.unwrap();
        }
        assert_eq!(ipamd.stats(), (3, 0));

        // 3 free > max 1: one nic leaves per tick
        ipamd.reconcile_once(false).await.unwrap();
        assert_eq!(ipamd.stats(), (2, 0));
        assert_eq!(cloud.detach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shrink_only_touches_fully_free_nics() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let mut ipamd = test_ipamd(cloud.clone(), network.clone());
        ipamd.config.pool_size = 0;
        ipamd.config.max_pool_size = 0;
        ipamd.grow_pool().await.unwrap();
        ipamd.grow_pool().await.unwrap();

        // the first nic's address is in use, only the second may go
        ipamd
            .datastore
            .lock()
            .unwrap()
            .assign_pod(&pod("p1"))
            .unwrap();
        ipamd.shrink_pool_once().await.unwrap();
        assert_eq!(ipamd.stats(), (1, 1));
        assert_eq!(cloud.detach_calls.load(Ordering::SeqCst), 1);

        // nothing detachable is left; the tick backs off
        ipamd.shrink_pool_once().await.unwrap();
        assert_eq!(cloud.detach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ipamd.stats(), (1, 1));
    }

    #[tokio::test]
    async fn test_sync_adopts_and_drops_nics() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let ipamd = test_ipamd(cloud.clone(), network.clone());

        // attached in the cloud but unknown locally: adopted
        cloud.create_nic("vxnet-pods", &[]).await.unwrap();
        ipamd.sync_with_cloud().await.unwrap();
        assert_eq!(ipamd.stats(), (1, 0));

        // gone from the cloud: dropped locally
        cloud.nics.lock().unwrap().clear();
        ipamd.sync_with_cloud().await.unwrap();
        assert_eq!(ipamd.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_try_grow_pool_is_bounded_once() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let ipamd = test_ipamd(cloud.clone(), network.clone());

        let _held = ipamd.grow_lock.lock().await;
        // a concurrent grow is already running: report exhaustion
        assert!(ipamd.try_grow_pool().await.is_err());
        assert_eq!(cloud.create_calls.load(Ordering::SeqCst), 0);
    }
}
