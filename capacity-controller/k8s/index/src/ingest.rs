//! Turns pod and replica set watches into cache updates.

use crate::cache::{PodListing, ReplicaSetListing, SharedCache, Update};
use capacity_controller_core::{GroupId, NodePool, PodUid};
use capacity_controller_k8s_api::{self as k8s, affinity, owner, ResourceExt};
use futures::prelude::*;
use kube::runtime::watcher::Event;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Reports whether both watches have completed their initial listing.
#[derive(Clone, Debug)]
pub struct Readiness(watch::Receiver<Synced>);

/// Marks one watch as synced.
#[derive(Debug)]
pub struct SyncHandle {
    tx: Arc<watch::Sender<Synced>>,
    kind: Kind,
}

#[derive(Copy, Clone, Debug, Default)]
struct Synced {
    pods: bool,
    replica_sets: bool,
}

#[derive(Copy, Clone, Debug)]
enum Kind {
    Pods,
    ReplicaSets,
}

/// Creates a readiness gate along with the handles for the pod and replica set
/// watches, respectively.
pub fn readiness() -> (Readiness, SyncHandle, SyncHandle) {
    let (tx, rx) = watch::channel(Synced::default());
    let tx = Arc::new(tx);
    let pods = SyncHandle {
        tx: tx.clone(),
        kind: Kind::Pods,
    };
    let replica_sets = SyncHandle {
        tx,
        kind: Kind::ReplicaSets,
    };
    (Readiness(rx), pods, replica_sets)
}

/// Processes pod watch events until the stream ends.
pub async fn pods<S>(cache: SharedCache, events: S, synced: SyncHandle)
where
    S: Stream<Item = Event<k8s::Pod>>,
{
    tokio::pin!(events);
    let mut listing: Option<PodListing> = None;
    while let Some(event) = events.next().await {
        match event {
            Event::Init => {
                debug!("Listing pods");
                listing = Some(PodListing::default());
            }
            Event::InitApply(pod) => {
                if let Some((group, uid, pool)) = pod_record(&pod) {
                    listing
                        .get_or_insert_with(Default::default)
                        .entry(group)
                        .or_default()
                        .insert(uid, pool);
                }
            }
            Event::InitDone => {
                let listing = listing.take().unwrap_or_default();
                info!(groups = listing.len(), "Pods synced");
                cache.apply(Update::PodsReset(listing)).await;
                synced.set();
            }
            Event::Apply(pod) => {
                if let Some((group, pod, pool)) = pod_record(&pod) {
                    cache.apply(Update::PodApplied { group, pod, pool }).await;
                }
            }
            Event::Delete(pod) => {
                if let Some((group, pod, _)) = pod_record(&pod) {
                    cache.apply(Update::PodDeleted { group, pod }).await;
                }
            }
        }
    }
    debug!("Pod watch ended");
}

/// Processes replica set watch events until the stream ends.
pub async fn replica_sets<S>(cache: SharedCache, events: S, synced: SyncHandle)
where
    S: Stream<Item = Event<k8s::ReplicaSet>>,
{
    tokio::pin!(events);
    let mut listing: Option<ReplicaSetListing> = None;
    while let Some(event) = events.next().await {
        match event {
            Event::Init => {
                debug!("Listing replica sets");
                listing = Some(ReplicaSetListing::default());
            }
            Event::InitApply(rs) => {
                if let Some((group, eligible)) = replica_set_record(&rs) {
                    listing
                        .get_or_insert_with(Default::default)
                        .insert(group, eligible);
                }
            }
            Event::InitDone => {
                let listing = listing.take().unwrap_or_default();
                info!(replica_sets = listing.len(), "Replica sets synced");
                cache.apply(Update::ReplicaSetsReset(listing)).await;
                synced.set();
            }
            Event::Apply(rs) => {
                if let Some((group, eligible)) = replica_set_record(&rs) {
                    cache
                        .apply(Update::ReplicaSetApplied { group, eligible })
                        .await;
                }
            }
            Event::Delete(rs) => {
                if let Some((group, _)) = replica_set_record(&rs) {
                    cache.apply(Update::ReplicaSetDeleted { group }).await;
                }
            }
        }
    }
    debug!("Replica set watch ended");
}

fn pod_record(pod: &k8s::Pod) -> Option<(GroupId, PodUid, Option<NodePool>)> {
    let Some(group) = owner::pod_group(&pod.metadata) else {
        trace!(ns = ?pod.namespace(), name = %pod.name_any(), "Ignoring pod without a replica set");
        return None;
    };
    let uid = pod.uid()?;
    let pool = affinity::required_pool(pod.spec.as_ref());
    Some((group, uid.into(), pool))
}

fn replica_set_record(rs: &k8s::ReplicaSet) -> Option<(GroupId, bool)> {
    let uid = rs.uid()?;
    Some((uid.into(), owner::replica_set_eligible(&rs.metadata)))
}

// === impl Readiness ===

impl Readiness {
    /// Returns true once both watches have synced.
    pub fn is_ready(&self) -> bool {
        self.0.borrow().is_ready()
    }

    /// Waits for both watches to sync.
    ///
    /// Returns false if the watches stopped before syncing.
    pub async fn ready(&self) -> bool {
        let mut rx = self.0.clone();
        let ready = rx.wait_for(Synced::is_ready).await.is_ok();
        ready
    }
}

// === impl SyncHandle ===

impl SyncHandle {
    fn set(&self) {
        let kind = self.kind;
        self.tx.send_if_modified(|synced| {
            let flag = match kind {
                Kind::Pods => &mut synced.pods,
                Kind::ReplicaSets => &mut synced.replica_sets,
            };
            !std::mem::replace(flag, true)
        });
    }
}

// === impl Synced ===

impl Synced {
    fn is_ready(&self) -> bool {
        self.pods && self.replica_sets
    }
}
