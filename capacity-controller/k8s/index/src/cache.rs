use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use capacity_controller_core::{GroupId, NodePool, PodUid};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time,
};
use tracing::{debug, instrument, trace};

pub type SharedCache = Arc<Cache>;

/// The pods known for each replica group, as listed by the watch.
pub type PodListing = HashMap<GroupId, HashMap<PodUid, Option<NodePool>>>;

/// The eligibility of each replica group, as listed by the watch.
pub type ReplicaSetListing = HashMap<GroupId, bool>;

/// Tracks the members of each replica group and the node pool each was
/// steered onto.
///
/// Every group is guarded by its own lock so that decisions for unrelated
/// groups never contend. The directory lock is only held to find a group's
/// lock, never while waiting on one.
#[derive(Debug)]
pub struct Cache {
    groups: RwLock<HashMap<GroupId, Arc<Mutex<Group>>>>,
    provisional_ttl: time::Duration,
}

/// The state of a single replica group.
#[derive(Debug, Default)]
pub struct Group {
    /// Set when the group has been dropped from the directory. A task that
    /// acquires a retired group must look it up again.
    retired: bool,

    /// Set when the group's `ReplicaSet` is not managed by a `Deployment`.
    excluded: bool,

    pods: HashMap<PodKey, PodRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PodKey {
    /// A pod reported by the watch.
    Watched(PodUid),

    /// A pod admitted by this controller that the watch has not yet reported.
    /// Keyed by the admission request UID since the pod has no UID yet.
    Provisional(Arc<str>),
}

#[derive(Clone, Debug)]
struct PodRecord {
    pool: Option<NodePool>,
    admitted_at: Option<time::Instant>,
}

/// Exclusive access to one replica group.
///
/// Dropping the guard releases the group's lock, removing the group from the
/// directory when it no longer holds any state.
#[derive(Debug)]
pub struct GroupGuard<'c> {
    cache: &'c Cache,
    id: GroupId,
    group: OwnedMutexGuard<Group>,
}

/// A normalized watch notification.
#[derive(Clone, Debug)]
pub enum Update {
    /// A pod was added or updated.
    PodApplied {
        group: GroupId,
        pod: PodUid,
        pool: Option<NodePool>,
    },
    PodDeleted {
        group: GroupId,
        pod: PodUid,
    },
    /// The pod watch (re)listed; the listing replaces all watched pods.
    PodsReset(PodListing),

    /// A replica set was added or updated.
    ReplicaSetApplied {
        group: GroupId,
        eligible: bool,
    },
    ReplicaSetDeleted {
        group: GroupId,
    },
    /// The replica set watch (re)listed.
    ReplicaSetsReset(ReplicaSetListing),
}

/// A point-in-time summary of the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub groups: usize,
    pub excluded: usize,
    pub on_demand: usize,
    pub spot: usize,
    pub unassigned: usize,
    pub provisional: usize,
}

// === impl Cache ===

impl Cache {
    pub fn new(provisional_ttl: time::Duration) -> Self {
        Self {
            groups: Default::default(),
            provisional_ttl,
        }
    }

    pub fn shared(provisional_ttl: time::Duration) -> SharedCache {
        Arc::new(Self::new(provisional_ttl))
    }

    /// Waits for exclusive access to a replica group, creating it if it is not
    /// yet known.
    ///
    /// Cancelling the returned future leaves the cache untouched.
    pub async fn lock(&self, id: &GroupId) -> GroupGuard<'_> {
        loop {
            let group = self.get_or_insert(id).lock_owned().await;
            if group.retired {
                trace!(group = %id, "Group retired while waiting");
                continue;
            }

            let mut guard = GroupGuard {
                cache: self,
                id: id.clone(),
                group,
            };
            guard.expire(time::Instant::now());
            return guard;
        }
    }

    /// Applies a watch notification.
    pub async fn apply(&self, update: Update) {
        match update {
            Update::PodApplied { group, pod, pool } => {
                self.lock(&group).await.apply_pod(pod, pool);
            }
            Update::PodDeleted { group, pod } => {
                self.lock(&group).await.delete_pod(&pod);
            }
            Update::PodsReset(listing) => self.reset_pods(listing).await,
            Update::ReplicaSetApplied { group, eligible } => {
                self.lock(&group).await.set_excluded(!eligible);
            }
            Update::ReplicaSetDeleted { group } => {
                self.lock(&group).await.set_excluded(false);
            }
            Update::ReplicaSetsReset(listing) => self.reset_replica_sets(listing).await,
        }
    }

    pub fn stats(&self) -> Stats {
        let groups = self.groups.read();
        let mut stats = Stats {
            groups: groups.len(),
            ..Default::default()
        };
        for group in groups.values() {
            // Groups that are busy are skipped rather than waited on.
            let Ok(group) = group.try_lock() else {
                continue;
            };
            if group.excluded {
                stats.excluded += 1;
            }
            for record in group.pods.values() {
                if record.admitted_at.is_some() {
                    stats.provisional += 1;
                }
                match record.pool {
                    Some(NodePool::OnDemand) => stats.on_demand += 1,
                    Some(NodePool::Spot) => stats.spot += 1,
                    None => stats.unassigned += 1,
                }
            }
        }
        stats
    }

    #[instrument(skip_all, fields(groups = listing.len()))]
    async fn reset_pods(&self, listing: PodListing) {
        for id in self.known_groups(listing.keys()) {
            let pods = listing.get(&id);
            let mut group = self.lock(&id).await;
            let before = group.group.pods.len();
            group.group.pods.retain(|key, _| match key {
                PodKey::Watched(uid) => pods.is_some_and(|p| p.contains_key(uid)),
                PodKey::Provisional(_) => true,
            });
            if group.group.pods.len() != before {
                debug!(group = %id, removed = before - group.group.pods.len(), "Removed stale pods");
            }
            for (uid, pool) in pods.into_iter().flatten() {
                group.apply_pod(uid.clone(), *pool);
            }
        }
    }

    #[instrument(skip_all, fields(groups = listing.len()))]
    async fn reset_replica_sets(&self, listing: ReplicaSetListing) {
        for id in self.known_groups(listing.keys()) {
            let eligible = listing.get(&id).copied().unwrap_or(true);
            self.lock(&id).await.set_excluded(!eligible);
        }
    }

    /// Returns the union of the groups in the directory and `listed`.
    fn known_groups<'l>(&self, listed: impl Iterator<Item = &'l GroupId>) -> HashSet<GroupId> {
        let mut ids = self.groups.read().keys().cloned().collect::<HashSet<_>>();
        ids.extend(listed.cloned());
        ids
    }

    fn get_or_insert(&self, id: &GroupId) -> Arc<Mutex<Group>> {
        if let Some(group) = self.groups.read().get(id) {
            return group.clone();
        }
        self.groups.write().entry(id.clone()).or_default().clone()
    }
}

// === impl GroupGuard ===

impl GroupGuard<'_> {
    /// Returns true if the group's `ReplicaSet` is known to be ineligible.
    pub fn is_excluded(&self) -> bool {
        self.group.excluded
    }

    /// Chooses the pool for a new member of this group.
    pub fn allocate(&self) -> NodePool {
        NodePool::allocate(self.group.pods.values().map(|r| r.pool))
    }

    /// Records a pod admitted by this controller.
    #[instrument(skip(self), fields(group = %self.id))]
    pub fn admit(&mut self, request_uid: &str, pool: NodePool) {
        let key = PodKey::Provisional(request_uid.into());
        let record = PodRecord {
            pool: Some(pool),
            admitted_at: Some(time::Instant::now()),
        };
        self.group.pods.insert(key, record);
        debug!("Admitted pod");
    }

    /// Records a pod reported by the watch.
    ///
    /// The first report of a pod supersedes the oldest provisional record
    /// carrying the same pool.
    pub fn apply_pod(&mut self, uid: PodUid, pool: Option<NodePool>) {
        let key = PodKey::Watched(uid);
        if let Some(record) = self.group.pods.get_mut(&key) {
            if record.pool != pool {
                debug!(group = %self.id, pod = ?key, ?pool, "Updated pod");
                record.pool = pool;
            }
            return;
        }

        if pool.is_some() {
            let confirmed = self
                .group
                .pods
                .iter()
                .filter(|(_, r)| r.pool == pool)
                .filter_map(|(k, r)| Some((k, r.admitted_at?)))
                .min_by_key(|(_, at)| *at)
                .map(|(k, _)| k.clone());
            if let Some(provisional) = confirmed {
                trace!(group = %self.id, ?provisional, "Confirmed admitted pod");
                self.group.pods.remove(&provisional);
            }
        }

        debug!(group = %self.id, pod = ?key, ?pool, "Added pod");
        self.group.pods.insert(
            key,
            PodRecord {
                pool,
                admitted_at: None,
            },
        );
    }

    pub fn delete_pod(&mut self, uid: &PodUid) -> bool {
        let removed = self
            .group
            .pods
            .remove(&PodKey::Watched(uid.clone()))
            .is_some();
        if removed {
            debug!(group = %self.id, pod = %uid, "Removed pod");
        }
        removed
    }

    pub fn set_excluded(&mut self, excluded: bool) {
        if self.group.excluded != excluded {
            debug!(group = %self.id, excluded, "Updated eligibility");
            self.group.excluded = excluded;
        }
    }

    /// Drops provisional records that the watch never confirmed.
    fn expire(&mut self, now: time::Instant) {
        let ttl = self.cache.provisional_ttl;
        self.group.pods.retain(|key, record| {
            let live = record
                .admitted_at
                .map_or(true, |at| now.saturating_duration_since(at) < ttl);
            if !live {
                debug!(pod = ?key, "Expired unconfirmed admission");
            }
            live
        });
    }

    #[cfg(test)]
    pub(crate) fn pools(&self) -> Vec<Option<NodePool>> {
        let mut pools = self.group.pods.values().map(|r| r.pool).collect::<Vec<_>>();
        pools.sort();
        pools
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if self.group.pods.is_empty() && !self.group.excluded {
            // The directory entry still points at this group: entries are only
            // removed by the holder of the group's lock.
            self.group.retired = true;
            self.cache.groups.write().remove(&self.id);
            trace!(group = %self.id, "Removed empty group");
        }
    }
}
