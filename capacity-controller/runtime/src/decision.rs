use crate::{
    core::NodePool,
    index::SharedCache,
    k8s::{self, affinity, owner},
};
use kube::core::{admission::Operation, DynamicObject};
use thiserror::Error;
use tracing::{debug, info};

pub(crate) type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;

/// Chooses the capacity pool for pods as they are admitted.
#[derive(Clone, Debug)]
pub struct Engine {
    cache: SharedCache,
}

/// The outcome of admitting a pod.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The pod is admitted unmodified.
    Skip(Skip),

    /// The pod already requires a capacity pool; it is recorded but not
    /// modified.
    Pinned(NodePool),

    /// The pod is steered onto a pool.
    Assign(NodePool),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Skip {
    /// The request does not create a pod.
    NotPodCreate,

    /// The pod is not controlled by a `ReplicaSet`.
    NoReplicaSet,

    /// The pod's `ReplicaSet` is not managed by a `Deployment`.
    Excluded,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("admission request missing 'object'")]
    MissingObject,

    #[error("failed to decode pod: {0}")]
    Decode(#[from] serde_json::Error),
}

// === impl Engine ===

impl Engine {
    pub fn new(cache: SharedCache) -> Self {
        Self { cache }
    }

    /// Decides how a pod should be scheduled, recording the pod in its replica
    /// group unless the request is a dry run.
    ///
    /// The only suspension point is acquiring the group's lock, so dropping the
    /// returned future never leaves a partial record behind.
    pub async fn decide(&self, request_uid: &str, pod: &k8s::Pod, dry_run: bool) -> Decision {
        let Some(group_id) = owner::pod_group(&pod.metadata) else {
            return Decision::Skip(Skip::NoReplicaSet);
        };

        let mut group = self.cache.lock(&group_id).await;
        if group.is_excluded() {
            debug!(group = %group_id, "Replica set is not managed by a deployment");
            return Decision::Skip(Skip::Excluded);
        }

        let decision = match affinity::required_pool(pod.spec.as_ref()) {
            Some(pool) => Decision::Pinned(pool),
            None => Decision::Assign(group.allocate()),
        };
        if let Decision::Pinned(pool) | Decision::Assign(pool) = decision {
            if dry_run {
                debug!(group = %group_id, %pool, "Dry run; not recording pod");
            } else {
                group.admit(request_uid, pool);
            }
            info!(group = %group_id, %pool, pinned = matches!(decision, Decision::Pinned(_)), "Admitted pod");
        }
        decision
    }
}

/// Extracts the pod from an admission request.
///
/// Returns `None` when the request is not the creation of a pod.
pub fn decode(req: &AdmissionRequest) -> Result<Option<k8s::Pod>, Error> {
    if !req.kind.group.is_empty()
        || !req.kind.kind.eq_ignore_ascii_case("Pod")
        || req.operation != Operation::Create
    {
        return Ok(None);
    }

    let obj = req.object.as_ref().ok_or(Error::MissingObject)?;
    let pod = serde_json::from_value(serde_json::to_value(obj)?)?;
    Ok(Some(pod))
}

// === impl Decision ===

impl Decision {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Skip(Skip::NotPodCreate) => "not_pod_create",
            Self::Skip(Skip::NoReplicaSet) => "no_replica_set",
            Self::Skip(Skip::Excluded) => "excluded",
            Self::Pinned(_) => "pinned",
            Self::Assign(_) => "assigned",
        }
    }

    pub(crate) fn pool(&self) -> Option<NodePool> {
        match self {
            Self::Pinned(pool) | Self::Assign(pool) => Some(*pool),
            Self::Skip(_) => None,
        }
    }
}
