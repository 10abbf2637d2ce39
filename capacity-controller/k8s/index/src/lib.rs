//! Capacity controller index
//!
//! The index maintains, for every `ReplicaSet` in the cluster, the set of pods it
//! owns and the capacity pool each pod was steered onto. It is fed by two
//! watches and read by the admission webhook:
//!
//! - Each `ReplicaSet` is either eligible (it is managed by a `Deployment`) or
//!   excluded from capacity steering.
//! - Each `Pod` controlled by a `ReplicaSet` is recorded with the pool named by
//!   its required node affinity, if any.
//!
//! ```text
//! [ Deployment ] <- [ ReplicaSet ] <- [ Pod ] -> [ node.kubernetes.io/capacity ]
//! ```
//!
//! Admission decisions and watch updates for a group are serialized by the
//! group's lock. Pods admitted by the webhook are recorded provisionally, keyed
//! by their admission request, until the watch reports the created pod.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
pub mod ingest;
pub mod metrics;


pub use self::{
    cache::{
        Cache, GroupGuard, PodListing, ReplicaSetListing, SharedCache, Stats, Update,
    },
    ingest::Readiness,
};
