use std::{fmt, sync::Arc};

/// Identifies a replica group by its `ReplicaSet` UID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(Arc<str>);

/// Identifies a pod by its UID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodUid(Arc<str>);

// === impl GroupId ===

impl From<&str> for GroupId {
    fn from(uid: &str) -> Self {
        Self(uid.into())
    }
}

impl From<String> for GroupId {
    fn from(uid: String) -> Self {
        Self(uid.into())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl PodUid ===

impl From<&str> for PodUid {
    fn from(uid: &str) -> Self {
        Self(uid.into())
    }
}

impl From<String> for PodUid {
    fn from(uid: String) -> Self {
        Self(uid.into())
    }
}

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
