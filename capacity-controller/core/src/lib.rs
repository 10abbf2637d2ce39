#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Node-pool allocation types shared by the capacity controller crates.
//!
//! A replica group (a `ReplicaSet`) should keep exactly one member on a
//! guaranteed `on-demand` node so that the workload survives a wave of spot
//! reclamation; every other member is steered onto the cheaper `spot` pool.

mod id;

pub use self::id::{GroupId, PodUid};
use std::{fmt, str::FromStr};

/// The node label whose value names a node's capacity type.
pub const CAPACITY_LABEL: &str = "node.kubernetes.io/capacity";

/// The node-selector operator used for capacity requirements.
pub const OPERATOR_IN: &str = "In";

/// A class of nodes a pod may be steered onto.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodePool {
    OnDemand,
    Spot,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown node pool: {0}")]
pub struct InvalidNodePool(String);

// === impl NodePool ===

impl NodePool {
    /// Chooses the pool for a new member of a group, given the pools currently
    /// held by its known members.
    ///
    /// The first member to arrive without a sibling on `on-demand` takes it;
    /// everyone else lands on `spot`.
    pub fn allocate(members: impl IntoIterator<Item = Option<NodePool>>) -> Self {
        if members.into_iter().any(|p| p == Some(Self::OnDemand)) {
            Self::Spot
        } else {
            Self::OnDemand
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Spot => "spot",
        }
    }
}

impl fmt::Display for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodePool {
    type Err = InvalidNodePool;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-demand" => Ok(Self::OnDemand),
            "spot" => Ok(Self::Spot),
            s => Err(InvalidNodePool(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_member_is_on_demand() {
        assert_eq!(NodePool::allocate(std::iter::empty()), NodePool::OnDemand);
        assert_eq!(NodePool::allocate([None, None]), NodePool::OnDemand);
    }

    #[test]
    fn spot_members_do_not_hold_on_demand() {
        assert_eq!(
            NodePool::allocate([Some(NodePool::Spot), None]),
            NodePool::OnDemand
        );
    }

    #[test]
    fn later_members_are_spot() {
        assert_eq!(
            NodePool::allocate([Some(NodePool::Spot), Some(NodePool::OnDemand)]),
            NodePool::Spot
        );
    }

    #[test]
    fn parses_label_values() {
        assert_eq!("on-demand".parse::<NodePool>().unwrap(), NodePool::OnDemand);
        assert_eq!("spot".parse::<NodePool>().unwrap(), NodePool::Spot);
        assert!("reserved".parse::<NodePool>().is_err());
        assert_eq!(NodePool::Spot.to_string(), "spot");
    }
}
