//! Reads capacity requirements from pod scheduling constraints.

use crate::{NodeSelectorTerm, PodSpec};
use capacity_controller_core::{NodePool, CAPACITY_LABEL, OPERATOR_IN};

/// Returns the capacity pool a pod is required to schedule onto, if its
/// required node affinity admits exactly one pool.
///
/// Requirements within a term are ANDed and terms are ORed. A term that does
/// not constrain the capacity label admits every pool.
pub fn required_pool(spec: Option<&PodSpec>) -> Option<NodePool> {
    let selector = spec
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| {
            na.required_during_scheduling_ignored_during_execution
                .as_ref()
        })?;

    let admitted = selector
        .node_selector_terms
        .iter()
        .map(term_pools)
        .fold(Pools::NONE, Pools::union);
    admitted.single()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Pools {
    on_demand: bool,
    spot: bool,
}

fn term_pools(term: &NodeSelectorTerm) -> Pools {
    term.match_expressions
        .iter()
        .flatten()
        .filter(|req| req.key == CAPACITY_LABEL && req.operator == OPERATOR_IN)
        .map(|req| {
            let values = req.values.iter().flatten();
            values.fold(Pools::NONE, |pools, v| match v.parse::<NodePool>() {
                Ok(NodePool::OnDemand) => Pools {
                    on_demand: true,
                    ..pools
                },
                Ok(NodePool::Spot) => Pools { spot: true, ..pools },
                Err(_) => pools,
            })
        })
        .fold(Pools::ALL, Pools::intersect)
}

// === impl Pools ===

impl Pools {
    const NONE: Self = Self {
        on_demand: false,
        spot: false,
    };
    const ALL: Self = Self {
        on_demand: true,
        spot: true,
    };

    fn union(self, other: Self) -> Self {
        Self {
            on_demand: self.on_demand || other.on_demand,
            spot: self.spot || other.spot,
        }
    }

    fn intersect(self, other: Self) -> Self {
        Self {
            on_demand: self.on_demand && other.on_demand,
            spot: self.spot && other.spot,
        }
    }

    fn single(self) -> Option<NodePool> {
        match (self.on_demand, self.spot) {
            (true, false) => Some(NodePool::OnDemand),
            (false, true) => Some(NodePool::Spot),
            _ => None,
        }
    }
}
