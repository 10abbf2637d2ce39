//! Classifies objects by their position in the Deployment → ReplicaSet → Pod
//! ownership hierarchy.

use crate::{Deployment, ObjectMeta, OwnerReference, ReplicaSet, Resource};
use capacity_controller_core::GroupId;

/// Returns the owner reference that controls an object.
///
/// Controllers set `controller: true` on the reference they manage through.
/// When no reference is flagged, the first one is used.
pub fn controller_ref(meta: &ObjectMeta) -> Option<&OwnerReference> {
    let refs = meta.owner_references.as_deref()?;
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}

/// Returns true if the reference points at a `K` of the same API version.
pub fn refers_to<K>(owner: &OwnerReference) -> bool
where
    K: Resource<DynamicType = ()>,
{
    owner.api_version == K::api_version(&()) && owner.kind == K::kind(&())
}

/// Returns the replica group a pod belongs to, if it is controlled by a
/// `ReplicaSet`.
pub fn pod_group(meta: &ObjectMeta) -> Option<GroupId> {
    controller_ref(meta)
        .filter(|owner| refers_to::<ReplicaSet>(owner))
        .map(|owner| GroupId::from(owner.uid.as_str()))
}

/// A `ReplicaSet` is eligible for capacity steering only when it is managed by
/// a `Deployment`.
pub fn replica_set_eligible(meta: &ObjectMeta) -> bool {
    controller_ref(meta).is_some_and(refers_to::<Deployment>)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(api_version: &str, kind: &str, uid: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: format!("{}-owner", kind.to_lowercase()),
            uid: uid.to_string(),
            controller,
            ..Default::default()
        }
    }

    fn meta(owners: Option<Vec<OwnerReference>>) -> ObjectMeta {
        ObjectMeta {
            name: Some("obj".to_string()),
            namespace: Some("ns-0".to_string()),
            owner_references: owners,
            ..Default::default()
        }
    }

    #[test]
    fn pods_without_owners_have_no_group() {
        assert_eq!(pod_group(&meta(None)), None);
        assert_eq!(pod_group(&meta(Some(vec![]))), None);
    }

    #[test]
    fn pods_owned_by_replica_sets() {
        let m = meta(Some(vec![owner("apps/v1", "ReplicaSet", "rs-0", Some(true))]));
        assert_eq!(pod_group(&m), Some(GroupId::from("rs-0")));
    }

    #[test]
    fn pods_owned_by_other_controllers() {
        let m = meta(Some(vec![owner("apps/v1", "StatefulSet", "ss-0", Some(true))]));
        assert_eq!(pod_group(&m), None);

        let m = meta(Some(vec![owner("batch/v1", "Job", "job-0", Some(true))]));
        assert_eq!(pod_group(&m), None);

        // Same kind, different API group.
        let m = meta(Some(vec![owner("extensions/v1beta1", "ReplicaSet", "rs-0", None)]));
        assert_eq!(pod_group(&m), None);
    }

    #[test]
    fn controller_reference_wins() {
        let m = meta(Some(vec![
            owner("v1", "ConfigMap", "cm-0", None),
            owner("apps/v1", "ReplicaSet", "rs-1", Some(true)),
        ]));
        assert_eq!(pod_group(&m), Some(GroupId::from("rs-1")));
    }

    #[test]
    fn replica_set_eligibility() {
        assert!(!replica_set_eligible(&meta(None)));
        assert!(replica_set_eligible(&meta(Some(vec![owner(
            "apps/v1",
            "Deployment",
            "deploy-0",
            Some(true)
        )]))));
        assert!(!replica_set_eligible(&meta(Some(vec![owner(
            "argoproj.io/v1alpha1",
            "Rollout",
            "rollout-0",
            Some(true)
        )]))));
    }
}
