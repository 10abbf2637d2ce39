//! Builds the JSON patch that requires a pod to run on a capacity pool.
//!
//! The patch only ever adds to a pod: when the pod already carries required
//! node-affinity terms, the capacity requirement is appended to every term so
//! that whichever term the scheduler satisfies also selects the pool.

use crate::{
    core::{NodePool, CAPACITY_LABEL, OPERATOR_IN},
    k8s,
};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use serde::Serialize;

const AFFINITY: [&str; 2] = ["spec", "affinity"];
const NODE_AFFINITY: [&str; 3] = ["spec", "affinity", "nodeAffinity"];
const REQUIRED: [&str; 4] = [
    "spec",
    "affinity",
    "nodeAffinity",
    "requiredDuringSchedulingIgnoredDuringExecution",
];

pub fn build(
    pool: NodePool,
    spec: Option<&k8s::PodSpec>,
) -> Result<json_patch::Patch, serde_json::Error> {
    let node_affinity = spec
        .and_then(|s| s.affinity.as_ref())
        .map(|a| a.node_affinity.as_ref());

    let ops = match node_affinity {
        None => vec![add(
            AFFINITY,
            k8s::Affinity {
                node_affinity: Some(node_affinity_for(pool)),
                ..Default::default()
            },
        )?],

        Some(None) => vec![add(NODE_AFFINITY, node_affinity_for(pool))?],

        Some(Some(na)) => match na.required_during_scheduling_ignored_during_execution.as_ref() {
            Some(selector) if !selector.node_selector_terms.is_empty() => selector
                .node_selector_terms
                .iter()
                .enumerate()
                .map(|(i, term)| {
                    let i = i.to_string();
                    let base = REQUIRED
                        .into_iter()
                        .chain(["nodeSelectorTerms", i.as_str(), "matchExpressions"]);
                    match term.match_expressions {
                        Some(_) => add(base.chain(["-"]), requirement(pool)),
                        None => add(base, [requirement(pool)]),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => vec![add(REQUIRED, selector_for(pool))?],
        },
    };

    Ok(json_patch::Patch(ops))
}

fn add<'t>(
    path: impl IntoIterator<Item = &'t str>,
    value: impl Serialize,
) -> Result<PatchOperation, serde_json::Error> {
    Ok(PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(path),
        value: serde_json::to_value(value)?,
    }))
}

fn requirement(pool: NodePool) -> k8s::NodeSelectorRequirement {
    k8s::NodeSelectorRequirement {
        key: CAPACITY_LABEL.to_string(),
        operator: OPERATOR_IN.to_string(),
        values: Some(vec![pool.to_string()]),
    }
}

fn selector_for(pool: NodePool) -> k8s::NodeSelector {
    k8s::NodeSelector {
        node_selector_terms: vec![k8s::NodeSelectorTerm {
            match_expressions: Some(vec![requirement(pool)]),
            ..Default::default()
        }],
    }
}

fn node_affinity_for(pool: NodePool) -> k8s::NodeAffinity {
    k8s::NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(selector_for(pool)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::affinity;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn apply(spec: k8s::PodSpec, patch: &json_patch::Patch) -> k8s::PodSpec {
        let mut doc = json!({ "spec": spec });
        json_patch::patch(&mut doc, &patch.0).expect("patch must apply");
        serde_json::from_value(doc["spec"].take()).expect("spec must decode")
    }

    fn capacity_requirements(spec: &k8s::PodSpec) -> Vec<usize> {
        spec.affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
            .map(|s| {
                s.node_selector_terms
                    .iter()
                    .map(|t| {
                        t.match_expressions
                            .iter()
                            .flatten()
                            .filter(|r| r.key == CAPACITY_LABEL)
                            .count()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn term(key: &str) -> k8s::NodeSelectorTerm {
        k8s::NodeSelectorTerm {
            match_expressions: Some(vec![k8s::NodeSelectorRequirement {
                key: key.to_string(),
                operator: "Exists".to_string(),
                values: None,
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn adds_affinity() {
        let patch = build(NodePool::OnDemand, Some(&Default::default())).unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{
                "op": "add",
                "path": "/spec/affinity",
                "value": {
                    "nodeAffinity": {
                        "requiredDuringSchedulingIgnoredDuringExecution": {
                            "nodeSelectorTerms": [{
                                "matchExpressions": [{
                                    "key": "node.kubernetes.io/capacity",
                                    "operator": "In",
                                    "values": ["on-demand"],
                                }],
                            }],
                        },
                    },
                },
            }])
        );
    }

    #[test]
    fn deterministic() {
        let spec = k8s::PodSpec::default();
        let a = serde_json::to_vec(&build(NodePool::Spot, Some(&spec)).unwrap()).unwrap();
        let b = serde_json::to_vec(&build(NodePool::Spot, Some(&spec)).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn preserves_other_affinities() {
        let spec = k8s::PodSpec {
            affinity: Some(k8s::Affinity {
                pod_anti_affinity: Some(Default::default()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let patch = build(NodePool::Spot, Some(&spec)).unwrap();
        let Value::Array(ops) = serde_json::to_value(&patch).unwrap() else {
            panic!("patch must be an array");
        };
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["path"], "/spec/affinity/nodeAffinity");

        let patched = apply(spec, &patch);
        assert!(patched.affinity.as_ref().unwrap().pod_anti_affinity.is_some());
        assert_eq!(affinity::required_pool(Some(&patched)), Some(NodePool::Spot));
        assert_eq!(capacity_requirements(&patched), vec![1]);
    }

    #[test]
    fn preserves_preferred_node_affinity() {
        let spec = k8s::PodSpec {
            affinity: Some(k8s::Affinity {
                node_affinity: Some(k8s::NodeAffinity {
                    preferred_during_scheduling_ignored_during_execution: Some(vec![]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let patch = build(NodePool::OnDemand, Some(&spec)).unwrap();
        let patched = apply(spec, &patch);
        let na = patched
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .unwrap();
        assert!(na.preferred_during_scheduling_ignored_during_execution.is_some());
        assert_eq!(
            affinity::required_pool(Some(&patched)),
            Some(NodePool::OnDemand)
        );
    }

    #[test]
    fn appends_to_every_required_term() {
        let mut bare = term("zone");
        bare.match_expressions = None;
        let spec = k8s::PodSpec {
            affinity: Some(k8s::Affinity {
                node_affinity: Some(k8s::NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(k8s::NodeSelector {
                        node_selector_terms: vec![term("gpu"), bare, term("arch")],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = build(NodePool::Spot, Some(&spec)).unwrap();
        assert_eq!(patch.0.len(), 3);

        let patched = apply(spec, &patch);
        assert_eq!(capacity_requirements(&patched), vec![1, 1, 1]);
        assert_eq!(affinity::required_pool(Some(&patched)), Some(NodePool::Spot));

        let terms = &patched
            .affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms[0].match_expressions.as_ref().unwrap()[0].key, "gpu");
        assert_eq!(terms[0].match_expressions.as_ref().unwrap().len(), 2);
        assert_eq!(terms[1].match_expressions.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn narrows_either_pool_requirement() {
        let spec = k8s::PodSpec {
            affinity: Some(k8s::Affinity {
                node_affinity: Some(k8s::NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(k8s::NodeSelector {
                        node_selector_terms: vec![k8s::NodeSelectorTerm {
                            match_expressions: Some(vec![k8s::NodeSelectorRequirement {
                                key: CAPACITY_LABEL.to_string(),
                                operator: "In".to_string(),
                                values: Some(vec!["spot".to_string(), "on-demand".to_string()]),
                            }]),
                            ..Default::default()
                        }],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(affinity::required_pool(Some(&spec)), None);

        let patch = build(NodePool::OnDemand, Some(&spec)).unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap()[0]["path"],
            "/spec/affinity/nodeAffinity/requiredDuringSchedulingIgnoredDuringExecution/nodeSelectorTerms/0/matchExpressions/-"
        );
        let patched = apply(spec, &patch);
        assert_eq!(
            affinity::required_pool(Some(&patched)),
            Some(NodePool::OnDemand)
        );
    }
}
