#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod affinity;
pub mod owner;

pub use k8s_openapi::{
    api::{
        self,
        admissionregistration::v1::{
            MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
            WebhookClientConfig,
        },
        apps::v1::{Deployment, ReplicaSet},
        core::v1::{
            Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
            PodSpec, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement, OwnerReference},
        util::intstr::IntOrString,
    },
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client, Resource,
};
