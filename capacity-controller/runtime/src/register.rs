//! Registers the admission webhook with the API server.

use crate::k8s::{self, ObjectMeta};
use anyhow::{bail, Result};
use kube::api::PatchParams;
use std::{collections::BTreeMap, str::FromStr};
use tracing::info;

const FIELD_MANAGER: &str = "capacity-controller";

/// Describes the `Service` and `MutatingWebhookConfiguration` that route pod
/// creations to this controller.
#[derive(Clone, Debug)]
pub struct Registration {
    pub service_name: String,
    pub service_namespace: String,
    pub service_port: i32,
    pub selector: BTreeMap<String, String>,
    pub target_port: String,

    pub config_name: String,
    pub webhook_name: String,
    pub path: String,
    pub namespace_label: String,
    pub failure_policy: FailurePolicy,
    pub timeout_seconds: i32,

    /// The PEM-encoded CA that signed the serving certificate, when the
    /// certificate is self-signed.
    pub ca_bundle: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    Fail,
    Ignore,
}

// === impl Registration ===

impl Registration {
    /// Creates or updates both objects with server-side apply.
    pub async fn apply(&self, client: k8s::Client) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let api = k8s::Api::<k8s::Service>::namespaced(client.clone(), &self.service_namespace);
        api.patch(&self.service_name, &params, &k8s::Patch::Apply(self.service()))
            .await?;
        info!(ns = %self.service_namespace, name = %self.service_name, "Applied Service");

        let api = k8s::Api::<k8s::MutatingWebhookConfiguration>::all(client);
        api.patch(
            &self.config_name,
            &params,
            &k8s::Patch::Apply(self.webhook_configuration()),
        )
        .await?;
        info!(name = %self.config_name, "Applied MutatingWebhookConfiguration");
        Ok(())
    }

    pub fn service(&self) -> k8s::Service {
        k8s::Service {
            metadata: ObjectMeta {
                name: Some(self.service_name.clone()),
                namespace: Some(self.service_namespace.clone()),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                selector: Some(self.selector.clone()),
                ports: Some(vec![k8s::ServicePort {
                    name: Some("https".to_string()),
                    port: self.service_port,
                    target_port: Some(k8s::IntOrString::String(self.target_port.clone())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn webhook_configuration(&self) -> k8s::MutatingWebhookConfiguration {
        let webhook = k8s::MutatingWebhook {
            name: self.webhook_name.clone(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: k8s::WebhookClientConfig {
                ca_bundle: self
                    .ca_bundle
                    .as_ref()
                    .map(|pem| k8s::ByteString(pem.as_bytes().to_vec())),
                service: Some(k8s::ServiceReference {
                    name: self.service_name.clone(),
                    namespace: self.service_namespace.clone(),
                    path: Some(self.path.clone()),
                    port: Some(self.service_port),
                }),
                url: None,
            },
            rules: Some(vec![k8s::RuleWithOperations {
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(vec!["CREATE".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                ..Default::default()
            }]),
            namespace_selector: Some(k8s::LabelSelector {
                match_expressions: Some(vec![k8s::LabelSelectorRequirement {
                    key: self.namespace_label.clone(),
                    operator: "Exists".to_string(),
                    values: None,
                }]),
                ..Default::default()
            }),
            failure_policy: Some(self.failure_policy.as_str().to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(self.timeout_seconds),
            ..Default::default()
        };

        k8s::MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(self.config_name.clone()),
                ..Default::default()
            },
            webhooks: Some(vec![webhook]),
        }
    }
}

/// Parses a `key=value` service selector.
pub fn parse_selector(s: &str) -> Result<BTreeMap<String, String>> {
    s.split(',')
        .filter(|kv| !kv.trim().is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => bail!("invalid selector: {kv:?}"),
        })
        .collect()
}

// === impl FailurePolicy ===

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "Fail",
            Self::Ignore => "Ignore",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            s if s.eq_ignore_ascii_case("fail") => Ok(Self::Fail),
            s if s.eq_ignore_ascii_case("ignore") => Ok(Self::Ignore),
            s => bail!("invalid failure policy: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registration() -> Registration {
        Registration {
            service_name: "capacity-controller".to_string(),
            service_namespace: "kube-system".to_string(),
            service_port: 443,
            selector: btreemap! { "app".to_string() => "capacity-controller".to_string() },
            target_port: "admission-api".to_string(),
            config_name: "capacity-controller".to_string(),
            webhook_name: "pods.capacity-controller.io".to_string(),
            path: "/mutate".to_string(),
            namespace_label: "capacity-controller.io/enabled".to_string(),
            failure_policy: FailurePolicy::Ignore,
            timeout_seconds: 10,
            ca_bundle: Some("CA".to_string()),
        }
    }

    #[test]
    fn service() {
        assert_eq!(
            serde_json::to_value(registration().service()).unwrap(),
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {
                    "name": "capacity-controller",
                    "namespace": "kube-system",
                },
                "spec": {
                    "ports": [{
                        "name": "https",
                        "port": 443,
                        "protocol": "TCP",
                        "targetPort": "admission-api",
                    }],
                    "selector": { "app": "capacity-controller" },
                },
            })
        );
    }

    #[test]
    fn webhook_configuration() {
        assert_eq!(
            serde_json::to_value(registration().webhook_configuration()).unwrap(),
            json!({
                "apiVersion": "admissionregistration.k8s.io/v1",
                "kind": "MutatingWebhookConfiguration",
                "metadata": { "name": "capacity-controller" },
                "webhooks": [{
                    "admissionReviewVersions": ["v1"],
                    "clientConfig": {
                        // base64("CA")
                        "caBundle": "Q0E=",
                        "service": {
                            "name": "capacity-controller",
                            "namespace": "kube-system",
                            "path": "/mutate",
                            "port": 443,
                        },
                    },
                    "failurePolicy": "Ignore",
                    "name": "pods.capacity-controller.io",
                    "namespaceSelector": {
                        "matchExpressions": [{
                            "key": "capacity-controller.io/enabled",
                            "operator": "Exists",
                        }],
                    },
                    "rules": [{
                        "apiGroups": [""],
                        "apiVersions": ["v1"],
                        "operations": ["CREATE"],
                        "resources": ["pods"],
                    }],
                    "sideEffects": "None",
                    "timeoutSeconds": 10,
                }],
            })
        );
    }

    #[test]
    fn omits_ca_bundle_for_provided_certs() {
        let reg = Registration {
            ca_bundle: None,
            ..registration()
        };
        let config = reg.webhook_configuration();
        let webhooks = config.webhooks.unwrap();
        assert!(webhooks[0].client_config.ca_bundle.is_none());
    }

    #[test]
    fn parses_selectors() {
        assert_eq!(
            parse_selector("app=web, tier = api").unwrap(),
            btreemap! {
                "app".to_string() => "web".to_string(),
                "tier".to_string() => "api".to_string(),
            }
        );
        assert!(parse_selector("app").is_err());
        assert!(parse_selector("=web").is_err());
    }

    #[test]
    fn parses_failure_policies() {
        assert_eq!("Fail".parse::<FailurePolicy>().unwrap(), FailurePolicy::Fail);
        assert_eq!("ignore".parse::<FailurePolicy>().unwrap(), FailurePolicy::Ignore);
        assert!("Retry".parse::<FailurePolicy>().is_err());
    }
}
