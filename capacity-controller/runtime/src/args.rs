use crate::{
    admission::Admission,
    certs,
    decision::Engine,
    index,
    k8s,
    metrics::AdmissionMetrics,
    register::{self, FailurePolicy, Registration},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use tokio::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "capacity-controller",
    about = "Steers ReplicaSet pods between on-demand and spot capacity"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "capacity_controller=info,warn",
        env = "CAPACITY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// The admission server's TLS key and certificates. When
    /// `--self-signed-certs` is set, these should name the files written to
    /// `--cert-dir`.
    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The HTTP path on which admission reviews are served.
    #[clap(long, default_value = "/mutate")]
    mutate_path: String,

    /// The API server's timeout for calls to this webhook. Decisions must be
    /// reached within 80% of it.
    #[clap(long, default_value = "10", value_parser = clap::value_parser!(u8).range(1..=30))]
    webhook_timeout_seconds: u8,

    /// How long an admitted pod holds its pool before the pod watch reports it.
    #[clap(long, default_value = "60")]
    provisional_ttl_secs: u64,

    /// Generates a CA and serving certificate at startup, writing them to
    /// `--cert-dir`.
    #[clap(long)]
    self_signed_certs: bool,

    #[clap(long, default_value = "/etc/webhook/certs")]
    cert_dir: PathBuf,

    /// Disables applying the webhook's Service and
    /// MutatingWebhookConfiguration.
    #[clap(long)]
    no_self_register: bool,

    #[clap(long, default_value = "capacity-controller")]
    service_name: String,

    #[clap(long, default_value = "capacity-controller", env = "POD_NAMESPACE")]
    service_namespace: String,

    /// Selects the controller's pods, e.g. `app=capacity-controller`.
    #[clap(long, default_value = "app=capacity-controller")]
    service_selector: String,

    #[clap(long, default_value = "443")]
    service_port: u16,

    /// The name of the container port that serves admission reviews.
    #[clap(long, default_value = "admission-api")]
    target_port_name: String,

    #[clap(long, default_value = "capacity-controller")]
    webhook_config_name: String,

    #[clap(long, default_value = "pods.capacity-controller.io")]
    webhook_name: String,

    /// Only pods in namespaces carrying this label are admitted.
    #[clap(long, default_value = "capacity-controller.io/enabled")]
    namespace_label: String,

    #[clap(long, default_value = "Fail")]
    failure_policy: FailurePolicy,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            mutate_path,
            webhook_timeout_seconds,
            provisional_ttl_secs,
            self_signed_certs,
            cert_dir,
            no_self_register,
            service_name,
            service_namespace,
            service_selector,
            service_port,
            target_port_name,
            webhook_config_name,
            webhook_name,
            namespace_label,
            failure_policy,
        } = self;

        // The serving certificate must exist before the server is built.
        let ca_bundle = if self_signed_certs {
            Some(certs::write(&service_name, &service_namespace, &cert_dir)?)
        } else {
            None
        };

        let registration = if no_self_register {
            None
        } else {
            Some(Registration {
                selector: register::parse_selector(&service_selector)?,
                service_name,
                service_namespace,
                service_port: service_port.into(),
                target_port: target_port_name,
                config_name: webhook_config_name,
                webhook_name,
                path: mutate_path.clone(),
                namespace_label,
                failure_policy,
                timeout_seconds: webhook_timeout_seconds.into(),
                ca_bundle,
            })
        };

        let cache = index::Cache::shared(Duration::from_secs(provisional_ttl_secs));

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("capacity_index"), cache.clone());
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let (readiness, pods_synced, replica_sets_synced) = index::ingest::readiness();

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            index::ingest::pods(cache.clone(), pods, pods_synced).instrument(info_span!("pods")),
        );

        let replica_sets = runtime.watch_all::<k8s::ReplicaSet>(watcher::Config::default());
        tokio::spawn(
            index::ingest::replica_sets(cache.clone(), replica_sets, replica_sets_synced)
                .instrument(info_span!("replicasets")),
        );

        if let Some(registration) = registration {
            let client = runtime.client();
            let readiness = readiness.clone();
            tokio::spawn(
                async move {
                    if !readiness.ready().await {
                        warn!("Watches stopped before syncing; not registering");
                        return;
                    }
                    match registration.apply(client).await {
                        Ok(()) => info!("Registered admission webhook"),
                        Err(error) => error!(%error, "Failed to register admission webhook"),
                    }
                }
                .instrument(info_span!("register")),
            );
        }

        let deadline = Duration::from_secs(webhook_timeout_seconds.into()).mul_f64(0.8);
        let admission = Admission::new(
            Engine::new(cache),
            readiness,
            mutate_path,
            deadline,
            admission_metrics,
        );
        let runtime = runtime.spawn_server(admission);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
