use crate::SharedCache;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedCache);

pub fn register(reg: &mut Registry, cache: SharedCache) {
    reg.register_collector(Box::new(Instrumented(cache)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let stats = self.0.stats();

        let groups_encoder = encoder.encode_descriptor(
            "replica_set_index_size",
            "The number of replica sets in index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(stats.groups as i64).encode(groups_encoder)?;

        let excluded_encoder = encoder.encode_descriptor(
            "excluded_replica_set_index_size",
            "The number of replica sets in index that are not managed by a Deployment",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(stats.excluded as i64).encode(excluded_encoder)?;

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods in index",
            None,
            MetricType::Gauge,
        )?;
        for (pool, count) in [
            ("on-demand", stats.on_demand),
            ("spot", stats.spot),
            ("unassigned", stats.unassigned),
        ] {
            let labels = vec![("pool", pool)];
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            ConstGauge::new(count as i64).encode(pods_encoder)?;
        }

        let provisional_encoder = encoder.encode_descriptor(
            "provisional_pod_index_size",
            "The number of admitted pods not yet observed by the watch",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(stats.provisional as i64).encode(provisional_encoder)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cache, Update};
    use capacity_controller_core::NodePool;

    #[tokio::test]
    async fn reports_cache_sizes() {
        let cache = Cache::shared(tokio::time::Duration::from_secs(60));
        cache
            .apply(Update::PodApplied {
                group: "rs-0".into(),
                pod: "pod-0".into(),
                pool: Some(NodePool::Spot),
            })
            .await;
        cache
            .apply(Update::ReplicaSetApplied {
                group: "rs-1".into(),
                eligible: false,
            })
            .await;

        let mut reg = Registry::default();
        register(reg.sub_registry_with_prefix("capacity_index"), cache);
        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();

        assert!(text.contains("capacity_index_replica_set_index_size 2"), "{text}");
        assert!(
            text.contains("capacity_index_excluded_replica_set_index_size 1"),
            "{text}"
        );
        assert!(
            text.contains(r#"capacity_index_pod_index_size{pool="spot"} 1"#),
            "{text}"
        );
        assert!(
            text.contains(r#"capacity_index_pod_index_size{pool="on-demand"} 0"#),
            "{text}"
        );
    }
}
