//! Background liveness probe.
//!
//! Pings every registered node on a fixed interval so that the registry can
//! flip health either way based on the outcome. The probe never
//! changes routing - it exists so that a node that went quiet between real
//! operations is noticed, and so that a recovered node is marked healthy
//! again without waiting for traffic to hit it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{event, Level};

use super::ShardRegistry;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Pings every node once, sequentially. The fleet is small and the pings are
/// timeout-bounded, so fan-out buys nothing here.
pub async fn probe_once(registry: &ShardRegistry) -> ProbeReport {
    let mut report = ProbeReport::default();
    for addr in registry.node_addrs() {
        match registry.ping(&addr).await {
            Ok(()) => report.healthy += 1,
            Err(err) => {
                event!(
                    Level::DEBUG,
                    "liveness probe failed for node {}: {}",
                    addr,
                    err
                );
                report.unhealthy += 1;
            }
        }
    }

    report
}

pub async fn run_probe_loop(
    registry: Arc<ShardRegistry>,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = probe_once(&registry).await;
                if report.unhealthy > 0 {
                    event!(
                        Level::WARN,
                        "liveness probe: {} healthy, {} unhealthy",
                        report.healthy,
                        report.unhealthy
                    );
                }
            }
            _ = &mut shutdown => {
                event!(Level::DEBUG, "probe loop received shutdown signal");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::{probe_once, run_probe_loop, ProbeReport};
    use crate::storage::mock::{MockFactoryBuilder, MockFaults};
    use crate::storage::retry::RetryPolicy;
    use crate::storage::ShardRegistry;
    use crate::test_utils::fault::When;

    const NODE_A: &str = "127.0.0.1:7001";
    const NODE_B: &str = "127.0.0.1:7002";

    #[tokio::test]
    async fn probe_flips_health_both_ways() {
        let factory = MockFactoryBuilder::new()
            .with_ping_fault(When::Always)
            .build();
        let registry = ShardRegistry::new(
            &[NODE_A.to_string(), NODE_B.to_string()],
            20,
            RetryPolicy::default(),
            Duration::from_secs(1),
            &factory,
        )
        .await
        .unwrap();

        let report = probe_once(&registry).await;
        assert_eq!(
            report,
            ProbeReport {
                healthy: 0,
                unhealthy: 2
            }
        );
        assert_eq!(registry.healthy_node_count(), 0);

        factory.handle(NODE_A).set_faults(MockFaults::default());
        let report = probe_once(&registry).await;
        assert_eq!(
            report,
            ProbeReport {
                healthy: 1,
                unhealthy: 1
            }
        );
        assert!(registry.health_snapshot()[NODE_A]);
        assert!(!registry.health_snapshot()[NODE_B]);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_loop_detects_offline_node_and_stops_on_shutdown() {
        let factory = MockFactoryBuilder::new().build();
        let registry = Arc::new(
            ShardRegistry::new(
                &[NODE_A.to_string()],
                20,
                RetryPolicy::default(),
                Duration::from_secs(1),
                &factory,
            )
            .await
            .unwrap(),
        );

        factory
            .handle(NODE_A)
            .set_faults(MockFaults::all(When::Always));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_probe_loop(
            registry.clone(),
            Duration::from_secs(30),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.healthy_node_count(), 0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
