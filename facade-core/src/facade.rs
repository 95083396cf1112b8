//! Facade service - composition root and lifecycle owner

use crate::broker::BrokerConnector;
use crate::config::{BrokerConfig, IntakeConfig};
use crate::error::Result;
use crate::intake::BatchIntakeLoop;
use crate::orchestrator::{BatchSource, ScoreOutcome, ScoringOrchestrator};
use crate::supervisor::{ConnectionSupervisor, SupervisorState};
use crate::types::{MachineId, Origin, ThresholdUpdate};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the shared orchestrator and the queue path's background tasks
pub struct FacadeService {
    orchestrator: Arc<ScoringOrchestrator>,
    intake: Arc<BatchIntakeLoop>,
    supervisor: Option<Arc<ConnectionSupervisor>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FacadeService {
    /// Build the service. Without a connector only the synchronous path runs.
    pub fn new(
        orchestrator: Arc<ScoringOrchestrator>,
        connector: Option<Arc<dyn BrokerConnector>>,
        intake_config: &IntakeConfig,
        broker_config: &BrokerConfig,
    ) -> Self {
        let intake = Arc::new(BatchIntakeLoop::new(orchestrator.clone(), intake_config));
        let supervisor = connector.map(|connector| {
            Arc::new(ConnectionSupervisor::new(
                connector,
                intake.clone(),
                broker_config,
            ))
        });

        Self {
            orchestrator,
            intake,
            supervisor,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Shared decision core
    pub fn orchestrator(&self) -> &Arc<ScoringOrchestrator> {
        &self.orchestrator
    }

    /// Score a synchronous request body
    pub async fn score_payload(
        &self,
        content_type: Option<String>,
        body: Bytes,
    ) -> Result<ScoreOutcome> {
        self.orchestrator
            .score(BatchSource::Payload { content_type, body }, Origin::Api)
            .await
    }

    /// Set a machine threshold and reset its counter. Returns the stored value.
    pub async fn set_threshold(&self, update: ThresholdUpdate) -> Result<f64> {
        self.orchestrator
            .store()
            .set_threshold(update.machine_id, update.threshold)
            .await?;
        Ok(update.threshold)
    }

    /// Current adaptive counter of `machine_id`
    pub async fn counter(&self, machine_id: MachineId) -> Result<i64> {
        self.orchestrator.store().counter(machine_id).await
    }

    /// Broker state, `None` when the queue path is disabled
    pub fn broker_state(&self) -> Option<SupervisorState> {
        self.supervisor.as_ref().map(|s| s.state())
    }

    /// Batches currently being processed on the queue path
    pub fn in_flight(&self) -> usize {
        self.intake.in_flight()
    }

    /// Spawn the connection supervisor. No-op without a broker or when already started.
    pub fn start(&self) {
        let Some(supervisor) = self.supervisor.clone() else {
            info!("Broker disabled, serving synchronous path only");
            return;
        };

        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return;
        }
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move { supervisor.run(cancel).await }));
        info!("Queue path started");
    }

    /// Cancel background work, wait for the supervisor to flush and for
    /// in-flight batches to finish. Returns false when the drain timed out.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        info!("Shutting down facade");
        self.cancel.cancel();

        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Supervisor task failed: {}", e);
            }
        }

        let drained = self.intake.drain(drain_timeout).await;
        info!(drained, "Facade stopped");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSession, Delivery};
    use crate::cache::ThresholdCache;
    use crate::error::Error;
    use crate::scorer::MockScorer;
    use crate::sink::InMemoryRecordSink;
    use crate::store::{InMemoryThresholdStore, ThresholdStore};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Hands out one pre-built session, then refuses
    struct OneShotConnector {
        session: Mutex<Option<BrokerSession>>,
    }

    #[async_trait]
    impl BrokerConnector for OneShotConnector {
        async fn connect(&self) -> Result<BrokerSession> {
            self.session
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Broker("connection refused".into()))
        }
    }

    fn service(
        connector: Option<Arc<dyn BrokerConnector>>,
    ) -> (FacadeService, Arc<InMemoryThresholdStore>, Arc<InMemoryRecordSink>) {
        let mut scorer = MockScorer::new();
        scorer
            .expect_score()
            .returning(|readings| Ok(vec![5.0; readings.len()]));

        let store = Arc::new(InMemoryThresholdStore::new());
        let sink = Arc::new(InMemoryRecordSink::new());
        let cache = Arc::new(ThresholdCache::new(store.clone(), Duration::from_secs(60)));
        let orchestrator = Arc::new(ScoringOrchestrator::new(
            Arc::new(scorer),
            cache,
            store.clone(),
            sink.clone(),
        ));

        let service = FacadeService::new(
            orchestrator,
            connector,
            &IntakeConfig::default(),
            &BrokerConfig::default(),
        );
        (service, store, sink)
    }

    #[tokio::test]
    async fn test_sync_path_and_threshold_reset() {
        let (service, store, _sink) = service(None);
        assert_eq!(
            service
                .set_threshold(ThresholdUpdate {
                    machine_id: 7,
                    threshold: 1.0
                })
                .await
                .unwrap(),
            1.0
        );

        let outcome = service
            .score_payload(None, Bytes::from_static(br#"[{"machine_id": 7}]"#))
            .await
            .unwrap();
        assert_eq!(outcome.final_counter, 1);

        service
            .set_threshold(ThresholdUpdate {
                machine_id: 7,
                threshold: 2.0,
            })
            .await
            .unwrap();
        assert_eq!(store.counter(7).await.unwrap(), 0);
        assert_eq!(service.broker_state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_path_persists_and_shuts_down() {
        let (tx, rx) = mpsc::channel(16);
        let (_closed_tx, closed_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(OneShotConnector {
            session: Mutex::new(Some(BrokerSession::new(rx, closed_rx))),
        });

        let (service, store, sink) = service(Some(connector as Arc<dyn BrokerConnector>));
        store.set_threshold(3, 1.0).await.unwrap();
        service.start();

        for _ in 0..2 {
            tx.send(Delivery::new(r#"{"machine_id": 3}"#)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.broker_state(), Some(SupervisorState::Connected));

        assert!(service.shutdown(Duration::from_secs(5)).await);
        assert_eq!(service.broker_state(), Some(SupervisorState::Stopped));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.origin == Origin::Queue));
        assert_eq!(store.counter(3).await.unwrap(), 2);
    }
}
