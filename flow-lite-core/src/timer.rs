//! Background sweep of expired timer rows.

use crate::engine::FlowEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default sweep interval.
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_secs(5);

/// A single background task that periodically drives the engine past
/// expired timer nodes. Each fire runs under the engine's per-instance
/// serialisation, and a fired or cancelled timer is tombstoned, so a timer
/// advances its instance at most once no matter how sweeps interleave.
pub struct TimerScheduler {
    handle: JoinHandle<()>,
}

impl TimerScheduler {
    pub fn spawn(engine: Arc<FlowEngine>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fired = engine.sweep_timers().await;
                if fired > 0 {
                    tracing::debug!(fired, "timer sweep advanced instances");
                }
            }
        });
        Self { handle }
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::RhaiEvaluator;
    use crate::store_memory::MemoryStore;
    use crate::types::{VarBag, WorkFilter};

    const INSTANT_TIMER_BPMN: &str = r#"
<definitions>
  <process id="instant" name="Instant timer">
    <startEvent id="node_start"/>
    <intermediateCatchEvent id="node_wait">
      <timerEventDefinition><timeDuration>0</timeDuration></timerEventDefinition>
    </intermediateCatchEvent>
    <userTask id="node_review"><extensionElements><assignment expression='["T100"]'/></extensionElements></userTask>
    <endEvent id="node_end"/>
    <sequenceFlow id="f1" sourceRef="node_start" targetRef="node_wait"/>
    <sequenceFlow id="f2" sourceRef="node_wait" targetRef="node_review"/>
    <sequenceFlow id="f3" sourceRef="node_review" targetRef="node_end"/>
  </process>
</definitions>"#;

    #[tokio::test]
    async fn scheduler_advances_expired_timers() {
        let engine = Arc::new(FlowEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RhaiEvaluator::new()),
        ));
        engine.load_definition(INSTANT_TIMER_BPMN).await.unwrap();
        engine
            .start_flow("instant", "node_start", "T001", VarBag::new())
            .await
            .unwrap();

        let scheduler = TimerScheduler::spawn(engine.clone(), Duration::from_millis(10));

        let mut advanced = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let todos = engine
                .query_todo("T100", &WorkFilter::default())
                .await
                .unwrap();
            if !todos.is_empty() {
                advanced = true;
                break;
            }
        }
        scheduler.shutdown();
        assert!(advanced, "timer should have advanced the instance");
    }
}
