//! Connectivity-restored signal and the background tasks around it.
//!
//! `ReconnectSignal` is the zero-payload event. The replay worker turns each
//! signal into a replay of the pending queue; the connectivity monitor fires
//! the signal whenever the collector becomes reachable again.

use crate::collector::Collector;
use crate::core::{Result, TrackerError};
use crate::tracker::StandTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Sender half of the connectivity-restored event.
#[derive(Debug, Clone)]
pub struct ReconnectSignal {
    tx: mpsc::UnboundedSender<()>,
}

/// Receiver half; bursts of signals collapse into one wake-up.
#[derive(Debug)]
pub struct ReconnectEvents {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ReconnectSignal {
    pub fn channel() -> (Self, ReconnectEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, ReconnectEvents { rx })
    }

    /// Fires the event. Returns `false` once the receiving side is gone.
    pub fn notify(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

impl ReconnectEvents {
    /// Waits for the next signal, swallowing any already queued behind it.
    pub async fn next(&mut self) -> Option<()> {
        self.rx.recv().await?;
        while self.rx.try_recv().is_ok() {}
        Some(())
    }
}

/// Handle to a spawned background loop.
pub struct BackgroundTask {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| TrackerError::Storage(format!("{} join: {}", self.name, err)))?;
        }
        Ok(())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the loop that replays the pending queue on every reconnect signal.
///
/// The loop ends when stopped or when every `ReconnectSignal` was dropped.
pub fn spawn_replay_worker(
    tracker: Arc<Mutex<StandTracker>>,
    mut events: ReconnectEvents,
) -> BackgroundTask {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                signal = events.next() => {
                    if signal.is_none() {
                        break;
                    }
                    let mut guard = tracker.lock().await;
                    match guard.on_reconnect().await {
                        Ok(summary) => {
                            event!(
                                Level::DEBUG,
                                delivered = summary.delivered,
                                failed = summary.failed,
                                deferred = summary.deferred,
                                "reconnect replay finished"
                            );
                        }
                        Err(err) => {
                            event!(Level::WARN, error = %err, "reconnect replay failed");
                        }
                    }
                }
            }
        }
    });

    BackgroundTask {
        name: "replay worker",
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

/// Spawns a probe loop that fires `signal` on every offline to online
/// transition of the collector. The collector is assumed offline at start,
/// so the first successful probe also fires.
pub fn spawn_connectivity_monitor(
    collector: Arc<dyn Collector>,
    signal: ReconnectSignal,
    interval: Duration,
) -> BackgroundTask {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let interval = interval.max(Duration::from_millis(10));

    let join_handle = tokio::spawn(async move {
        let mut was_online = false;
        loop {
            let online = collector.probe().await;
            if online && !was_online {
                event!(Level::INFO, "collector reachable again");
                if !signal.notify() {
                    break;
                }
            } else if !online && was_online {
                event!(Level::INFO, "collector unreachable");
            }
            was_online = online;

            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {}
            }
        }
    });

    BackgroundTask {
        name: "connectivity monitor",
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::InMemoryCollector;

    #[tokio::test]
    async fn test_burst_of_signals_collapses() {
        let (signal, mut events) = ReconnectSignal::channel();
        assert!(signal.notify());
        assert!(signal.notify());
        assert!(signal.notify());

        assert_eq!(events.next().await, Some(()));
        drop(signal);
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_monitor_fires_on_each_recovery() {
        let collector = InMemoryCollector::new();
        collector.set_online(false);
        let (signal, mut events) = ReconnectSignal::channel();
        let monitor = spawn_connectivity_monitor(
            Arc::new(collector.clone()),
            signal,
            Duration::from_millis(10),
        );

        sleep(Duration::from_millis(40)).await;
        collector.set_online(true);
        tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("first recovery")
            .unwrap();

        collector.set_online(false);
        sleep(Duration::from_millis(40)).await;
        collector.set_online(true);
        tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("second recovery")
            .unwrap();

        monitor.stop().await.unwrap();
    }
}
