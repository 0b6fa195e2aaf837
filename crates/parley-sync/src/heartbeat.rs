use std::sync::Arc;
use std::time::Duration;

use parley_store::{Collection, DocumentStore, StoreResult, fields};
use parley_types::Clock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;

/// Write `online` and a fresh `last_seen` to the user's presence document.
pub async fn mark_presence(
    store: &dyn DocumentStore,
    clock: &dyn Clock,
    user_id: Uuid,
    online: bool,
) -> StoreResult<()> {
    store
        .write_merge(
            Collection::Users,
            user_id,
            fields(json!({ "online": online, "last_seen": clock.now() })),
        )
        .await
}

/// Owns a session's liveness ping and its typing debounce.
///
/// Both timers are single-instance: starting either again replaces the
/// previous one instead of running alongside it.
pub struct HeartbeatScheduler {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    user_id: Uuid,
    interval: Duration,
    typing_idle: Duration,
    liveness: Option<Worker>,
    typing: Option<TypingHandle>,
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct TypingHandle {
    tx: mpsc::UnboundedSender<TypingSignal>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypingSignal {
    Input,
    Stop,
    Shutdown,
}

impl HeartbeatScheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        user_id: Uuid,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            clock,
            user_id,
            interval: config.heartbeat_interval,
            typing_idle: config.typing_idle,
            liveness: None,
            typing: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.liveness.is_some()
    }

    /// Mark the user online now and keep refreshing `last_seen` every
    /// interval. Any previous timer is cancelled first.
    pub async fn start(&mut self) -> StoreResult<()> {
        if let Some(old) = self.liveness.take() {
            old.stop().await;
        }
        mark_presence(&*self.store, &*self.clock, self.user_id, true).await?;

        if self.typing.is_none() {
            self.typing = Some(self.spawn_typing());
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_liveness(
            self.store.clone(),
            self.clock.clone(),
            self.user_id,
            self.interval,
            cancel.clone(),
        ));
        self.liveness = Some(Worker { cancel, task });
        info!(user_id = %self.user_id, "Presence heartbeat started");
        Ok(())
    }

    /// Cancel both timers, clear the typing flag if set, and mark the user
    /// offline.
    pub async fn stop(&mut self) -> StoreResult<()> {
        if let Some(typing) = self.typing.take() {
            let _ = typing.tx.send(TypingSignal::Shutdown);
            let _ = typing.task.await;
        }
        if let Some(liveness) = self.liveness.take() {
            liveness.stop().await;
        }
        mark_presence(&*self.store, &*self.clock, self.user_id, false).await?;
        info!(user_id = %self.user_id, "Presence heartbeat stopped");
        Ok(())
    }

    /// A change in the message input. Ignored while no session is active.
    pub fn input_changed(&self) {
        self.signal(TypingSignal::Input);
    }

    /// Explicit send or tab hidden.
    pub fn stop_typing(&self) {
        self.signal(TypingSignal::Stop);
    }

    fn signal(&self, signal: TypingSignal) {
        if let Some(typing) = &self.typing {
            let _ = typing.tx.send(signal);
        }
    }

    fn spawn_typing(&self) -> TypingHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_typing(
            self.store.clone(),
            self.clock.clone(),
            self.user_id,
            self.typing_idle,
            rx,
        ));
        TypingHandle { tx, task }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(liveness) = &self.liveness {
            liveness.cancel.cancel();
        }
        if let Some(typing) = &self.typing {
            typing.task.abort();
        }
    }
}

async fn run_liveness(
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    user_id: Uuid,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = mark_presence(&*store, &*clock, user_id, true).await {
                    warn!("Failed to update presence: {}", e);
                }
            }
        }
    }

    debug!(%user_id, "Liveness loop ended");
}

/// Debounce keystrokes into one "started" and one "stopped" write per burst.
async fn run_typing(
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    user_id: Uuid,
    idle: Duration,
    mut rx: mpsc::UnboundedReceiver<TypingSignal>,
) {
    let mut typing = false;
    let mut deadline: Option<Instant> = None;

    loop {
        let idle_timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let signal = tokio::select! {
            signal = rx.recv() => signal.unwrap_or(TypingSignal::Shutdown),
            _ = idle_timer => TypingSignal::Stop,
        };

        match signal {
            TypingSignal::Input => {
                if !typing {
                    typing = true;
                    broadcast_typing(&*store, &*clock, user_id, true).await;
                }
                deadline = Some(Instant::now() + idle);
            }
            TypingSignal::Stop | TypingSignal::Shutdown => {
                if typing {
                    typing = false;
                    broadcast_typing(&*store, &*clock, user_id, false).await;
                }
                deadline = None;
                if signal == TypingSignal::Shutdown {
                    break;
                }
            }
        }
    }
}

async fn broadcast_typing(store: &dyn DocumentStore, clock: &dyn Clock, user_id: Uuid, is_typing: bool) {
    let update = fields(json!({ "is_typing": is_typing, "last_typing": clock.now() }));
    if let Err(e) = store.write_merge(Collection::Users, user_id, update).await {
        warn!("Error broadcasting typing: {}", e);
    }
}
