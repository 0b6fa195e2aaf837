use std::sync::Arc;

use parley_store::{
    AtomicOutcome, Collection, Document, DocumentStore, Fields, Query, StoreError, Subscription,
    fields, to_fields,
};
use parley_types::{
    Attachment, ClientEvent, Clock, Identity, Message, NewMessage, default_color, random_color,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::HeartbeatScheduler;
use crate::presence::PresenceEngine;
use crate::reactions::{ReactionToggle, ReactionTransactor};
use crate::reconciler::Reconciler;

/// Most pinned messages shown in the pinned bar.
pub const PINNED_LIMIT: usize = 5;

const CONTROL_CAPACITY: usize = 32;

/// Commands from the session handle to its sync loop.
enum Control {
    GrowWindow(usize),
    Search {
        query: String,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Messages {
        reply: oneshot::Sender<Vec<Message>>,
    },
    Shutdown,
}

/// A signed-in chat session.
///
/// Owns the heartbeat and a background sync loop that folds message and
/// presence deliveries into [`ClientEvent`]s. Intents write straight to the
/// store; their effects come back through the subscriptions like everyone
/// else's.
pub struct ChatSession {
    identity: Identity,
    store: Arc<dyn DocumentStore>,
    config: SyncConfig,
    heartbeat: HeartbeatScheduler,
    reactions: ReactionTransactor,
    events: mpsc::UnboundedSender<ClientEvent>,
    control: mpsc::Sender<Control>,
    sync_task: JoinHandle<()>,
}

impl ChatSession {
    /// Merge the user's presence record, start the heartbeat and open both
    /// subscriptions.
    pub async fn sign_in(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        identity: Identity,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> SyncResult<Self> {
        ensure_online_presence(&*store, &*clock, &identity)
            .await
            .map_err(|source| SyncError::UserFacing {
                action: "sign in",
                source,
            })?;

        let mut heartbeat =
            HeartbeatScheduler::new(store.clone(), clock.clone(), identity.user_id, &config);
        heartbeat.start().await?;

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let sync = SyncLoop {
            reconciler: Reconciler::open(store.clone(), config.page_size),
            presence: PresenceEngine::new(identity.user_id, &config, clock),
            presence_sub: Some(store.subscribe(Query::field_equals(
                Collection::Users,
                "online",
                json!(true),
            ))),
            events: events.clone(),
            control: control_rx,
        };
        let sync_task = tokio::spawn(sync.run());

        info!(user_id = %identity.user_id, username = %identity.username, "Signed in");

        Ok(Self {
            reactions: ReactionTransactor::new(store.clone()),
            identity,
            store,
            config,
            heartbeat,
            events,
            control: control_tx,
            sync_task,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Send a text message. Blank input is ignored and returns `None`.
    pub async fn send_message(&self, text: &str, reply_to: Option<Uuid>) -> SyncResult<Option<Uuid>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        self.heartbeat.stop_typing();
        self.post(text, reply_to, None).await.map(Some)
    }

    /// Send an uploaded attachment with an optional caption.
    pub async fn send_attachment(
        &self,
        attachment: Attachment,
        caption: &str,
        reply_to: Option<Uuid>,
    ) -> SyncResult<Uuid> {
        if attachment.url.trim().is_empty() {
            return Err(SyncError::InvalidInput("attachment url must not be empty"));
        }
        self.heartbeat.stop_typing();
        self.post(caption.trim(), reply_to, Some(attachment)).await
    }

    async fn post(&self, text: &str, reply_to: Option<Uuid>, attachment: Option<Attachment>) -> SyncResult<Uuid> {
        let result = async {
            let author_color = self.author_color().await?;
            let message = NewMessage {
                author_id: self.identity.user_id,
                author_name: self.identity.username.clone(),
                author_color,
                text: text.to_string(),
                reply_to,
                deleted: false,
                pinned: false,
                attachment,
            };
            let doc = self.store.append(Collection::Messages, to_fields(&message)?).await?;
            Ok::<_, StoreError>(doc.id)
        }
        .await;

        match result {
            Ok(id) => {
                debug!(%id, "Message sent");
                Ok(id)
            }
            Err(source) => Err(self.user_facing("send message", source)),
        }
    }

    async fn author_color(&self) -> Result<String, StoreError> {
        let doc = self.store.get_once(Collection::Users, self.identity.user_id).await?;
        Ok(doc
            .and_then(|d| d.fields.get("color").and_then(|c| c.as_str()).map(str::to_string))
            .unwrap_or_else(|| default_color().to_string()))
    }

    /// Replace the text of one of our own messages. Returns whether anything
    /// was written.
    pub async fn edit_message(&self, id: Uuid, text: &str) -> SyncResult<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::InvalidInput("edited text must not be empty"));
        }
        let update = fields(json!({ "text": text }));
        self.rewrite_own(id, "edit message", &update).await
    }

    /// Tombstone one of our own messages.
    pub async fn delete_message(&self, id: Uuid) -> SyncResult<bool> {
        let update = fields(json!({ "deleted": true, "text": "" }));
        self.rewrite_own(id, "delete message", &update).await
    }

    pub async fn pin_message(&self, id: Uuid) -> SyncResult<bool> {
        self.set_pinned(id, true).await
    }

    /// Anyone may pin or unpin. Missing messages are a no-op.
    pub async fn set_pinned(&self, id: Uuid, pinned: bool) -> SyncResult<bool> {
        let written = self
            .store
            .update(Collection::Messages, id, fields(json!({ "pinned": pinned })))
            .await?;
        debug!(%id, pinned, written, "Pin updated");
        Ok(written)
    }

    pub async fn toggle_reaction(&self, id: Uuid, emoji: &str) -> SyncResult<ReactionToggle> {
        self.reactions.toggle(id, emoji, self.identity.user_id).await
    }

    /// Up to [`PINNED_LIMIT`] pinned messages, newest first.
    pub async fn pinned_messages(&self) -> SyncResult<Vec<Message>> {
        let docs = self
            .store
            .fetch(&Query::field_equals(Collection::Messages, "pinned", json!(true)))
            .await?;
        Ok(newest_pinned(&docs))
    }

    /// Load `increment` older messages. Zero uses the page size.
    pub async fn grow_page_window(&self, increment: usize) -> SyncResult<()> {
        let increment = if increment == 0 { self.config.page_size } else { increment };
        self.control
            .send(Control::GrowWindow(increment))
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Filter the local feed.
    pub async fn search(&self, query: &str) -> SyncResult<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Search {
                query: query.to_string(),
                reply,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Current contents of the local feed, oldest first.
    pub async fn messages(&self) -> SyncResult<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Messages { reply })
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    pub fn input_changed(&self) {
        self.heartbeat.input_changed();
    }

    /// Tab hidden or input abandoned.
    pub fn stop_typing(&self) {
        self.heartbeat.stop_typing();
    }

    /// Sign out: stop both timers, mark the user offline and close the
    /// subscriptions.
    pub async fn stop_session(mut self) -> SyncResult<()> {
        let _ = self.control.send(Control::Shutdown).await;
        let stopped = self.heartbeat.stop().await;
        if let Err(e) = (&mut self.sync_task).await {
            warn!("Sync loop ended abnormally: {}", e);
        }
        info!(user_id = %self.identity.user_id, "Session stopped");
        stopped.map_err(SyncError::from)
    }

    /// Authorship, tombstone and write are checked in one conditional write,
    /// so a concurrent delete can never be overwritten.
    async fn rewrite_own(&self, id: Uuid, action: &'static str, update: &Fields) -> SyncResult<bool> {
        let me = self.identity.user_id;
        let outcome = self
            .store
            .run_atomic(Collection::Messages, id, &|doc| {
                let message = doc.decode::<Message>().ok()?;
                (message.author_id == me && !message.deleted).then(|| update.clone())
            })
            .await
            .map_err(|source| self.user_facing(action, source))?;
        match outcome {
            AtomicOutcome::Committed { .. } => Ok(true),
            AtomicOutcome::Skipped => {
                debug!(%id, "Not ours or already deleted, refusing to {}", action);
                Ok(false)
            }
            AtomicOutcome::NotFound => {
                debug!(%id, "Message is gone, nothing to {}", action);
                Ok(false)
            }
        }
    }

    fn user_facing(&self, action: &'static str, source: StoreError) -> SyncError {
        warn!("Failed to {}: {}", action, source);
        let _ = self.events.send(ClientEvent::Notice {
            message: format!("Failed to {}. Please try again.", action),
        });
        SyncError::UserFacing { action, source }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.sync_task.abort();
    }
}

/// Merge the presence record on sign-in, keeping any colour already assigned.
async fn ensure_online_presence(
    store: &dyn DocumentStore,
    clock: &dyn Clock,
    identity: &Identity,
) -> Result<(), StoreError> {
    let existing = store.get_once(Collection::Users, identity.user_id).await?;
    let color = existing
        .as_ref()
        .and_then(|d| d.fields.get("color").and_then(|c| c.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| random_color().to_string());

    store
        .write_merge(
            Collection::Users,
            identity.user_id,
            fields(json!({
                "id": identity.user_id,
                "username": identity.username,
                "color": color,
                "online": true,
                "last_seen": clock.now(),
            })),
        )
        .await
}

fn newest_pinned(docs: &[Document]) -> Vec<Message> {
    let mut pinned: Vec<Message> = docs
        .iter()
        .filter_map(|doc| doc.decode::<Message>().ok())
        .filter(|m| m.pinned && !m.deleted)
        .collect();
    pinned.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
    pinned.truncate(PINNED_LIMIT);
    pinned
}

/// Single consumer of both subscriptions. Runs until shutdown.
struct SyncLoop {
    reconciler: Reconciler,
    presence: PresenceEngine,
    presence_sub: Option<Subscription>,
    events: mpsc::UnboundedSender<ClientEvent>,
    control: mpsc::Receiver<Control>,
}

impl SyncLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.control.recv() => match cmd {
                    Some(Control::GrowWindow(increment)) => {
                        self.reconciler.grow_window(increment).await;
                    }
                    Some(Control::Search { query, reply }) => {
                        let _ = reply.send(self.reconciler.feed().search(&query));
                    }
                    Some(Control::Messages { reply }) => {
                        let _ = reply.send(self.reconciler.feed().messages().to_vec());
                    }
                    Some(Control::Shutdown) | None => break,
                },
                delivery = self.reconciler.next_delivery() => {
                    for update in self.reconciler.reconcile(delivery) {
                        let _ = self.events.send(update.into_event());
                    }
                }
                delivery = next_presence(&mut self.presence_sub) => {
                    if let Some(view) = self.presence.apply_delivery(delivery) {
                        let _ = self.events.send(view.to_event());
                    }
                }
            }
        }

        self.reconciler.close().await;
        if let Some(sub) = self.presence_sub.take() {
            sub.cancel().await;
        }
        debug!("Sync loop ended");
    }
}

async fn next_presence(sub: &mut Option<Subscription>) -> parley_store::StoreResult<parley_store::QuerySnapshot> {
    loop {
        let Some(active) = sub.as_mut() else {
            return std::future::pending().await;
        };
        match active.next().await {
            Some(delivery) => return delivery,
            None => {
                debug!("Presence subscription closed");
                *sub = None;
            }
        }
    }
}
