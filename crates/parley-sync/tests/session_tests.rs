use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley_store::{
    AtomicOutcome, Collection, Database, Document, DocumentStore, Fields, Query, SqliteStore,
    StoreResult, Subscription, fields,
};
use parley_sync::{ChatSession, ReactionToggle, SyncConfig};
use parley_types::{
    Attachment, AttachmentKind, ClientEvent, Clock, Identity, Message, SystemClock, USER_COLORS,
};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

type Events = mpsc::UnboundedReceiver<ClientEvent>;

fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()))
}

async fn sign_in(store: &Arc<SqliteStore>, name: &str, config: SyncConfig) -> (ChatSession, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let session = ChatSession::sign_in(
        store.clone(),
        clock,
        config,
        Identity::new(Uuid::new_v4(), name),
        tx,
    )
    .await
    .unwrap();
    (session, rx)
}

/// Skip events until one matches.
async fn wait_for<T>(rx: &mut Events, mut pick: impl FnMut(ClientEvent) -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_added(rx: &mut Events, text: &str) -> (usize, Message) {
    wait_for(rx, |e| match e {
        ClientEvent::MessageAdded { index, message } if message.text == text => Some((index, message)),
        _ => None,
    })
    .await
}

async fn wait_updated(rx: &mut Events, id: Uuid) -> Message {
    wait_for(rx, |e| match e {
        ClientEvent::MessageUpdated { message } if message.id == id => Some(message),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn test_sign_in_merges_presence_with_palette_color() {
    let store = store();
    let (session, _rx) = sign_in(&store, "ann", SyncConfig::default()).await;

    let doc = store
        .get_once(Collection::Users, session.identity().user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.fields.get("username"), Some(&json!("ann")));
    assert!(doc.get_bool("online"));
    let color = doc.fields.get("color").and_then(|c| c.as_str()).unwrap();
    assert!(USER_COLORS.contains(&color));

    session.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_sign_in_keeps_existing_color() {
    let store = store();
    let user_id = Uuid::new_v4();
    store
        .write_merge(Collection::Users, user_id, fields(json!({ "color": "#EC4899" })))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::sign_in(
        store.clone(),
        Arc::new(SystemClock),
        SyncConfig::default(),
        Identity::new(user_id, "ann"),
        tx,
    )
    .await
    .unwrap();

    session.send_message("colourful", None).await.unwrap();
    let (_, message) = wait_added(&mut rx, "colourful").await;
    assert_eq!(message.author_color, "#EC4899");

    session.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_send_delivers_through_subscription() {
    let store = store();
    let (ann, mut ann_rx) = sign_in(&store, "ann", SyncConfig::default()).await;
    let (bo, mut bo_rx) = sign_in(&store, "bo", SyncConfig::default()).await;

    assert_eq!(ann.send_message("   ", None).await.unwrap(), None);

    let first = ann.send_message("  hello  ", None).await.unwrap().unwrap();
    let reply = bo.send_message("hi ann", Some(first)).await.unwrap().unwrap();

    let (index, hello) = wait_added(&mut bo_rx, "hello").await;
    assert_eq!(index, 0);
    assert_eq!(hello.id, first);
    assert_eq!(hello.author_name, "ann");

    let (index, answer) = wait_added(&mut ann_rx, "hi ann").await;
    assert_eq!(index, 1);
    assert_eq!(answer.id, reply);
    assert_eq!(answer.reply_to, Some(first));

    let found = ann.search("HELLO").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(ann.search("").await.unwrap().len(), 2);

    ann.stop_session().await.unwrap();
    bo.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_attachment_message_carries_caption() {
    let store = store();
    let (session, mut rx) = sign_in(&store, "ann", SyncConfig::default()).await;

    let attachment = Attachment::new(
        AttachmentKind::from_mime("image/png"),
        "https://files.example/cat.png",
        Some("Cat.PNG".into()),
    );
    session
        .send_attachment(attachment, " look ", None)
        .await
        .unwrap();

    let (_, message) = wait_added(&mut rx, "look").await;
    let attachment = message.attachment.unwrap();
    assert_eq!(attachment.kind, AttachmentKind::Image);
    assert_eq!(attachment.ext.as_deref(), Some("png"));

    session.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_only_author_can_edit_or_delete() {
    let store = store();
    let (ann, mut ann_rx) = sign_in(&store, "ann", SyncConfig::default()).await;
    let (bo, _bo_rx) = sign_in(&store, "bo", SyncConfig::default()).await;

    let id = ann.send_message("draft", None).await.unwrap().unwrap();
    wait_added(&mut ann_rx, "draft").await;

    assert!(!bo.edit_message(id, "hijacked").await.unwrap());
    assert!(!bo.delete_message(id).await.unwrap());

    assert!(ann.edit_message(id, "final").await.unwrap());
    let edited = wait_updated(&mut ann_rx, id).await;
    assert_eq!(edited.text, "final");

    assert!(ann.delete_message(id).await.unwrap());
    let deleted = wait_updated(&mut ann_rx, id).await;
    assert!(deleted.deleted);
    assert!(deleted.text.is_empty());

    // Tombstones stay cleared.
    assert!(!ann.edit_message(id, "again").await.unwrap());
    assert!(!ann.delete_message(id).await.unwrap());
    assert!(!ann.edit_message(Uuid::new_v4(), "ghost").await.unwrap());

    ann.stop_session().await.unwrap();
    bo.stop_session().await.unwrap();
}

/// Lets another client tombstone a message right before this client's next
/// write to it lands.
struct DeleteLandsFirst {
    inner: Arc<SqliteStore>,
    armed: AtomicBool,
}

impl DeleteLandsFirst {
    async fn fire(&self, id: Uuid) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.inner
                .update(Collection::Messages, id, fields(json!({ "deleted": true, "text": "" })))
                .await
                .unwrap();
        }
    }
}

#[async_trait]
impl DocumentStore for DeleteLandsFirst {
    fn subscribe(&self, query: Query) -> Subscription {
        self.inner.subscribe(query)
    }

    async fn get_once(&self, collection: Collection, id: Uuid) -> StoreResult<Option<Document>> {
        self.inner.get_once(collection, id).await
    }

    async fn fetch(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.inner.fetch(query).await
    }

    async fn run_atomic(
        &self,
        collection: Collection,
        id: Uuid,
        update: &(dyn for<'d> Fn(&'d Document) -> Option<Fields> + Send + Sync),
    ) -> StoreResult<AtomicOutcome> {
        self.fire(id).await;
        self.inner.run_atomic(collection, id, update).await
    }

    async fn write_merge(&self, collection: Collection, id: Uuid, fields: Fields) -> StoreResult<()> {
        self.inner.write_merge(collection, id, fields).await
    }

    async fn update(&self, collection: Collection, id: Uuid, fields: Fields) -> StoreResult<bool> {
        self.fire(id).await;
        self.inner.update(collection, id, fields).await
    }

    async fn append(&self, collection: Collection, fields: Fields) -> StoreResult<Document> {
        self.inner.append(collection, fields).await
    }
}

#[tokio::test]
async fn test_edit_racing_a_delete_never_resurrects_text() {
    let inner = store();
    let racy = Arc::new(DeleteLandsFirst {
        inner: inner.clone(),
        armed: AtomicBool::new(false),
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ann = ChatSession::sign_in(
        racy.clone(),
        Arc::new(SystemClock),
        SyncConfig::default(),
        Identity::new(Uuid::new_v4(), "ann"),
        tx,
    )
    .await
    .unwrap();

    let id = ann.send_message("secret", None).await.unwrap().unwrap();
    wait_added(&mut rx, "secret").await;

    racy.armed.store(true, Ordering::SeqCst);
    assert!(!ann.edit_message(id, "resurrected").await.unwrap());

    let doc = inner.get_once(Collection::Messages, id).await.unwrap().unwrap();
    assert!(doc.get_bool("deleted"));
    assert_eq!(doc.fields.get("text"), Some(&json!("")));

    let seen = wait_updated(&mut rx, id).await;
    assert!(seen.deleted);
    assert!(seen.text.is_empty());

    ann.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_pinned_messages_newest_first_and_limited() {
    let store = store();
    let (session, _rx) = sign_in(&store, "ann", SyncConfig::default()).await;

    let mut ids = Vec::new();
    for i in 0..7 {
        let id = session.send_message(&format!("note {}", i), None).await.unwrap().unwrap();
        assert!(session.pin_message(id).await.unwrap());
        ids.push(id);
    }
    session.delete_message(ids[6]).await.unwrap();
    assert!(session.set_pinned(ids[5], false).await.unwrap());
    assert!(!session.pin_message(Uuid::new_v4()).await.unwrap());

    let pinned: Vec<Uuid> = session
        .pinned_messages()
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(pinned, vec![ids[4], ids[3], ids[2], ids[1], ids[0]]);

    session.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_reaction_reaches_the_feed() {
    let store = store();
    let (session, mut rx) = sign_in(&store, "ann", SyncConfig::default()).await;

    let id = session.send_message("vote", None).await.unwrap().unwrap();
    wait_added(&mut rx, "vote").await;

    assert_eq!(session.toggle_reaction(id, "🎉").await.unwrap(), ReactionToggle::Added);
    let updated = wait_updated(&mut rx, id).await;
    assert_eq!(updated.reactions.count("🎉"), 1);

    session.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_growing_the_window_prepends_older_messages() {
    let store = store();
    for i in 0..12 {
        store
            .append(
                Collection::Messages,
                fields(json!({
                    "author_id": Uuid::new_v4(),
                    "author_name": "seed",
                    "author_color": USER_COLORS[1],
                    "text": format!("seed {}", i),
                })),
            )
            .await
            .unwrap();
    }

    let config = SyncConfig {
        page_size: 5,
        ..SyncConfig::default()
    };
    let (session, mut rx) = sign_in(&store, "ann", config).await;
    wait_added(&mut rx, "seed 11").await;
    assert_eq!(session.messages().await.unwrap().len(), 5);

    session.grow_page_window(5).await.unwrap();
    let (index, _) = wait_added(&mut rx, "seed 2").await;
    assert_eq!(index, 0);

    let held = session.messages().await.unwrap();
    let texts: Vec<String> = held.iter().map(|m| m.text.clone()).collect();
    let expected: Vec<String> = (2..12).map(|i| format!("seed {}", i)).collect();
    assert_eq!(texts, expected);

    session.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_presence_counts_peers_and_shows_typing() {
    let store = store();
    let (ann, mut ann_rx) = sign_in(&store, "ann", SyncConfig::default()).await;
    let (bo, _bo_rx) = sign_in(&store, "bo", SyncConfig::default()).await;

    wait_for(&mut ann_rx, |e| match e {
        ClientEvent::PresenceChanged { online_count: 2, .. } => Some(()),
        _ => None,
    })
    .await;

    bo.input_changed();
    let indicator = wait_for(&mut ann_rx, |e| match e {
        ClientEvent::PresenceChanged { indicator: Some(text), .. } => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(indicator, "bo is typing...");

    bo.stop_session().await.unwrap();
    wait_for(&mut ann_rx, |e| match e {
        ClientEvent::PresenceChanged {
            online_count: 1,
            indicator: None,
            ..
        } => Some(()),
        _ => None,
    })
    .await;

    ann.stop_session().await.unwrap();
}

#[tokio::test]
async fn test_stop_session_marks_user_offline() {
    let store = store();
    let (session, _rx) = sign_in(&store, "ann", SyncConfig::default()).await;
    let user_id = session.identity().user_id;

    session.stop_session().await.unwrap();

    let doc = store.get_once(Collection::Users, user_id).await.unwrap().unwrap();
    assert!(!doc.get_bool("online"));
    assert!(!doc.get_bool("is_typing"));
}
