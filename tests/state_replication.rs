use std::sync::Arc;
use std::time::{Duration, Instant};

use mfe_sync::state::STATE_CHANNEL;
use mfe_sync::storage::KeyValueStore;
use mfe_sync::{
    Bridge, BridgeConfig, GlobalAction, GlobalStateStore, HostPrimitives, LocalBroadcastHub, MemoryStore,
    ModalContext, NotificationKind, StoreConfig, SqliteStore, Theme, ThemeMode, TransportKind, User,
};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

async fn eventually(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < WAIT, "condition not met within {WAIT:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn relayed_pair() -> (Bridge, Bridge) {
    let hub = LocalBroadcastHub::new();
    let host = HostPrimitives::none().with_broadcast(Arc::new(hub));
    let config = BridgeConfig::default().with_transport(TransportKind::Broadcast);
    (
        Bridge::with_primitives(config.clone(), &host),
        Bridge::with_primitives(config, &host),
    )
}

fn fast_persistence() -> StoreConfig {
    StoreConfig {
        debounce_ms: 5,
        ..StoreConfig::default()
    }
}

#[test]
fn default_state_without_runtime() {
    let store = GlobalStateStore::new(Bridge::new(BridgeConfig::default()), StoreConfig::default());
    let state = store.get_snapshot();

    assert!(state.user.is_none());
    assert!(state.notifications.is_empty());
    assert!(state.modal_context.is_none());
    assert_eq!(*state.theme, Theme::default());
    assert_eq!(state.theme.mode, ThemeMode::Light);
    assert_eq!(state.theme.primary_color, "#007bff");
    assert_eq!(state.theme.custom_css, "");

    store.toggle_theme_mode();
    assert_eq!(store.get_snapshot().theme.mode, ThemeMode::Dark);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_message_per_dispatch_on_shared_bridge() {
    let bridge = Bridge::new(BridgeConfig::default());
    let mut wire = bridge.listen(STATE_CHANNEL);
    let a = GlobalStateStore::new(bridge.clone(), StoreConfig::default());
    let b = GlobalStateStore::new(bridge, StoreConfig::default());

    a.set_user(User::new("u1", "Ada"));
    eventually(|| b.get_snapshot().user.is_some()).await;
    sleep(Duration::from_millis(100)).await;

    let messages: Vec<Value> = std::iter::from_fn(|| wire.try_recv()).collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["origin"], a.origin());
    assert_eq!(messages[0]["action"]["type"], "SET_USER");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actions_replicate_across_contexts() {
    let (left, right) = relayed_pair();
    let a = GlobalStateStore::new(left, StoreConfig::default());
    let b = GlobalStateStore::new(right, StoreConfig::default());
    assert_ne!(a.origin(), b.origin());

    let mut theme_at_b = b.select_theme();
    assert_eq!(theme_at_b.next().await.unwrap().mode, ThemeMode::Light);

    a.toggle_theme_mode();
    let theme = timeout(WAIT, theme_at_b.next()).await.unwrap().unwrap();
    assert_eq!(theme.mode, ThemeMode::Dark);

    b.set_modal_context(ModalContext {
        source_app: "checkout".into(),
        data: json!({"step": 2}),
        metadata: Default::default(),
    });
    eventually(|| a.get_snapshot().modal_context.is_some()).await;
    assert_eq!(a.get_snapshot().modal_context.as_ref().unwrap().data, json!({"step": 2}));

    b.clear_modal_context();
    eventually(|| a.get_snapshot().modal_context.is_none()).await;
}

#[tokio::test(flavor = "current_thread")]
async fn dispatch_burst_keeps_replicas_in_step() {
    let bridge = Bridge::new(BridgeConfig::default());
    let a = GlobalStateStore::new(bridge.clone(), StoreConfig::default());
    let b = GlobalStateStore::new(bridge, StoreConfig::default());

    // Nothing is replicated until this task yields, so every action queues up.
    for _ in 0..2_049 {
        a.toggle_theme_mode();
    }
    assert_eq!(a.get_snapshot().theme.mode, ThemeMode::Dark);
    eventually(|| b.get_snapshot().theme.mode == ThemeMode::Dark).await;

    sleep(Duration::from_millis(50)).await;
    assert_eq!(b.get_snapshot().theme.mode, ThemeMode::Dark);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_replicate_in_applied_order() {
    let (left, right) = relayed_pair();
    let a = GlobalStateStore::new(left, StoreConfig::default());
    let b = GlobalStateStore::new(right, StoreConfig::default());

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let a = a.clone();
            std::thread::spawn(move || {
                for i in 0..250 {
                    a.set_theme(Theme {
                        primary_color: format!("#{w}{i:04}"),
                        ..Theme::default()
                    });
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let expected = a.get_snapshot().theme.clone();
    eventually(|| b.get_snapshot().theme == expected).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notification_ids_agree_across_replicas() {
    let (left, right) = relayed_pair();
    let a = GlobalStateStore::new(left, StoreConfig::default());
    let b = GlobalStateStore::new(right, StoreConfig::default());

    let id = a.add_notification("Saved", NotificationKind::Success, Some(Duration::from_secs(5)));
    eventually(|| b.get_snapshot().notifications.len() == 1).await;

    let replica = b.get_snapshot().notifications[0].clone();
    assert_eq!(replica.id, id);
    assert_eq!(replica.ttl_ms, Some(5_000));
    assert_eq!(replica.timestamp, a.get_snapshot().notifications[0].timestamp);

    b.remove_notification(id);
    eventually(|| a.get_snapshot().notifications.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_state_messages_are_ignored() {
    let bridge = Bridge::new(BridgeConfig::default());
    let store = GlobalStateStore::new(bridge.clone(), StoreConfig::default());

    bridge.publish(STATE_CHANNEL, json!({"origin": "peer", "action": {"type": "EXPLODE"}}));
    bridge.publish(STATE_CHANNEL, json!("garbage"));
    bridge.publish(
        STATE_CHANNEL,
        json!({"origin": "peer", "action": {"type": "SET_USER", "payload": {"id": "p", "name": "Peer"}}}),
    );

    eventually(|| store.get_snapshot().user.is_some()).await;
    assert_eq!(store.get_snapshot().user.as_ref().unwrap().name, "Peer");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn own_origin_is_not_applied_twice() {
    let bridge = Bridge::new(BridgeConfig::default());
    let store = GlobalStateStore::new(bridge, StoreConfig::default());
    let mut states = store.state();
    states.next().await;

    store.dispatch(GlobalAction::ToggleTheme);
    assert_eq!(states.next().await.unwrap().theme.mode, ThemeMode::Dark);

    sleep(Duration::from_millis(100)).await;
    assert!(states.try_next().is_none());
    assert_eq!(store.get_snapshot().theme.mode, ThemeMode::Dark);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn selectors_emit_only_on_field_change() {
    let store = GlobalStateStore::new(Bridge::new(BridgeConfig::default()), StoreConfig::default());
    let mut users = store.select_user();
    let mut themes = store.select_theme();
    let mut counts = store.select_notification_count();
    let mut permissions = store.select_user_permissions();

    assert_eq!(users.try_next(), Some(None));
    assert!(themes.try_next().is_some());
    assert_eq!(counts.try_next(), Some(0));
    assert_eq!(permissions.try_next(), Some(Vec::new()));

    store.toggle_theme_mode();
    assert!(users.try_next().is_none());
    assert_eq!(themes.try_next().unwrap().mode, ThemeMode::Dark);

    store.set_user(User::new("u1", "Ada").with_permissions(["read"]));
    assert_eq!(users.try_next().unwrap().unwrap().id, "u1");
    assert!(themes.try_next().is_none());
    assert_eq!(permissions.try_next(), Some(vec!["read".to_string()]));

    // Same permissions under a new user value: the derived selector stays quiet.
    store.set_user(User::new("u2", "Bob").with_permissions(["read"]));
    assert_eq!(users.try_next().unwrap().unwrap().id, "u2");
    assert!(permissions.try_next().is_none());

    store.add_notification("hello", NotificationKind::Info, None);
    assert_eq!(counts.try_next(), Some(1));
    assert!(users.try_next().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notification_cap_applies_to_store() {
    let config = StoreConfig {
        max_notifications: 2,
        ..StoreConfig::default()
    };
    let store = GlobalStateStore::new(Bridge::new(BridgeConfig::default()), config);
    for message in ["one", "two", "three"] {
        store.add_notification(message, NotificationKind::Info, None);
    }
    let messages: Vec<String> = store
        .get_snapshot()
        .notifications
        .iter()
        .map(|n| n.message.clone())
        .collect();
    assert_eq!(messages, vec!["two", "three"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_restores_defaults_everywhere() {
    let (left, right) = relayed_pair();
    let a = GlobalStateStore::new(left, StoreConfig::default());
    let b = GlobalStateStore::new(right, StoreConfig::default());

    a.set_user(User::new("u1", "Ada"));
    a.add_notification("n", NotificationKind::Warning, None);
    eventually(|| b.get_snapshot().notifications.len() == 1).await;

    b.reset_state();
    eventually(|| a.get_snapshot().user.is_none() && a.get_snapshot().notifications.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistence_round_trip_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let db = SqliteStore::open(&db_path).unwrap();

    {
        let store = GlobalStateStore::with_storage(
            Bridge::new(BridgeConfig::default()),
            fast_persistence(),
            Arc::new(db.clone()),
        );
        store.set_user(User::new("u1", "Ada").with_permissions(["admin"]));
        store.set_theme(Theme {
            mode: ThemeMode::Dark,
            primary_color: "#222222".into(),
            custom_css: String::new(),
        });
        store.add_notification("not persisted", NotificationKind::Info, None);

        eventually(|| {
            db.get_item("mfe:globalState:v1")
                .unwrap()
                .map_or(false, |raw| raw.contains("#222222"))
        })
        .await;
    }

    let raw: Value = serde_json::from_str(&db.get_item("mfe:globalState:v1").unwrap().unwrap()).unwrap();
    assert_eq!(raw["v"], 1);
    assert!(raw.get("notifications").is_none());

    let reopened = SqliteStore::open(&db_path).unwrap();
    let store = GlobalStateStore::with_storage(
        Bridge::new(BridgeConfig::default()),
        fast_persistence(),
        Arc::new(reopened),
    );
    let state = store.get_snapshot();
    assert_eq!(state.user.as_ref().unwrap().permissions, vec!["admin"]);
    assert_eq!(state.theme.mode, ThemeMode::Dark);
    assert_eq!(state.theme.primary_color, "#222222");
    assert!(state.notifications.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistence_writes_are_coalesced() {
    let backing = Arc::new(MemoryStore::new());
    let config = StoreConfig {
        debounce_ms: 50,
        ..StoreConfig::default()
    };
    let store = GlobalStateStore::with_storage(Bridge::new(BridgeConfig::default()), config, backing.clone());

    for i in 0..10 {
        store.set_user(User::new(format!("u{i}"), "User"));
    }
    assert!(backing.get_item("mfe:globalState:v1").unwrap().is_none());

    eventually(|| backing.get_item("mfe:globalState:v1").unwrap().is_some()).await;
    let raw: Value = serde_json::from_str(&backing.get_item("mfe:globalState:v1").unwrap().unwrap()).unwrap();
    assert_eq!(raw["user"]["id"], "u9");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_write_is_flushed_on_drop() {
    let backing = Arc::new(MemoryStore::new());
    let config = StoreConfig {
        debounce_ms: 60_000,
        ..StoreConfig::default()
    };
    let store = GlobalStateStore::with_storage(Bridge::new(BridgeConfig::default()), config, backing.clone());
    store.toggle_theme_mode();
    assert!(backing.is_empty());

    drop(store);
    let raw = backing.get_item("mfe:globalState:v1").unwrap().unwrap();
    assert!(raw.contains("dark"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untouched_store_writes_nothing() {
    let backing = Arc::new(MemoryStore::new());
    let store = GlobalStateStore::with_storage(
        Bridge::new(BridgeConfig::default()),
        fast_persistence(),
        backing.clone(),
    );
    store.flush();
    drop(store);
    assert!(backing.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_failures_do_not_disturb_state() {
    let backing = Arc::new(MemoryStore::with_quota(16));
    let store = GlobalStateStore::with_storage(
        Bridge::new(BridgeConfig::default()),
        fast_persistence(),
        backing.clone(),
    );

    store.set_user(User::new("u1", "A user with a long enough name to exceed the quota"));
    store.flush();

    assert!(backing.is_empty());
    assert_eq!(store.get_snapshot().user.as_ref().unwrap().id, "u1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_snapshot_falls_back_to_defaults() {
    let backing = Arc::new(MemoryStore::new());
    backing.set_item("mfe:globalState:v1", "definitely not json").unwrap();

    let store = GlobalStateStore::with_storage(
        Bridge::new(BridgeConfig::default()),
        fast_persistence(),
        backing.clone(),
    );
    assert!(store.get_snapshot().user.is_none());
    assert_eq!(store.get_snapshot().theme.mode, ThemeMode::Light);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_key_and_legacy_snapshot() {
    let backing = Arc::new(MemoryStore::new());
    backing
        .set_item(
            "shop:state",
            &json!({"user": {"id": "old", "name": "Legacy"}, "theme": {"mode": "dark", "primaryColor": "#000", "customCSS": ""}})
                .to_string(),
        )
        .unwrap();

    let config = StoreConfig {
        key: "shop:state".into(),
        ..fast_persistence()
    };
    let store = GlobalStateStore::with_storage(Bridge::new(BridgeConfig::default()), config, backing);
    let state = store.get_snapshot();
    assert_eq!(state.user.as_ref().unwrap().id, "old");
    assert_eq!(state.theme.mode, ThemeMode::Dark);
}
