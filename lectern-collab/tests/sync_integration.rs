//! End-to-end sync between participants routed through a test hub.

mod common;

use common::{advance, eventually, spawn_ws_hub, LinkHub};
use lectern_collab::{
    BufferSurface, DocumentSession, EditorSurface, EngineConfig, PublishMode, RelayClient,
    RelayConfig, SessionConfig,
};
use lectern_core::{
    personal_document_key, ConnectionStatus, DocumentRegistry, Role, SessionContext, SyncStatus,
    SHARED_DOCUMENT_KEY,
};
use std::sync::Arc;
use std::time::Duration;

/// One participant process: its own registry, relay and session.
struct Participant {
    relay: RelayClient,
    session: DocumentSession,
    _registry: DocumentRegistry,
}

impl Participant {
    fn open(id: &str, role: Role, key: &str, config: SessionConfig) -> Self {
        let registry = DocumentRegistry::new();
        let relay = RelayClient::new(id);
        let ctx = SessionContext::new(id, id, role);
        let session = DocumentSession::open(&registry, relay.clone(), &ctx, key, config);
        Self {
            relay,
            session,
            _registry: registry,
        }
    }

    fn teacher(id: &str, key: &str) -> Self {
        Self::open(id, Role::Privileged, key, SessionConfig::for_testing())
    }

    fn student(id: &str, key: &str) -> Self {
        Self::open(id, Role::Restricted, key, SessionConfig::for_testing())
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_viewer_sees_teacher_code() {
    let hub = LinkHub::new();
    let teacher = Participant::teacher("t1", SHARED_DOCUMENT_KEY);
    let student = Participant::student("s1", SHARED_DOCUMENT_KEY);
    hub.join(&teacher.relay);
    hub.join(&student.relay);

    let surface = Arc::new(BufferSurface::new());
    student.session.bind(surface.clone());
    advance(100).await;

    assert!(teacher.session.insert(0, "print(1)"));
    advance(10).await;

    assert_eq!(student.session.content(), "print(1)");
    assert_eq!(surface.content(), "print(1)");
    assert!(surface.is_read_only());
    assert!(!student.session.can_edit());

    assert!(!student.session.insert(0, "hack"));
    advance(10).await;
    assert_eq!(student.session.content(), "print(1)");
    assert_eq!(teacher.session.content(), "print(1)");
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_reconnect_resyncs() {
    let key = personal_document_key("s1");
    let hub = LinkHub::new();
    let teacher = Participant::teacher("t1", &key);
    let student = Participant::student("s1", &key);
    hub.join(&teacher.relay);
    hub.join(&student.relay);
    advance(100).await;

    assert!(student.session.can_edit());
    assert!(student.session.insert(0, "x = 1\n"));
    advance(10).await;
    assert_eq!(teacher.session.content(), "x = 1\n");

    hub.leave("s1");
    advance(10).await;
    assert_eq!(student.session.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(student.session.sync_status(), SyncStatus::Offline);
    assert!(!student.session.can_edit());
    assert!(!student.session.insert(0, "offline edit"));
    assert_eq!(student.session.content(), "x = 1\n");

    // The teacher keeps working while the student is away.
    assert!(teacher.session.insert(6, "y = 2\n"));
    advance(10).await;
    assert_eq!(student.session.content(), "x = 1\n");

    let frames_before = student.relay.frames_sent();
    hub.join(&student.relay);
    assert_eq!(student.session.sync_status(), SyncStatus::Syncing);
    assert!(!student.session.has_resynced());

    advance(20).await;
    assert_eq!(student.session.sync_status(), SyncStatus::Synced);
    assert!(student.session.has_resynced());
    assert_eq!(student.relay.frames_sent(), frames_before + 1);
    assert_eq!(student.session.content(), "x = 1\ny = 2\n");
    assert!(student.session.can_edit());
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_full_state() {
    let hub = LinkHub::new();
    let teacher = Participant::teacher("t1", SHARED_DOCUMENT_KEY);
    hub.join(&teacher.relay);
    advance(100).await;
    teacher.session.insert(0, "def main():\n    pass\n");
    advance(10).await;

    let student = Participant::student("s1", SHARED_DOCUMENT_KEY);
    hub.join(&student.relay);
    assert!(student.session.content().is_empty());

    advance(20).await;
    assert_eq!(student.session.content(), teacher.session.content());
    assert_eq!(student.session.sync_status(), SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_edits_converge() {
    let hub = LinkHub::new();
    let peers: Vec<Participant> = ["t1", "t2", "t3"]
        .into_iter()
        .map(|id| Participant::teacher(id, SHARED_DOCUMENT_KEY))
        .collect();
    for p in &peers {
        hub.join(&p.relay);
    }
    advance(100).await;

    // All three type at the same spot before anything is routed.
    peers[0].session.insert(0, "alpha ");
    peers[1].session.insert(0, "beta ");
    peers[2].session.insert(0, "gamma ");
    advance(10).await;

    let content = peers[0].session.content();
    for p in &peers {
        assert_eq!(p.session.content(), content);
    }
    for word in ["alpha ", "beta ", "gamma "] {
        assert!(content.contains(word), "{word} missing from {content:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_delta_publishing_converges() {
    let config = SessionConfig {
        engine: EngineConfig {
            publish_mode: PublishMode::Delta,
            ..EngineConfig::for_testing()
        },
        ..SessionConfig::for_testing()
    };
    let hub = LinkHub::new();
    let a = Participant::open("t1", Role::Privileged, SHARED_DOCUMENT_KEY, config.clone());
    let b = Participant::open("t2", Role::Privileged, SHARED_DOCUMENT_KEY, config);
    hub.join(&a.relay);
    hub.join(&b.relay);
    advance(100).await;

    for (i, ch) in "hello".chars().enumerate() {
        a.session.insert(i as u32, &ch.to_string());
        advance(1).await;
    }
    b.session.insert(5, " world");
    a.session.delete(0, 1);
    advance(10).await;

    assert_eq!(a.session.content(), "ello world");
    assert_eq!(b.session.content(), "ello world");
}

#[tokio::test(start_paused = true)]
async fn test_remote_updates_are_not_echoed() {
    let hub = LinkHub::new();
    let teacher = Participant::teacher("t1", SHARED_DOCUMENT_KEY);
    let student = Participant::student("s1", SHARED_DOCUMENT_KEY);
    let other = Participant::teacher("t2", SHARED_DOCUMENT_KEY);
    hub.join(&teacher.relay);
    hub.join(&student.relay);
    hub.join(&other.relay);
    advance(200).await;

    let student_frames = student.relay.frames_sent();
    let other_frames = other.relay.frames_sent();
    teacher.session.insert(0, "print(1)");
    teacher.session.insert(8, "\nprint(2)");
    advance(10).await;

    assert_eq!(other.session.content(), "print(1)\nprint(2)");
    assert_eq!(student.relay.frames_sent(), student_frames);
    assert_eq!(other.relay.frames_sent(), other_frames);
}

#[tokio::test(start_paused = true)]
async fn test_lone_participant_settles_synced() {
    let hub = LinkHub::new();
    let teacher = Participant::teacher("t1", SHARED_DOCUMENT_KEY);
    hub.join(&teacher.relay);
    assert_eq!(teacher.session.sync_status(), SyncStatus::Syncing);

    advance(500).await;
    assert_eq!(teacher.session.sync_status(), SyncStatus::Synced);
    assert!(!teacher.session.has_resynced());
    assert!(teacher.session.content().is_empty());
}

#[tokio::test]
async fn test_websocket_hub_end_to_end() {
    let base = spawn_ws_hub().await;
    let config = RelayConfig::new(&base, "42");

    let teacher = Participant::teacher("t1", SHARED_DOCUMENT_KEY);
    let student = Participant::student("s1", SHARED_DOCUMENT_KEY);
    let teacher_ctx = SessionContext::new("t1", "Grace Hopper", Role::Privileged);
    let student_ctx = SessionContext::new("s1", "Ada Lovelace", Role::Restricted);

    teacher
        .relay
        .connect(&config.session_url(&teacher_ctx).unwrap())
        .await
        .unwrap();
    student
        .relay
        .connect(&config.session_url(&student_ctx).unwrap())
        .await
        .unwrap();
    assert!(teacher.relay.is_connected());
    assert!(student.relay.is_connected());

    assert!(
        eventually(Duration::from_secs(2), || {
            teacher.session.sync_status() == SyncStatus::Synced
        })
        .await
    );
    assert!(teacher.session.insert(0, "print('over the wire')"));

    assert!(
        eventually(Duration::from_secs(2), || {
            student.session.content() == "print('over the wire')"
        })
        .await,
        "student saw {:?}",
        student.session.content()
    );

    student.relay.close();
    assert_eq!(student.session.sync_status(), SyncStatus::Offline);
}

#[tokio::test]
async fn test_websocket_reconnect_over_live_link_resyncs() {
    let base = spawn_ws_hub().await;
    let config = RelayConfig::new(&base, "42");

    let teacher = Participant::teacher("t1", SHARED_DOCUMENT_KEY);
    let student = Participant::student("s1", SHARED_DOCUMENT_KEY);
    let teacher_url = config
        .session_url(&SessionContext::new("t1", "Grace Hopper", Role::Privileged))
        .unwrap();
    let student_url = config
        .session_url(&SessionContext::new("s1", "Ada Lovelace", Role::Restricted))
        .unwrap();

    teacher.relay.connect(&teacher_url).await.unwrap();
    student.relay.connect(&student_url).await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            teacher.session.sync_status() == SyncStatus::Synced
        })
        .await
    );
    assert!(teacher.session.insert(0, "x = 1"));
    assert!(
        eventually(Duration::from_secs(2), || {
            student.session.content() == "x = 1"
                && student.session.sync_status() == SyncStatus::Synced
        })
        .await
    );
    let before = student.relay.frames_sent();

    // Reconnect without closing the open link first.
    student.relay.connect(&student_url).await.unwrap();
    assert!(student.relay.is_connected());
    assert_ne!(student.session.sync_status(), SyncStatus::Synced);

    assert!(
        eventually(Duration::from_secs(2), || {
            student.session.sync_status() == SyncStatus::Synced
        })
        .await,
        "student stuck in {:?}",
        student.session.sync_status()
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(student.relay.frames_sent(), before + 1);
    assert_eq!(student.session.sync_status(), SyncStatus::Synced);

    assert!(teacher.session.insert(5, "\ny = 2"));
    assert!(
        eventually(Duration::from_secs(2), || {
            student.session.content() == "x = 1\ny = 2"
        })
        .await
    );
}
