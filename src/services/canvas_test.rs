use super::*;
use crate::grid::Color;
use crate::ledger::{Attribution, PixelEdit};
use crate::repo::memory::MemoryRepo;
use crate::state::test_helpers::{self, FlakyRepo};
use std::sync::atomic::Ordering;

async fn stored_only(repo: &MemoryRepo, id: &str, width: u32, height: u32, is_private: bool) {
    let meta = CanvasMeta { id: id.into(), name: id.into(), width, height, is_private };
    let mut grid = Grid::new(width, height).unwrap();
    grid.apply_pixel(0, 0, &Color::parse("#123456").unwrap())
        .unwrap();
    crate::repo::CanvasRepo::insert_canvas(repo, &StoredCanvas { meta, snapshot: grid.export_snapshot() })
        .await
        .unwrap();
}

// =============================================================================
// load_canvas
// =============================================================================

#[tokio::test]
async fn load_canvas_unknown_is_error_and_not_created() {
    let state = test_helpers::test_app_state();
    let err = load_canvas(&state, "missing").await.unwrap_err();
    assert!(matches!(err, CanvasError::UnknownCanvas(ref id) if id == "missing"));
    assert_eq!(err.error_code(), "E_UNKNOWN_CANVAS");
    assert!(state.live_canvas("missing").await.is_none());
}

#[tokio::test]
async fn load_canvas_hydrates_grid_and_ledger() {
    let repo = Arc::new(MemoryRepo::new());
    stored_only(&repo, "stored", 4, 4, false).await;
    crate::repo::CanvasRepo::append_history(
        repo.as_ref(),
        &[PixelEdit {
            canvas_id: "stored".into(),
            x: 0,
            y: 0,
            attribution: Attribution {
                username: "alice".into(),
                timestamp: 42,
                color: Color::parse("#123456").unwrap(),
            },
        }],
    )
    .await
    .unwrap();
    let state = test_helpers::test_app_state_with_repo(repo);

    let handle = load_canvas(&state, "stored").await.unwrap();
    let canvas = handle.lock().await;
    assert_eq!(canvas.grid.get(0, 0).map(Color::as_str), Some("#123456"));
    assert_eq!(canvas.ledger.lookup(0, 0).map(|a| a.timestamp), Some(42));
    assert!(!canvas.dirty);
}

#[tokio::test]
async fn load_canvas_returns_same_handle_twice() {
    let repo = Arc::new(MemoryRepo::new());
    stored_only(&repo, "stored", 2, 2, false).await;
    let state = test_helpers::test_app_state_with_repo(repo);

    let a = load_canvas(&state, "stored").await.unwrap();
    let b = load_canvas(&state, "stored").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn load_canvas_surfaces_repository_failure() {
    let repo = Arc::new(FlakyRepo::default());
    repo.fail_loads.store(true, Ordering::SeqCst);
    let state = test_helpers::test_app_state_with_repo(repo);

    let err = load_canvas(&state, "anything").await.unwrap_err();
    assert_eq!(err.error_code(), "E_PERSISTENCE");
    assert!(err.retryable());
}

// =============================================================================
// create / seed / list
// =============================================================================

#[tokio::test]
async fn create_private_canvas_uses_fixed_size() {
    let state = test_helpers::test_app_state();
    let meta = create_canvas(&state, "  my drawing ", true, Some(5), Some(7)).await.unwrap();
    assert_eq!(meta.name, "my drawing");
    assert_eq!((meta.width, meta.height), (32, 32));
    assert!(meta.is_private);

    let view = canvas_view(&state, &meta.id).await.unwrap();
    assert_eq!(view.canvas_data.len(), 32);
    assert!(view.canvas_data.iter().flatten().all(|c| *c == Color::default()));
}

#[tokio::test]
async fn create_community_canvas_validates_dimensions() {
    let state = test_helpers::test_app_state();
    assert!(matches!(
        create_canvas(&state, "pub", false, None, Some(10)).await,
        Err(CanvasError::Invalid(_))
    ));
    assert!(matches!(
        create_canvas(&state, "pub", false, Some(0), Some(10)).await,
        Err(CanvasError::Invalid(_))
    ));
    assert!(matches!(
        create_canvas(&state, "pub", false, Some(513), Some(10)).await,
        Err(CanvasError::Invalid(_))
    ));
    assert!(matches!(
        create_canvas(&state, "   ", false, Some(10), Some(10)).await,
        Err(CanvasError::Invalid(_))
    ));

    let meta = create_canvas(&state, "pub", false, Some(64), Some(32)).await.unwrap();
    assert_eq!((meta.width, meta.height), (64, 32));
    assert!(state.repo.load_canvas(&meta.id).await.unwrap().is_some());
}

#[tokio::test]
async fn seed_community_pubs_is_idempotent() {
    let state = test_helpers::test_app_state();
    assert_eq!(seed_community_pubs(&state).await.unwrap(), COMMUNITY_PUBS.len());
    assert_eq!(seed_community_pubs(&state).await.unwrap(), 0);

    let pubs = list_pubs(&state).await.unwrap();
    assert_eq!(pubs.len(), COMMUNITY_PUBS.len());
    let den = pubs.iter().find(|p| p.id == "doodle-den").unwrap();
    assert_eq!((den.width, den.height), (64, 32));
}

// =============================================================================
// join / leave
// =============================================================================

#[tokio::test]
async fn join_unknown_canvas_leaves_membership_untouched() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (conn, _rx) = test_helpers::connect_to(&state, &canvas);

    assert!(join_canvas(&state, conn, "alice", "missing").await.is_err());
    assert!(state.gateway.is_member(conn, &canvas));
}

#[tokio::test]
async fn join_moves_connection_and_announces() {
    let state = test_helpers::test_app_state();
    let first = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let second = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (watcher_first, mut rx_first) = test_helpers::connect_to(&state, &first);
    let (watcher_second, mut rx_second) = test_helpers::connect_to(&state, &second);
    let (conn, mut rx_conn) = test_helpers::connect(&state);

    join_canvas(&state, conn, "alice", &first).await.unwrap();
    let joined = test_helpers::recv_event(&mut rx_first, "member_joined").await;
    assert_eq!(joined.str_field("username"), Some("alice"));

    join_canvas(&state, conn, "alice", &second).await.unwrap();
    let left = test_helpers::recv_event(&mut rx_first, "member_left").await;
    assert_eq!(left.canvas_id.as_deref(), Some(first.as_str()));
    test_helpers::recv_event(&mut rx_second, "member_joined").await;

    assert!(!state.gateway.members_of(&first).contains(&conn));
    assert!(state.gateway.members_of(&first).contains(&watcher_first));
    assert!(state.gateway.members_of(&second).contains(&watcher_second));
    assert!(state.gateway.is_member(conn, &second));
    // The subject is never told about its own moves.
    test_helpers::assert_no_frame(&mut rx_conn).await;
}

#[tokio::test]
async fn closed_connection_cannot_rejoin() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (conn, _rx) = test_helpers::connect(&state);

    state.gateway.close_all();
    let err = join_canvas(&state, conn, "alice", &canvas).await.unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_A_MEMBER");
    assert!(!state.gateway.is_member(conn, &canvas));
    assert_eq!(state.gateway.member_count(&canvas), 0);
}

#[tokio::test]
async fn join_pub_rejects_private_canvas() {
    let state = test_helpers::test_app_state();
    let private = test_helpers::seed_canvas(&state, 4, 4, true).await;
    let community = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (conn, _rx) = test_helpers::connect(&state);

    let err = join_pub(&state, conn, "alice", &private).await.unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_A_PUB");
    assert!(state.gateway.room_of(conn).is_none());

    let meta = join_pub(&state, conn, "alice", &community).await.unwrap();
    assert_eq!(meta.id, community);
    assert!(state.gateway.is_member(conn, &community));
}

#[tokio::test]
async fn leave_and_disconnect_announce_to_room() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (_watcher, mut rx_watcher) = test_helpers::connect_to(&state, &canvas);
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);
    let (b, _rx_b) = test_helpers::connect_to(&state, &canvas);

    assert_eq!(leave_canvas(&state, a, "alice").as_deref(), Some(canvas.as_str()));
    assert_eq!(leave_canvas(&state, a, "alice"), None);
    let left = test_helpers::recv_event(&mut rx_watcher, "member_left").await;
    assert_eq!(left.str_field("username"), Some("alice"));

    disconnect(&state, b, "bob");
    let left = test_helpers::recv_event(&mut rx_watcher, "member_left").await;
    assert_eq!(left.str_field("username"), Some("bob"));
    assert!(!state.gateway.members_of(&canvas).contains(&b));
}
