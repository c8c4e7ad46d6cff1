use super::*;
use crate::frame::Status;
use crate::repo::memory::MemoryRepo;
use crate::state::test_helpers;
use std::sync::Arc;
use std::time::Duration;

fn request(event: &str) -> Frame {
    Frame::request(event, Data::new())
}

async fn cell_color(state: &AppState, canvas_id: &str, x: i64, y: i64) -> String {
    let handle = state.live_canvas(canvas_id).await.unwrap();
    let canvas = handle.lock().await;
    canvas.grid.get(x, y).unwrap().as_str().to_owned()
}

// =============================================================================
// place_pixel
// =============================================================================

#[tokio::test]
async fn scenario_place_then_query_history() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 10, 10, false).await;
    let (a, mut rx_a) = test_helpers::connect_to(&state, &canvas);
    let (b, mut rx_b) = test_helpers::connect_to(&state, &canvas);

    let applied = place_pixel(&state, a, "alice", &canvas, 2, 3, "#ff0000").await.unwrap();
    assert_eq!(applied, Applied::Changed);

    let placed = test_helpers::recv_event(&mut rx_b, "pixel_placed").await;
    assert_eq!(placed.i64_field("x"), Some(2));
    assert_eq!(placed.i64_field("y"), Some(3));
    assert_eq!(placed.str_field("color"), Some("#FF0000"));
    assert_eq!(placed.str_field("username"), Some("alice"));
    assert_eq!(placed.canvas_id.as_deref(), Some(canvas.as_str()));
    // Originator receives the authoritative broadcast too.
    test_helpers::recv_event(&mut rx_a, "pixel_placed").await;

    let req = request("request_history");
    assert!(query_history(&state, b, &canvas, 2, 3, &req).await.unwrap());
    let resp = test_helpers::recv_event(&mut rx_b, "history_response").await;
    assert_eq!(resp.parent_id, Some(req.id));
    assert_eq!(resp.status, Status::Done);
    assert_eq!(resp.str_field("username"), Some("alice"));
    assert!(resp.i64_field("timestamp").is_some());
    // History replies are never broadcast.
    test_helpers::assert_no_frame(&mut rx_a).await;
}

#[tokio::test]
async fn placed_color_is_readable_from_grid() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 3, false).await;
    let (a, _rx) = test_helpers::connect_to(&state, &canvas);

    for (x, y) in [(0, 0), (3, 0), (0, 2), (3, 2)] {
        place_pixel(&state, a, "alice", &canvas, x, y, "#0a0").await.unwrap();
        assert_eq!(cell_color(&state, &canvas, x, y).await, "#00AA00");
    }
    let handle = state.live_canvas(&canvas).await.unwrap();
    assert!(handle.lock().await.dirty);
}

#[tokio::test]
async fn off_by_one_is_rejected_without_broadcast() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 10, 10, false).await;
    let (a, mut rx_a) = test_helpers::connect_to(&state, &canvas);
    let (_b, mut rx_b) = test_helpers::connect_to(&state, &canvas);

    for (x, y) in [(10, 0), (0, 10), (-1, 0), (0, -1)] {
        let err = place_pixel(&state, a, "alice", &canvas, x, y, "#FF0000").await.unwrap_err();
        assert_eq!(err.error_code(), "E_OUT_OF_BOUNDS");
    }

    test_helpers::assert_no_frame(&mut rx_a).await;
    test_helpers::assert_no_frame(&mut rx_b).await;
    let handle = state.live_canvas(&canvas).await.unwrap();
    let live = handle.lock().await;
    assert!(!live.dirty);
    assert!(live.ledger.is_empty());
    assert!(live.grid.export_snapshot().iter().flatten().all(|c| *c == Color::default()));
}

#[tokio::test]
async fn same_color_repaint_updates_attribution_and_broadcasts() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);
    let (b, mut rx_b) = test_helpers::connect_to(&state, &canvas);

    place_pixel(&state, a, "alice", &canvas, 1, 1, "#00FF00").await.unwrap();
    test_helpers::recv_event(&mut rx_b, "pixel_placed").await;
    let revision = state.live_canvas(&canvas).await.unwrap().lock().await.revision;

    let applied = place_pixel(&state, b, "bob", &canvas, 1, 1, "#0f0").await.unwrap();
    assert_eq!(applied, Applied::Unchanged);
    let placed = test_helpers::recv_event(&mut rx_b, "pixel_placed").await;
    assert_eq!(placed.str_field("username"), Some("bob"));

    let handle = state.live_canvas(&canvas).await.unwrap();
    let live = handle.lock().await;
    assert_eq!(live.revision, revision);
    assert_eq!(live.ledger.lookup(1, 1).map(|a| a.username.as_str()), Some("bob"));
    assert_eq!(live.grid.get(1, 1).map(Color::as_str), Some("#00FF00"));
}

#[tokio::test]
async fn place_requires_membership() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let other = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (_member, mut rx_member) = test_helpers::connect_to(&state, &canvas);
    let (outsider, _rx) = test_helpers::connect_to(&state, &other);

    let err = place_pixel(&state, outsider, "mallory", &canvas, 0, 0, "#000").await.unwrap_err();
    assert!(matches!(err, PlacementError::NotAMember(_)));
    assert_eq!(err.error_code(), "E_NOT_A_MEMBER");
    test_helpers::assert_no_frame(&mut rx_member).await;
    assert_eq!(cell_color(&state, &canvas, 0, 0).await, "#FFFFFF");
}

#[tokio::test]
async fn place_rejects_unknown_canvas_and_bad_color() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx) = test_helpers::connect_to(&state, &canvas);

    let err = place_pixel(&state, a, "alice", "nope", 0, 0, "#000").await.unwrap_err();
    assert_eq!(err.error_code(), "E_UNKNOWN_CANVAS");
    assert!(state.live_canvas("nope").await.is_none());

    let err = place_pixel(&state, a, "alice", &canvas, 0, 0, "red").await.unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID_COLOR");
}

#[tokio::test]
async fn place_enqueues_history_record() {
    let mut state = test_helpers::test_app_state();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    state.history_tx = Some(tx);
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);

    place_pixel(&state, a, "alice", &canvas, 3, 2, "#123").await.unwrap();
    let edit = rx.try_recv().unwrap();
    assert_eq!(edit.canvas_id, canvas);
    assert_eq!((edit.x, edit.y), (3, 2));
    assert_eq!(edit.attribution.username, "alice");
    assert_eq!(edit.attribution.color.as_str(), "#112233");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_placements_converge() {
    const WRITERS: usize = 16;
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 8, 8, false).await;
    let (_watcher, mut rx_watcher) = test_helpers::connect_to(&state, &canvas);

    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        let state = state.clone();
        let canvas = canvas.clone();
        let (conn, rx) = test_helpers::connect_to(&state, &canvas);
        tasks.push(tokio::spawn(async move {
            let color = format!("#{:06X}", i + 1);
            place_pixel(&state, conn, &format!("user-{i}"), &canvas, 5, 5, &color)
                .await
                .unwrap();
            drop(rx);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut last = None;
    for _ in 0..WRITERS {
        let frame = test_helpers::recv_event(&mut rx_watcher, "pixel_placed").await;
        last = frame.str_field("color").map(str::to_owned);
    }
    test_helpers::assert_no_frame(&mut rx_watcher).await;

    let final_color = cell_color(&state, &canvas, 5, 5).await;
    assert_eq!(last.as_deref(), Some(final_color.as_str()));
    let handle = state.live_canvas(&canvas).await.unwrap();
    let live = handle.lock().await;
    assert_eq!(live.ledger.lookup(5, 5).map(|a| a.color.as_str()), Some(final_color.as_str()));
}

#[tokio::test]
async fn lagging_subscriber_is_dropped_from_room() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);
    let slow = uuid::Uuid::new_v4();
    let (slow_tx, mut slow_rx) = tokio::sync::mpsc::channel(2);
    state.gateway.connect(slow, slow_tx);
    state.gateway.join_room(slow, &canvas);

    for color in ["#FF0000", "#00FF00", "#0000FF"] {
        place_pixel(&state, a, "alice", &canvas, 0, 0, color).await.unwrap();
    }

    // The slow peer saw a prefix and was then cut off, never a gapped stream.
    let seen: Vec<_> = test_helpers::drain(&mut slow_rx)
        .into_iter()
        .filter_map(|f| f.str_field("color").map(str::to_owned))
        .collect();
    assert_eq!(seen, vec!["#FF0000", "#00FF00"]);
    assert!(slow_rx.recv().await.is_none());
    assert!(!state.gateway.is_member(slow, &canvas));
    assert_eq!(cell_color(&state, &canvas, 0, 0).await, "#0000FF");
}

#[tokio::test]
async fn closed_gateway_rejects_further_writes() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);

    state.gateway.close_all();
    let err = place_pixel(&state, a, "alice", &canvas, 1, 1, "#000").await.unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_A_MEMBER");
    let handle = state.live_canvas(&canvas).await.unwrap();
    assert!(!handle.lock().await.dirty);
}

#[tokio::test]
async fn broadcast_stays_in_its_room() {
    let state = test_helpers::test_app_state();
    let room_a = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let room_b = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &room_a);
    let (_b, mut rx_b) = test_helpers::connect_to(&state, &room_b);

    place_pixel(&state, a, "alice", &room_a, 0, 0, "#ABCDEF").await.unwrap();
    test_helpers::assert_no_frame(&mut rx_b).await;
}

// =============================================================================
// query_history
// =============================================================================

#[tokio::test]
async fn unedited_cell_reports_no_attribution() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, mut rx_a) = test_helpers::connect_to(&state, &canvas);

    assert!(query_history(&state, a, &canvas, 0, 0, &request("request_history")).await.unwrap());
    let resp = test_helpers::recv_event(&mut rx_a, "history_response").await;
    assert_eq!(resp.status, Status::Done);
    assert_eq!(resp.i64_field("x"), Some(0));
    assert!(resp.str_field("username").is_none());
    assert!(resp.i64_field("timestamp").is_none());
}

#[tokio::test]
async fn history_query_rejects_bad_cells_and_outsiders() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);
    let (outsider, _rx) = test_helpers::connect(&state);

    let err = query_history(&state, a, &canvas, 4, 0, &request("request_history")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_OUT_OF_BOUNDS");

    let err = query_history(&state, outsider, &canvas, 0, 0, &request("request_history")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_A_MEMBER");
}

#[tokio::test]
async fn second_writer_replaces_attribution() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx_a) = test_helpers::connect_to(&state, &canvas);
    let (b, mut rx_b) = test_helpers::connect_to(&state, &canvas);

    place_pixel(&state, a, "alice", &canvas, 2, 2, "#111111").await.unwrap();
    place_pixel(&state, b, "bob", &canvas, 2, 2, "#222222").await.unwrap();
    test_helpers::drain(&mut rx_b);

    query_history(&state, b, &canvas, 2, 2, &request("request_history")).await.unwrap();
    let resp = test_helpers::recv_event(&mut rx_b, "history_response").await;
    assert_eq!(resp.str_field("username"), Some("bob"));
    assert_eq!(resp.str_field("color"), Some("#222222"));
}

// =============================================================================
// log_history_batch
// =============================================================================

#[tokio::test]
async fn history_batch_records_valid_entries_only() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, mut rx_a) = test_helpers::connect_to(&state, &canvas);

    let pixels = vec![
        serde_json::json!({"x": 0, "y": 0, "color": "#FF0000"}),
        serde_json::json!({"x": 1, "y": 0, "color": "#00FF00"}),
        serde_json::json!({"x": 9, "y": 0, "color": "#00FF00"}),
        serde_json::json!({"x": 2, "y": 0, "color": "green"}),
        serde_json::json!({"y": 0, "color": "#000"}),
    ];
    let outcome = log_history_batch(&state, a, "alice", &canvas, &pixels).await.unwrap();
    assert_eq!(outcome, BatchOutcome { recorded: 2, rejected: 3 });

    let handle = state.live_canvas(&canvas).await.unwrap();
    let live = handle.lock().await;
    assert_eq!(live.ledger.len(), 2);
    let first = live.ledger.lookup(0, 0).unwrap();
    let second = live.ledger.lookup(1, 0).unwrap();
    assert_eq!(first.timestamp, second.timestamp);
    // Attribution only; the grid is untouched and nothing is broadcast.
    assert!(!live.dirty);
    assert_eq!(live.grid.get(0, 0).map(Color::as_str), Some("#FFFFFF"));
    drop(live);
    test_helpers::assert_no_frame(&mut rx_a).await;
}

#[tokio::test]
async fn history_batch_over_limit_is_rejected() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 4, 4, false).await;
    let (a, _rx) = test_helpers::connect_to(&state, &canvas);

    let pixels = vec![serde_json::json!({"x": 0, "y": 0, "color": "#FFF"}); state.limits.max_history_batch + 1];
    let err = log_history_batch(&state, a, "alice", &canvas, &pixels).await.unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID_REQUEST");
}

// =============================================================================
// save_canvas_state
// =============================================================================

fn solid(width: usize, height: usize, color: &str) -> serde_json::Value {
    serde_json::json!(vec![vec![color; width]; height])
}

#[tokio::test]
async fn save_private_canvas_replaces_broadcasts_and_persists() {
    let repo = Arc::new(MemoryRepo::new());
    let state = test_helpers::test_app_state_with_repo(repo.clone());
    let canvas = test_helpers::seed_canvas(&state, 2, 2, true).await;
    let (a, mut rx_a) = test_helpers::connect_to(&state, &canvas);

    save_canvas_state(&state, a, "alice", &canvas, solid(2, 2, "#000000")).await.unwrap();
    let replaced = test_helpers::recv_event(&mut rx_a, "canvas_replaced").await;
    assert_eq!(replaced.data["canvas_data"], solid(2, 2, "#000000"));
    assert_eq!(cell_color(&state, &canvas, 1, 1).await, "#000000");

    let mut persisted = false;
    for _ in 0..50 {
        let stored = crate::repo::CanvasRepo::load_canvas(repo.as_ref(), &canvas).await.unwrap().unwrap();
        if stored.snapshot[1][1].as_str() == "#000000" {
            persisted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(persisted, "snapshot was not written");
}

#[tokio::test]
async fn save_community_canvas_is_forbidden() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 2, 2, false).await;
    let (a, _rx) = test_helpers::connect_to(&state, &canvas);

    let err = save_canvas_state(&state, a, "alice", &canvas, solid(2, 2, "#000000")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_FORBIDDEN");
    assert_eq!(cell_color(&state, &canvas, 0, 0).await, "#FFFFFF");
}

#[tokio::test]
async fn save_rejects_mismatched_or_malformed_snapshot() {
    let state = test_helpers::test_app_state();
    let canvas = test_helpers::seed_canvas(&state, 2, 2, true).await;
    let (a, mut rx_a) = test_helpers::connect_to(&state, &canvas);

    let err = save_canvas_state(&state, a, "alice", &canvas, solid(3, 2, "#000000")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID_SNAPSHOT");

    let err = save_canvas_state(&state, a, "alice", &canvas, solid(2, 2, "black")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID_SNAPSHOT");

    let err = save_canvas_state(&state, a, "alice", &canvas, serde_json::json!("not a grid")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID_SNAPSHOT");

    test_helpers::assert_no_frame(&mut rx_a).await;
    assert_eq!(cell_color(&state, &canvas, 0, 0).await, "#FFFFFF");
}
