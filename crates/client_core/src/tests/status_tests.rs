use serde_json::json;
use tokio::time::timeout;

use super::*;
use crate::test_support::{options, unused_ws_url, TestBackend, WAIT};

#[test]
fn activation_reply_toggles_flag() {
    let mut mirror = ToggleMirror::bollios();

    assert!(mirror.apply(&InboundFrame::titled("bolliOs", json!("activated"))));
    assert!(mirror.flag().active);
    assert!(!mirror.apply(&InboundFrame::titled("bolliOs", json!("activated"))));

    assert!(mirror.apply(&InboundFrame::titled("bolliOs", json!("deactivated"))));
    assert!(!mirror.flag().active);
}

#[test]
fn status_reply_replaces_whole_flag() {
    let mut mirror = ToggleMirror::bollios();

    assert!(mirror.apply(&InboundFrame::titled(
        "bolliOsStatus",
        json!({"active": true, "running": true})
    )));
    assert_eq!(
        mirror.flag(),
        FeatureFlag {
            active: true,
            running: true
        }
    );

    assert!(!mirror.apply(&InboundFrame::titled("bolliOsStatus", json!("garbage"))));
    assert!(mirror.apply(&InboundFrame::titled("bolliOsStatus", json!(false))));
    assert!(!mirror.flag().active);
    assert!(mirror.flag().running);
}

#[test]
fn toggle_ignores_other_features() {
    let mut motion = ToggleMirror::motion_tracking();
    assert_eq!(motion.titles(), vec!["motionTracking"]);
    assert!(!motion.apply(&InboundFrame::titled("bolliOs", json!("activated"))));
    assert!(!motion.apply(&InboundFrame::titled("motionTracking", json!(1))));
    assert_eq!(motion.flag(), FeatureFlag::default());
}

#[test]
fn cv_mode_tracks_mode_and_clears_on_none() {
    let mut mirror = CvModeMirror::default();
    assert!(mirror.apply(&InboundFrame::titled("cvMode", json!("findColor"))));
    assert_eq!(mirror.mode(), Some("findColor"));
    assert!(!mirror.apply(&InboundFrame::titled("cvMode", json!("findColor"))));
    assert!(mirror.apply(&InboundFrame::titled("cvMode", json!("none"))));
    assert_eq!(mirror.mode(), None);
}

#[tokio::test]
async fn attached_mirrors_only_see_their_titles() {
    let url = unused_ws_url().await;
    let channel = CommandChannel::new(options(&url, Duration::from_secs(30)));
    let bollios = attach(&channel, ToggleMirror::bollios()).await;
    let mut motion = attach(&channel, ToggleMirror::motion_tracking()).await;
    let cv = attach(&channel, CvModeMirror::default()).await;

    channel
        .dispatch(InboundFrame::titled("motionTracking", json!("activated")))
        .await;

    let updated = timeout(WAIT, motion.changed())
        .await
        .expect("update in time")
        .expect("channel alive");
    assert!(updated.flag().active);
    assert!(!bollios.current().flag().active);
    assert_eq!(cv.current().mode(), None);
}

#[tokio::test]
async fn status_poll_sends_refresh_command_on_interval() {
    let mut backend = TestBackend::spawn().await;
    let channel = CommandChannel::new(options(&backend.url, Duration::from_secs(5)));

    let poll = spawn_status_poll(
        Arc::clone(&channel),
        Command::raw("bolliOsStatus"),
        Duration::from_millis(100),
    );

    assert_eq!(backend.next_frame().await, "admin:123456");
    assert_eq!(backend.next_frame().await, "bolliOsStatus");
    assert_eq!(backend.next_frame().await, "bolliOsStatus");
    poll.abort();
}

#[tokio::test]
async fn status_poll_ends_when_channel_shuts_down() {
    let url = unused_ws_url().await;
    let channel = CommandChannel::new(options(&url, Duration::from_secs(30)));
    channel.shutdown().await;

    let poll = spawn_status_poll(
        Arc::clone(&channel),
        Command::raw("bolliOsStatus"),
        Duration::from_millis(20),
    );

    timeout(WAIT, poll)
        .await
        .expect("poll stops")
        .expect("poll task did not panic");
}

#[tokio::test]
async fn zero_poll_interval_is_clamped() {
    let mut backend = TestBackend::spawn().await;
    let channel = CommandChannel::new(options(&backend.url, Duration::from_secs(5)));

    let poll = spawn_status_poll(
        Arc::clone(&channel),
        Command::raw("bolliOsStatus"),
        Duration::ZERO,
    );

    assert_eq!(backend.next_frame().await, "admin:123456");
    assert_eq!(backend.next_frame().await, "bolliOsStatus");
    channel.shutdown().await;
    timeout(WAIT, poll)
        .await
        .expect("poll stops")
        .expect("poll task did not panic");
}
