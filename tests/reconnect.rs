mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;

use extension_bus::interfaces::diagnostics::Diagnostic;
use extension_bus::interfaces::transport::Visibility;
use extension_bus::{LinkState, LocalRuntime, MessageType};

use common::{hub, page, wait_until, Recorder};

#[tokio::test(start_paused = true)]
async fn channel_is_reopened_after_the_fixed_delay() {
    let runtime = LocalRuntime::new();
    let background = hub(&runtime);
    let sidepanel = page(&runtime, "sidepanel");
    let seen = Recorder::new();
    sidepanel.endpoint.on_message(MessageType::PageData, seen.handler());
    sidepanel.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.listen_for_connections().unwrap();

    let mut link = sidepanel.endpoint.keep_connected("sidepanel", None).unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    assert_eq!(link.attempts(), 1);
    wait_until(|| background.endpoint.is_connected("sidepanel")).await;
    let first_id = sidepanel.endpoint.channel("sidepanel").unwrap().id();

    let dropped_at = Instant::now();
    assert!(background.endpoint.disconnect("sidepanel"));
    link.wait_for(LinkState::Disconnected).await.unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    assert!(dropped_at.elapsed() >= Duration::from_millis(2000));
    assert!(dropped_at.elapsed() < Duration::from_millis(2100));
    assert_eq!(link.attempts(), 2);

    let second_id = sidepanel.endpoint.channel("sidepanel").unwrap().id();
    assert_ne!(first_id, second_id);
    wait_until(|| background.endpoint.is_connected("sidepanel")).await;

    background
        .endpoint
        .send_message("sidepanel", MessageType::PageData, json!({"message": "after"}), None)
        .unwrap();
    wait_until(|| seen.len() == 1).await;
    assert_eq!(seen.payloads(), vec![json!({"message": "after"})]);

    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn retries_continue_until_a_hub_appears() {
    let runtime = LocalRuntime::new();
    let sidepanel = page(&runtime, "sidepanel");
    sidepanel.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));

    let mut link = sidepanel.endpoint.keep_connected("sidepanel", None).unwrap();
    tokio::time::sleep(Duration::from_millis(6500)).await;
    // Immediate attempt plus one every two seconds.
    assert_eq!(link.attempts(), 4);
    assert_ne!(link.state(), LinkState::Connected);

    let background = hub(&runtime);
    background.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.listen_for_connections().unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    wait_until(|| background.endpoint.is_connected("sidepanel")).await;
    assert_eq!(link.attempts(), 5);
    assert!(sidepanel.count(|d| matches!(d, Diagnostic::TransportDisconnect { .. })) >= 4);
}

#[tokio::test(start_paused = true)]
async fn becoming_visible_reconnects_without_waiting() {
    let runtime = LocalRuntime::new();
    let background = hub(&runtime);
    let sidepanel = page(&runtime, "sidepanel");
    sidepanel.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.listen_for_connections().unwrap();

    let (visibility, signal) = watch::channel(Visibility::Visible);
    let mut link = sidepanel
        .endpoint
        .keep_connected("sidepanel", Some(signal))
        .unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    wait_until(|| background.endpoint.is_connected("sidepanel")).await;

    visibility.send_replace(Visibility::Hidden);
    let dropped_at = Instant::now();
    background.endpoint.disconnect("sidepanel");
    link.wait_for(LinkState::Disconnected).await.unwrap();

    visibility.send_replace(Visibility::Visible);
    link.wait_for(LinkState::Connected).await.unwrap();
    assert!(dropped_at.elapsed() < Duration::from_millis(2000));
    assert_eq!(link.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn visibility_changes_while_connected_do_not_skip_the_delay() {
    let runtime = LocalRuntime::new();
    let background = hub(&runtime);
    let sidepanel = page(&runtime, "sidepanel");
    sidepanel.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.listen_for_connections().unwrap();

    let (visibility, signal) = watch::channel(Visibility::Visible);
    let mut link = sidepanel
        .endpoint
        .keep_connected("sidepanel", Some(signal))
        .unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    wait_until(|| background.endpoint.is_connected("sidepanel")).await;

    visibility.send_replace(Visibility::Hidden);
    visibility.send_replace(Visibility::Visible);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dropped_at = Instant::now();
    background.endpoint.disconnect("sidepanel");
    link.wait_for(LinkState::Disconnected).await.unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    assert!(dropped_at.elapsed() >= Duration::from_millis(2000));
    assert_eq!(link.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn stopping_ends_reconnection() {
    let runtime = LocalRuntime::new();
    let background = hub(&runtime);
    let sidepanel = page(&runtime, "sidepanel");
    sidepanel.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.on_message(MessageType::InitPort, |_, _, _| Ok(()));
    background.endpoint.listen_for_connections().unwrap();

    let mut link = sidepanel.endpoint.keep_connected("sidepanel", None).unwrap();
    link.wait_for(LinkState::Connected).await.unwrap();
    wait_until(|| background.endpoint.is_connected("sidepanel")).await;
    drop(link);

    background.endpoint.disconnect("sidepanel");
    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert!(!sidepanel.endpoint.is_connected("sidepanel"));
    assert!(!background.endpoint.is_connected("sidepanel"));
}
