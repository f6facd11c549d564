use std::sync::Arc;

use super::*;
use crate::{
    config::EngineSettings,
    error::ErrorCategory,
    test_support::{channel, ids, me, newest_first, notices, payload, plain_engine, Call, ScriptedTransport},
    ClientEvent,
};
use shared::error::{ApiError, ErrorCode};

fn policy() -> RetryPolicy {
    EngineSettings::default().retry_policy()
}

#[test]
fn backoff_grows_linearly() {
    let policy = policy();
    assert_eq!(policy.backoff_for(0), Duration::from_millis(400));
    assert_eq!(policy.backoff_for(1), Duration::from_millis(800));
    assert_eq!(policy.max_attempts(), 3);
}

#[test]
fn only_transient_failures_schedule_a_retry() {
    let policy = policy();
    let state = after_attempt(0, Err(TransportError::Network("reset".into())), &policy, false);
    assert!(matches!(state, FetchState::BackingOff { attempt: 0, delay } if delay == Duration::from_millis(400)));

    let state = after_attempt(
        0,
        Err(TransportError::Rejected(ApiError::new(ErrorCode::Forbidden, "no"))),
        &policy,
        false,
    );
    assert!(matches!(state, FetchState::Done(FetchOutcome::Failed { attempts: 1, .. })));

    let state = after_attempt(2, Err(TransportError::Network("reset".into())), &policy, false);
    assert!(matches!(state, FetchState::Done(FetchOutcome::Failed { attempts: 3, .. })));
}

#[test]
fn cancellation_discards_even_a_successful_attempt() {
    let state = after_attempt(0, Ok(vec![payload(1, &channel())]), &policy(), true);
    assert!(matches!(state, FetchState::Done(FetchOutcome::Cancelled)));
}

#[tokio::test]
async fn full_page_in_server_order_is_stored_chronologically() {
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(1..=50, &channel())));
    let engine = plain_engine(&transport);

    let outcome = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect("load");

    assert_eq!(outcome, PageOutcome::Loaded { count: 50, has_more: true });
    let expected: Vec<String> = (1..=50).map(|id| id.to_string()).collect();
    assert_eq!(ids(&engine.messages(&channel())), expected);
    assert!(engine.has_more(&channel()));
    assert!(!engine.is_loading(&channel()));
    assert_eq!(
        transport.calls(),
        vec![Call::Fetch(
            channel(),
            MessageQuery {
                before: None,
                after: None,
                limit: 50
            }
        )]
    );
}

#[tokio::test]
async fn short_page_clears_has_more() {
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(1..=49, &channel())));
    let engine = plain_engine(&transport);

    let outcome = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect("load");
    assert_eq!(outcome, PageOutcome::Loaded { count: 49, has_more: false });
    assert!(!engine.has_more(&channel()));
}

#[tokio::test]
async fn older_pages_are_prepended_before_the_oldest_message() {
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(51..=100, &channel())));
    transport.push_page(Ok(newest_first(31..=50, &channel())));
    let engine = plain_engine(&transport);

    engine.load_page(&channel(), PageRequest::latest()).await.expect("first page");
    let outcome = engine.load_older(&channel()).await.expect("older page");

    assert_eq!(outcome, PageOutcome::Loaded { count: 20, has_more: false });
    let timeline = engine.messages(&channel());
    assert_eq!(timeline.len(), 70);
    assert_eq!(timeline.first().map(|m| m.id.to_string()), Some("31".into()));
    assert!(timeline.windows(2).all(|pair| pair[0].id < pair[1].id));
    assert!(matches!(
        transport.calls().last(),
        Some(Call::Fetch(_, MessageQuery { before: Some(before), .. })) if before.as_str() == "51"
    ));

    assert_eq!(engine.load_older(&channel()).await.expect("exhausted"), PageOutcome::Exhausted);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn fresh_load_replaces_the_previous_view() {
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(1..=3, &channel())));
    transport.push_page(Ok(newest_first(10..=11, &channel())));
    let engine = plain_engine(&transport);

    engine.load_page(&channel(), PageRequest::latest()).await.expect("first");
    engine.load_page(&channel(), PageRequest::latest()).await.expect("reload");
    assert_eq!(ids(&engine.messages(&channel())), vec!["10", "11"]);
}

#[tokio::test]
async fn retries_transient_failures_with_linear_backoff() {
    tokio::time::pause();
    let transport = ScriptedTransport::new();
    transport.push_page(Err(TransportError::Timeout(Duration::from_secs(5))));
    transport.push_page(Err(TransportError::Network("connection reset".into())));
    transport.push_page(Ok(newest_first(1..=2, &channel())));
    let engine = plain_engine(&transport);

    let started = tokio::time::Instant::now();
    let outcome = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect("third attempt succeeds");

    assert_eq!(outcome, PageOutcome::Loaded { count: 2, has_more: false });
    assert_eq!(transport.call_count(), 3);
    assert!(started.elapsed() >= Duration::from_millis(1_200));
}

#[tokio::test]
async fn exhausted_retries_surface_a_notice_and_keep_state() {
    tokio::time::pause();
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(1..=5, &channel())));
    for _ in 0..3 {
        transport.push_page(Err(TransportError::Server {
            status: 503,
            message: "unavailable".into(),
        }));
    }
    let engine = plain_engine(&transport);
    engine.load_page(&channel(), PageRequest::latest()).await.expect("seed");
    let before = engine.messages(&channel());
    let mut events = engine.events();

    let error = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect_err("retries exhausted");

    assert!(matches!(error, EngineError::Transient { attempts: 3, .. }));
    assert_eq!(transport.call_count(), 4);
    assert!(Arc::ptr_eq(&before, &engine.messages(&channel())));
    assert!(!engine.is_loading(&channel()));
    assert!(matches!(
        notices(&mut events).as_slice(),
        [ClientEvent::Notice { category: ErrorCategory::TransientNetwork, .. }]
    ));
}

#[tokio::test]
async fn rejected_fetch_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.push_page(Err(TransportError::Rejected(ApiError::new(
        ErrorCode::Forbidden,
        "missing permission",
    ))));
    let engine = plain_engine(&transport);

    let error = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect_err("rejected");
    assert_eq!(error.category(), ErrorCategory::Conflict);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn slow_attempts_time_out_as_transient_failures() {
    tokio::time::pause();
    let transport = ScriptedTransport::new();
    transport.set_fetch_delay(Duration::from_secs(30));
    let settings = EngineSettings {
        max_fetch_retries: 0,
        ..EngineSettings::default()
    };
    let engine = SyncEngine::new(me(), settings, transport.clone());

    let error = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect_err("timed out");
    assert!(matches!(
        error,
        EngineError::Transient { attempts: 1, source: TransportError::Timeout(_) }
    ));
}

#[tokio::test]
async fn second_load_for_the_same_channel_is_a_no_op() {
    tokio::time::pause();
    let transport = ScriptedTransport::new();
    transport.set_fetch_delay(Duration::from_secs(1));
    transport.push_page(Ok(newest_first(1..=3, &channel())));
    let engine = plain_engine(&transport);

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.load_page(&channel(), PageRequest::latest()).await })
    };
    transport.wait_for_calls(1).await;
    assert!(engine.is_loading(&channel()));

    let second = engine
        .load_page(&channel(), PageRequest::latest())
        .await
        .expect("no-op");
    assert_eq!(second, PageOutcome::AlreadyLoading);

    let first = first.await.expect("join").expect("load");
    assert_eq!(first, PageOutcome::Loaded { count: 3, has_more: false });
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn switching_channels_cancels_the_other_fetch_silently() {
    tokio::time::pause();
    let other = shared::domain::ChannelId::from("101");
    let transport = ScriptedTransport::new();
    transport.set_fetch_delay(Duration::from_secs(2));
    transport.push_page(Ok(newest_first(1..=3, &channel())));
    transport.push_page(Ok(newest_first(7..=8, &other)));
    let engine = plain_engine(&transport);
    let mut events = engine.events();

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.load_page(&channel(), PageRequest::latest()).await })
    };
    transport.wait_for_calls(1).await;

    let switched = engine
        .load_page(&other, PageRequest::latest())
        .await
        .expect("other channel loads");
    assert_eq!(switched, PageOutcome::Loaded { count: 2, has_more: false });

    let cancelled = first.await.expect("join").expect("cancellation is not an error");
    assert_eq!(cancelled, PageOutcome::Cancelled);
    assert!(engine.messages(&channel()).is_empty());
    assert!(!engine.is_loading(&channel()));
    assert!(notices(&mut events).is_empty());
}

#[tokio::test]
async fn cancellation_during_backoff_stops_retrying() {
    tokio::time::pause();
    let transport = ScriptedTransport::new();
    transport.push_page(Err(TransportError::Network("offline".into())));
    transport.push_page(Ok(newest_first(1..=3, &channel())));
    let engine = plain_engine(&transport);

    let load = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.load_page(&channel(), PageRequest::latest()).await })
    };
    transport.wait_for_calls(1).await;
    engine.cancel_load(&channel());

    let outcome = load.await.expect("join").expect("cancelled quietly");
    assert_eq!(outcome, PageOutcome::Cancelled);
    assert_eq!(transport.call_count(), 1);
    assert!(!engine.is_loading(&channel()));
}

#[tokio::test]
async fn explicit_limit_drives_the_has_more_heuristic() {
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(1..=10, &channel())));
    let engine = plain_engine(&transport);

    let outcome = engine
        .load_page(
            &channel(),
            PageRequest {
                limit: Some(10),
                ..PageRequest::default()
            },
        )
        .await
        .expect("load");
    assert_eq!(outcome, PageOutcome::Loaded { count: 10, has_more: true });
}

#[tokio::test]
async fn shutdown_cancels_loads_and_clears_the_session() {
    tokio::time::pause();
    let other = shared::domain::ChannelId::from("101");
    let transport = ScriptedTransport::new();
    transport.push_page(Ok(newest_first(1..=3, &channel())));
    let engine = plain_engine(&transport);
    engine.load_page(&channel(), PageRequest::latest()).await.expect("seed");

    transport.set_fetch_delay(Duration::from_secs(2));
    let load = {
        let engine = engine.clone();
        let other = other.clone();
        tokio::spawn(async move { engine.load_page(&other, PageRequest::latest()).await })
    };
    transport.wait_for_calls(2).await;
    engine.shutdown();

    let outcome = load.await.expect("join").expect("cancelled quietly");
    assert_eq!(outcome, PageOutcome::Cancelled);
    assert!(engine.messages(&channel()).is_empty());
    assert!(engine.messages(&other).is_empty());
}
