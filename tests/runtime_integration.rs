//! Integration tests for the assembled event runtime.
//!
//! Tests verify:
//! 1. `circuit.*` control events drive the shared breaker registry
//! 2. Open breakers serve registered fallbacks through the runtime caller
//! 3. Breaker transitions and DLQ pressure are reported on their channels
//! 4. Lifecycle: reset_all, shutdown and dispose

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use bulwark::domain::models::dead_letter::{DeadLetterAlert, DeadLetterFilter};
use bulwark::domain::ports::clock::ManualClock;
use bulwark::domain::ports::handler::CallContext;
use bulwark::services::{CachedValue, DefaultMessage, HandlerOptions};
use bulwark::{
    CircuitState, Config, ErrorCode, Event, EventRuntime, Fallback, RuntimeError,
};

fn runtime(config: Config) -> EventRuntime {
    EventRuntime::builder(config)
        .clock(Arc::new(ManualClock::new()))
        .build()
}

fn control(op: &str, data: Value) -> Event {
    Event::new(format!("circuit.{op}"), "ops", data)
}

#[tokio::test]
async fn test_control_events_round_trip_through_processor() {
    let runtime = runtime(Config::default());

    let opened = runtime
        .processor()
        .dispatch(&control(
            "forceOpen",
            json!({ "breakerName": "tool:search", "reason": "vendor outage" }),
        ))
        .await
        .unwrap();
    assert_eq!(opened["breakerName"], "tool:search");
    assert_eq!(opened["state"], "OPEN");

    let status = runtime
        .processor()
        .dispatch(&control("status", json!({ "breakerName": "tool:search" })))
        .await
        .unwrap();
    let reason = status["metrics"]["stateChanges"][0]["reason"]
        .as_str()
        .unwrap();
    assert!(reason.contains("vendor outage"));

    let health = runtime
        .processor()
        .dispatch(&control("status", Value::Null))
        .await
        .unwrap();
    assert_eq!(health["healthy"], false);
    assert_eq!(health["open"], 1);

    let closed = runtime
        .processor()
        .dispatch(&control("forceClosed", json!({ "breakerName": "tool:search" })))
        .await
        .unwrap();
    assert_eq!(closed["state"], "CLOSED");

    let reset = runtime
        .processor()
        .dispatch(&control("reset", Value::Null))
        .await
        .unwrap();
    assert_eq!(reset, json!({ "reset": ["tool:search"] }));
}

#[tokio::test]
async fn test_invalid_control_events_are_dead_lettered() {
    let runtime = runtime(Config::default());
    runtime
        .publish(control("forceOpen", json!({ "reason": "no name" })), None)
        .await
        .unwrap();
    runtime
        .publish(control("explode", Value::Null), None)
        .await
        .unwrap();
    runtime
        .publish(control("reset", json!({ "breakerName": "missing" })), None)
        .await
        .unwrap();

    runtime.processor().run_until_idle().await;

    let parked = runtime.dead_letters().list(&DeadLetterFilter::new());
    assert_eq!(parked.len(), 3);
    let mut reasons: Vec<&str> = parked
        .iter()
        .map(|item| item.failure_reason.split(':').next().unwrap_or_default())
        .collect();
    reasons.sort_unstable();
    assert_eq!(
        reasons,
        vec!["NOT_FOUND", "VALIDATION_ERROR", "VALIDATION_ERROR"]
    );
    assert!(parked.iter().all(|item| item.attempts == 1));
}

#[tokio::test]
async fn test_open_breaker_serves_registered_fallback() {
    let runtime = runtime(Config::default());
    runtime.fallbacks().register(
        "tool:*",
        Arc::new(DefaultMessage::text("search is unavailable")) as Arc<dyn Fallback>,
    );
    runtime
        .breakers()
        .force_open("tool:search", "maintenance")
        .await;

    let caller = runtime.caller();
    let ctx = CallContext::new("tool:search");
    let value = caller
        .call(&ctx, || async { Ok(json!("live result")) })
        .await
        .unwrap();
    assert_eq!(value, json!("search is unavailable"));

    // Without a matching strategy the rejection surfaces.
    runtime.breakers().force_open("db:orders", "maintenance").await;
    let err = caller
        .call(&CallContext::new("db:orders"), || async { Ok(json!(1)) })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
}

#[tokio::test]
async fn test_cached_value_fallback_replays_last_success() {
    let runtime = runtime(Config::default());
    let cache = Arc::new(CachedValue::new(runtime.clock().clone()));
    runtime
        .fallbacks()
        .register("api:weather", cache.clone() as Arc<dyn Fallback>);
    let caller = runtime.caller();
    let ctx = CallContext::new("api:weather");

    let live = caller
        .call(&ctx, || async { Ok(json!({ "temp": 21 })) })
        .await
        .unwrap();
    assert_eq!(live, json!({ "temp": 21 }));

    runtime.breakers().force_open("api:weather", "rate limited").await;
    let cached = caller
        .call(&ctx, || async {
            Err::<Value, RuntimeError>(RuntimeError::handler("not reached"))
        })
        .await
        .unwrap();
    assert_eq!(cached, json!({ "temp": 21 }));

    let cold = caller
        .call(&CallContext::new("api:weather").with_cache_key("elsewhere"), || async {
            Ok(json!(null))
        })
        .await
        .unwrap_err();
    assert_eq!(cold.code(), ErrorCode::FallbackFailed);
}

#[tokio::test]
async fn test_state_changes_and_dlq_alerts_are_published() {
    let mut config = Config::default();
    config.dead_letter.max_dlq_size = 2;
    config.dead_letter.alert_threshold = 2;

    let (state_tx, mut state_rx) = mpsc::channel(16);
    let (alert_tx, mut alert_rx) = mpsc::channel(16);
    let runtime = EventRuntime::builder(config)
        .clock(Arc::new(ManualClock::new()))
        .state_sender(state_tx)
        .alert_sender(alert_tx)
        .build();

    runtime.breakers().force_open("tool:search", "drill").await;
    let changed = state_rx.recv().await.unwrap();
    assert_eq!(changed.breaker, "tool:search");
    assert_eq!(changed.change.to, CircuitState::Open);

    let mut ids = Vec::new();
    for n in 0..3 {
        let event = Event::new("unrouted.kind", format!("t-{n}"), json!({}));
        ids.push(event.id);
        runtime.publish(event, None).await.unwrap();
    }
    runtime.processor().run_until_idle().await;

    assert_eq!(
        alert_rx.recv().await.unwrap(),
        DeadLetterAlert::ThresholdExceeded {
            size: 2,
            threshold: 2
        }
    );
    assert_eq!(
        alert_rx.recv().await.unwrap(),
        DeadLetterAlert::Evicted {
            event_id: ids[0],
            event_type: "unrouted.kind".to_string()
        }
    );
    assert_eq!(runtime.dead_letters().len(), 2);
    assert!(!runtime.dead_letters().contains(ids[0]));
    assert_eq!(runtime.dead_letters().stats().evicted, 1);
}

#[tokio::test]
async fn test_reset_all_and_dispose() {
    let runtime = runtime(Config::default());
    let (handler, _calls) = common::failing_handler("planner");
    runtime.register_handler(
        "agent.*",
        handler,
        HandlerOptions::new().breaker("agent:planner"),
    );
    runtime.breakers().force_open("agent:planner", "drill").await;
    runtime.breakers().force_open("tool:search", "drill").await;

    runtime.reset_all().await;
    let health = runtime.breakers().health().await;
    assert!(health.healthy);
    assert_eq!(health.closed, 2);
    assert!(health
        .breakers
        .values()
        .all(|metrics| metrics.total_requests == 0));

    runtime.start().await;
    assert!(runtime.snapshot().running);
    runtime.dispose().await;
    assert!(!runtime.snapshot().running);
    assert!(runtime.breakers().names().await.is_empty());

    let err = runtime
        .publish(Event::new("agent.start", "t", json!({})), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueClosed);
}
