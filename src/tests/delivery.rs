// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::harness::{eventually, supervisor, FakeBroker, RecordingHandler};
use crate::publisher::{PublishOptions, AMQP_HEADERS_MAX_RETRIES};
use lapin::types::AMQPValue;
use opentelemetry::Context;
use serde_json::json;
use std::{collections::BTreeMap, time::Duration};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn successful_handler_is_acked_once() {
    let broker = FakeBroker::new();
    let handler = RecordingHandler::succeeding();
    let supervisor = supervisor(&broker, &[("on_search", handler.clone())]);
    supervisor.reconcile().await.unwrap();

    assert!(
        supervisor
            .publisher()
            .publish_json(&Context::new(), "on_search", &json!({"x": 1}), PublishOptions::default())
            .await
    );

    eventually(|| broker.acks() == 1).await;
    settle().await;

    let seen = handler.seen();
    assert_eq!(handler.calls(), 1);
    assert_eq!(seen[0].queue, "on_search");
    assert_eq!(seen[0].body, json!({"x": 1}));
    assert_eq!(seen[0].retry_count, 1);
    assert_eq!(seen[0].max_retries, 3);
    assert!(broker.stored("on_search.dlq").is_empty());
}

#[tokio::test]
async fn failing_handler_is_dead_lettered_after_max_retries() {
    let broker = FakeBroker::new();
    let handler = RecordingHandler::failing(4);
    let supervisor = supervisor(&broker, &[("on_init", handler.clone())]);
    supervisor.reconcile().await.unwrap();

    supervisor
        .publisher()
        .publish_json(&Context::new(), "on_init", &json!({"order": "A-1"}), PublishOptions::default())
        .await;

    eventually(|| broker.stored("on_init.dlq").len() == 1).await;
    settle().await;

    assert_eq!(handler.calls(), 3);
    assert_eq!(
        handler.seen().iter().map(|m| m.retry_count).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(broker.acks(), 0);

    let dead = &broker.stored("on_init.dlq")[0];
    assert_eq!(dead.json(), json!({"order": "A-1"}));
    assert_eq!(dead.header(AMQP_HEADERS_MAX_RETRIES), Some(&AMQPValue::LongInt(3)));
}

#[tokio::test]
async fn handler_recovering_on_retry_is_acked() {
    let broker = FakeBroker::new();
    let handler = RecordingHandler::failing(1);
    let supervisor = supervisor(&broker, &[("on_select", handler.clone())]);
    supervisor.reconcile().await.unwrap();

    supervisor
        .publisher()
        .publish_json(&Context::new(), "on_select", &json!({"item": 7}), PublishOptions::default())
        .await;

    eventually(|| broker.acks() == 1).await;
    settle().await;

    assert_eq!(handler.calls(), 2);
    assert!(broker.stored("on_select.dlq").is_empty());
}

#[tokio::test]
async fn max_retries_header_is_honored() {
    let broker = FakeBroker::new();
    let handler = RecordingHandler::failing(usize::MAX);
    let supervisor = supervisor(&broker, &[("on_confirm", handler.clone())]);
    supervisor.reconcile().await.unwrap();

    supervisor
        .publisher()
        .publish_json(&Context::new(), "on_confirm", &json!({}), PublishOptions::max_retries(5))
        .await;

    eventually(|| broker.stored("on_confirm.dlq").len() == 1).await;
    settle().await;

    assert_eq!(handler.calls(), 5);
}

#[tokio::test]
async fn invalid_json_is_retried_then_dead_lettered() {
    let broker = FakeBroker::new();
    let handler = RecordingHandler::succeeding();
    let supervisor = supervisor(&broker, &[("on_status", handler.clone())]);
    supervisor.reconcile().await.unwrap();

    supervisor
        .publisher()
        .publish(&Context::new(), "", "on_status", b"not json".to_vec(), BTreeMap::new())
        .await;

    eventually(|| broker.stored("on_status.dlq").len() == 1).await;

    assert_eq!(handler.calls(), 0);
    assert_eq!(broker.stored("on_status.dlq")[0].body, b"not json".to_vec());
}

#[tokio::test]
async fn queues_are_consumed_independently() {
    let broker = FakeBroker::new();
    let search = RecordingHandler::succeeding();
    let init = RecordingHandler::failing(usize::MAX);
    let supervisor = supervisor(
        &broker,
        &[("on_search", search.clone()), ("on_init", init.clone())],
    );
    supervisor.reconcile().await.unwrap();

    let publisher = supervisor.publisher();
    publisher
        .publish_json(&Context::new(), "on_init", &json!({"n": 1}), PublishOptions::default())
        .await;
    publisher
        .publish_json(&Context::new(), "on_search", &json!({"n": 2}), PublishOptions::default())
        .await;

    eventually(|| broker.acks() == 1 && broker.stored("on_init.dlq").len() == 1).await;

    assert_eq!(search.calls(), 1);
    assert_eq!(init.calls(), 3);
}
