//! End-to-end delivery scenarios against an isolated database and mock
//! worker endpoints: the happy path, retry flows, fan-out, delayed
//! visibility, and multi-dispatcher contention over one queue.

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryState, MessageId, NewMessage, Visibility};
use courier_dispatch::{DispatchConfig, Dispatcher};
use serde_json::json;
use test_harness::TestEnv;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn dispatcher_for(env: &TestEnv) -> Dispatcher {
    Dispatcher::new(
        env.storage().clone(),
        DispatchConfig::default(),
        Arc::new(env.clock.clone()) as Arc<dyn Clock>,
    )
    .expect("dispatcher creation should succeed")
}

#[tokio::test]
async fn happy_path_publish_tick_acknowledge() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::body_json(json!({"n": 1})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 10).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();

    let message_id = env
        .publish(NewMessage::new(MessageId::new(), "order.created", json!({"n": 1})))
        .await
        .unwrap();

    dispatcher_for(&env).tick(queue).await.unwrap();

    let row = env.storage().deliveries.find_for_message(queue, message_id).await.unwrap().unwrap();
    assert_eq!(row.state(), DeliveryState::Acknowledged);
    assert!(row.acknowledged_at.is_some());
    assert!(env.storage().deliveries.list_dead_letters(queue, 10).await.unwrap().is_empty());

    mock_server.verify().await;
}

#[tokio::test]
async fn two_failures_then_success_makes_three_posts() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 10).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();
    let message_id = env.publish_json("order.created", json!({"n": 1})).await.unwrap();

    let dispatcher = dispatcher_for(&env);
    for _ in 0..3 {
        dispatcher.tick(queue).await.unwrap();
    }

    let row = env.storage().deliveries.find_for_message(queue, message_id).await.unwrap().unwrap();
    assert_eq!(row.state(), DeliveryState::Acknowledged);
    assert_eq!(row.retries, 2);
    assert!(env.storage().deliveries.list_dead_letters(queue, 10).await.unwrap().is_empty());

    mock_server.verify().await;
}

#[tokio::test]
async fn permanent_failure_lands_in_the_dead_letter_queue() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 10).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 2, worker).await.unwrap();
    let message_id = env.publish_json("order.created", json!({"n": 1})).await.unwrap();

    let dispatcher = dispatcher_for(&env);
    for _ in 0..3 {
        dispatcher.tick(queue).await.unwrap();
    }

    assert!(env
        .storage()
        .deliveries
        .find_for_message(queue, message_id)
        .await
        .unwrap()
        .is_none());

    let dead = env.storage().deliveries.list_dead_letters(queue, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, message_id);
    assert_eq!(dead[0].retries, 2);

    mock_server.verify().await;
}

#[tokio::test]
async fn fan_out_reaches_exactly_the_matching_queues() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let worker = env.create_worker("w", "http://127.0.0.1:1/hook", 10).await.unwrap();
    let q1 = env.create_queue("orders", "order.*", 3, worker).await.unwrap();
    let q2 = env.create_queue("firehose", "*", 3, worker).await.unwrap();
    let q3 = env.create_queue("payments", "payment.*", 3, worker).await.unwrap();

    env.publish_json("order.created", json!({"n": 1})).await.unwrap();

    assert_eq!(env.storage().deliveries.find_for_queue(q1).await.unwrap().len(), 1);
    assert_eq!(env.storage().deliveries.find_for_queue(q2).await.unwrap().len(), 1);
    assert_eq!(env.storage().deliveries.find_for_queue(q3).await.unwrap().len(), 0);
}

#[tokio::test]
async fn delayed_message_is_leased_only_after_its_window() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 10).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();

    env.publish(
        NewMessage::new(MessageId::new(), "order.created", json!({"n": 1}))
            .with_visibility(Visibility::After(10)),
    )
    .await
    .unwrap();

    let dispatcher = dispatcher_for(&env);

    // Ticks at t+1 .. t+9 observe nothing leasable.
    for _ in 0..9 {
        env.advance_time(Duration::from_secs(1));
        assert_eq!(dispatcher.tick(queue).await.unwrap().leased, 0);
    }

    // The tick at t+10 leases and delivers it.
    env.advance_time(Duration::from_secs(1));
    let summary = dispatcher.tick(queue).await.unwrap();
    assert_eq!(summary.leased, 1);
    assert_eq!(summary.acknowledged, 1);

    mock_server.verify().await;
}

#[tokio::test]
async fn concurrent_dispatchers_deliver_every_message_exactly_once() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(100)
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 50).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();

    for n in 0..100 {
        env.publish_json("order.created", json!({ "n": n })).await.unwrap();
    }

    // Two dispatcher instances over the same store tick the same queue
    // simultaneously; skip-locked leasing must hand them disjoint rows.
    let first = dispatcher_for(&env);
    let second = dispatcher_for(&env);

    let (a, b) = tokio::join!(first.tick(queue), second.tick(queue));
    let mut leased_total = a.unwrap().leased + b.unwrap().leased;

    // Drain whatever the contended ticks left behind.
    while leased_total < 100 {
        let summary = first.tick(queue).await.unwrap();
        if summary.leased == 0 {
            break;
        }
        leased_total += summary.leased;
    }
    assert_eq!(leased_total, 100);

    let depth = env.storage().deliveries.queue_depth(queue).await.unwrap();
    assert_eq!(depth.acknowledged, 100);
    assert_eq!(depth.pending, 0);
    assert_eq!(depth.leased, 0);
    assert_eq!(depth.dead_lettered, 0);

    // Every message was posted exactly once.
    let requests =
        mock_server.received_requests().await.expect("request recording should be enabled");
    assert_eq!(requests.len(), 100);
    let distinct: HashSet<String> =
        requests.iter().map(|r| String::from_utf8_lossy(&r.body).into_owned()).collect();
    assert_eq!(distinct.len(), 100, "no message may be delivered twice");

    mock_server.verify().await;
}

#[tokio::test]
async fn crashed_dispatcher_lease_is_recovered_and_message_still_arrives() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 10).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();
    let message_id = env.publish_json("order.created", json!({"n": 1})).await.unwrap();

    // A dispatcher leases the row and crashes before resolving it.
    let stranded = env.storage().deliveries.lease_batch(queue, 10, env.now()).await.unwrap();
    assert_eq!(stranded.len(), 1);

    // Before the lease timeout the row stays locked and untouchable.
    let dispatcher = dispatcher_for(&env);
    let summary = dispatcher.tick(queue).await.unwrap();
    assert_eq!(summary.leased, 0);

    // After the timeout the sweep frees it and the same tick delivers it.
    env.advance_time(Duration::from_secs(61));
    let summary = dispatcher.tick(queue).await.unwrap();
    assert_eq!(summary.recovered.retried, 1);
    assert_eq!(summary.acknowledged, 1);

    let row = env.storage().deliveries.find_for_message(queue, message_id).await.unwrap().unwrap();
    assert_eq!(row.state(), DeliveryState::Acknowledged);

    mock_server.verify().await;
}

#[tokio::test]
async fn rate_limit_caps_posts_per_tick() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let worker = env.create_worker("w", &mock_server.uri(), 3).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();

    for n in 0..10 {
        env.publish_json("order.created", json!({ "n": n })).await.unwrap();
    }

    let dispatcher = dispatcher_for(&env);
    dispatcher.tick(queue).await.unwrap();

    // One tick, at most rps posts.
    let requests =
        mock_server.received_requests().await.expect("request recording should be enabled");
    assert_eq!(requests.len(), 3);
}
