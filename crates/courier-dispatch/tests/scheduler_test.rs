//! Integration tests for the scheduler and admin surface: ticker
//! registration, reconciliation against the queue table, and graceful
//! shutdown.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryState, MessageId, NewMessage, QueueId};
use courier_dispatch::{Admin, ClientConfig, DispatchConfig, Dispatcher, Scheduler};
use serde_json::json;
use test_harness::TestEnv;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

/// Fast cadence so scheduler tests finish quickly.
fn test_config() -> DispatchConfig {
    DispatchConfig {
        tick_interval: Duration::from_millis(50),
        sync_interval: Duration::from_millis(100),
        client: ClientConfig { timeout: Duration::from_secs(2), ..Default::default() },
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn engine_for(env: &TestEnv) -> (Arc<Dispatcher>, Scheduler, Admin) {
    let clock = Arc::new(env.clock.clone()) as Arc<dyn Clock>;
    let dispatcher = Arc::new(
        Dispatcher::new(env.storage().clone(), test_config(), clock.clone())
            .expect("dispatcher creation should succeed"),
    );
    let scheduler = Scheduler::new(env.storage().clone(), dispatcher.clone(), test_config());
    let admin = Admin::new(env.storage().clone(), scheduler.clone(), clock);
    (dispatcher, scheduler, admin)
}

/// Polls until the delivery for `message_id` on `queue` is acknowledged.
async fn wait_for_ack(env: &TestEnv, queue: QueueId, message_id: MessageId) -> bool {
    for _ in 0..100 {
        if let Some(row) =
            env.storage().deliveries.find_for_message(queue, message_id).await.unwrap()
        {
            if row.state() == DeliveryState::Acknowledged {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn create_queue_registers_tick_and_message_flows_end_to_end() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::body_json(json!({"n": 1})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (_dispatcher, scheduler, admin) = engine_for(&env);
    scheduler.start().await.unwrap();

    let worker = admin.create_worker("worker", &mock_server.uri(), 10).await.unwrap();
    let queue = admin.create_queue("orders", "order.*", 3, worker).await.unwrap();
    assert_eq!(scheduler.active_queue_count(), 1);

    let message_id = admin
        .publish(NewMessage::new(MessageId::new(), "order.created", json!({"n": 1})))
        .await
        .unwrap();

    assert!(
        wait_for_ack(&env, queue, message_id).await,
        "scheduler-driven ticks should deliver the message without manual ticking"
    );

    scheduler.shutdown().await.unwrap();
    mock_server.verify().await;
}

#[tokio::test]
async fn sync_picks_up_queues_created_outside_the_admin_surface() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let worker = env.create_worker("worker", "http://127.0.0.1:1/hook", 10).await.unwrap();
    env.create_queue("orders", "order.*", 3, worker).await.unwrap();

    let (_dispatcher, scheduler, _admin) = engine_for(&env);
    scheduler.start().await.unwrap();

    // The initial sync registers the pre-existing queue.
    assert_eq!(scheduler.active_queue_count(), 1);

    // A queue inserted behind the scheduler's back is reconciled in.
    env.create_queue("audit", "*", 3, worker).await.unwrap();
    let mut found = false;
    for _ in 0..50 {
        if scheduler.active_queue_count() == 2 {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(found, "sync loop should register externally created queues");

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_queue_stops_its_ticker_before_dropping_rows() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let (_dispatcher, scheduler, admin) = engine_for(&env);
    scheduler.start().await.unwrap();

    let worker = admin.create_worker("worker", "http://127.0.0.1:1/hook", 10).await.unwrap();
    let queue = admin.create_queue("orders", "order.*", 3, worker).await.unwrap();
    assert_eq!(scheduler.active_queue_count(), 1);

    admin.delete_queue(queue).await.unwrap();
    assert_eq!(scheduler.active_queue_count(), 0);
    assert!(env.storage().queues.find_by_id(queue).await.unwrap().is_none());

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_worker_stops_tickers_for_all_its_queues() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let (_dispatcher, scheduler, admin) = engine_for(&env);
    scheduler.start().await.unwrap();

    let worker = admin.create_worker("worker", "http://127.0.0.1:1/hook", 10).await.unwrap();
    admin.create_queue("orders", "order.*", 3, worker).await.unwrap();
    admin.create_queue("audit", "*", 3, worker).await.unwrap();
    assert_eq!(scheduler.active_queue_count(), 2);

    admin.delete_worker(worker).await.unwrap();
    assert_eq!(scheduler.active_queue_count(), 0);
    assert!(env.storage().queues.list().await.unwrap().is_empty());

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn registering_the_same_queue_twice_is_a_no_op() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let worker = env.create_worker("worker", "http://127.0.0.1:1/hook", 10).await.unwrap();
    let queue = env.create_queue("orders", "order.*", 3, worker).await.unwrap();

    let (_dispatcher, scheduler, _admin) = engine_for(&env);
    assert!(scheduler.register(queue).await);
    assert!(!scheduler.register(queue).await);
    assert_eq!(scheduler.active_queue_count(), 1);

    assert!(scheduler.deregister(queue).await);
    assert!(!scheduler.deregister(queue).await);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_without_start_completes_immediately() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let (_dispatcher, scheduler, _admin) = engine_for(&env);
    scheduler.shutdown().await.expect("idle shutdown should succeed");
}
