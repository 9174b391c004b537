mod common;

use common::fast_queue_config;
use pgjobq::{JobError, NotificationHub, NotificationKind, QueueHandle};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

#[sqlx::test(migrations = "./migrations")]
async fn send_then_receive_then_ack_round_trip(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    let sent = queue.send(b"hello").await.unwrap();

    let jobs = queue.receive(1, CancellationToken::new()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.id(), sent.id());
    assert_eq!(job.body(), b"hello");

    job.acquire().await.unwrap();
    job.ack().await.unwrap();

    let stats = queue.statistics().await.unwrap();
    assert_eq!(stats.total_messages_in_queue, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn nacked_message_is_immediately_redeliverable(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    queue.send(b"retry-me").await.unwrap();

    let first = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();
    first.acquire().await.unwrap();
    first.nack().await.unwrap();

    let second = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();
    assert_eq!(second.id(), first.id());
}

#[sqlx::test(migrations = "./migrations")]
async fn double_acquire_fails_with_already_processing(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    queue.send(b"payload").await.unwrap();
    let job = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();

    job.acquire().await.unwrap();
    let err = job.acquire().await.unwrap_err();
    assert!(matches!(err, JobError::AlreadyProcessing(id) if id == job.id()));
}

#[sqlx::test(migrations = "./migrations")]
async fn ack_after_ack_fails_with_already_completed(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    queue.send(b"payload").await.unwrap();
    let job = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();

    job.acquire().await.unwrap();
    job.ack().await.unwrap();

    let err = job.ack().await.unwrap_err();
    assert!(matches!(err, JobError::AlreadyCompleted(id) if id == job.id()));
}

#[sqlx::test(migrations = "./migrations")]
async fn ack_without_acquire_fails_with_not_acquired(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    queue.send(b"payload").await.unwrap();
    let job = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();

    let err = job.ack().await.unwrap_err();
    assert!(matches!(err, JobError::NotAcquired(id) if id == job.id()));
}

#[sqlx::test(migrations = "./migrations")]
async fn acquire_after_receive_session_exits_fails_with_no_longer_available(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    queue.send(b"payload").await.unwrap();

    let batch = queue.receive(1, CancellationToken::new()).await.unwrap();
    let job = std::sync::Arc::clone(batch.get(0).unwrap());
    drop(batch);

    // Give the batch's best-effort nack-on-exit task a moment to run.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let err = job.acquire().await.unwrap_err();
    assert!(matches!(err, JobError::NoLongerAvailable(id) if id == job.id()));
}

#[sqlx::test(migrations = "./migrations")]
async fn message_never_acquired_is_redelivered_as_soon_as_receive_session_exits(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    let sent = queue.send(b"interrupted").await.unwrap();

    {
        let batch = queue.receive(1, CancellationToken::new()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(0).unwrap().id(), sent.id());
        // Dropped here without ever calling acquire() - the session should
        // nack it immediately rather than leaving it to the full ack
        // deadline (several minutes, per fast_queue_config's retention).
    }

    let redelivered = tokio::time::timeout(std::time::Duration::from_millis(100), async {
        loop {
            if let Some(job) = queue.receive_one(CancellationToken::new()).await.unwrap() {
                return job;
            }
        }
    })
    .await
    .expect("message was not redelivered promptly after the receive session exited");

    assert_eq!(redelivered.id(), sent.id());
}

#[sqlx::test(migrations = "./migrations")]
async fn publish_to_nonexistent_queue_fails(pool: PgPool) {
    // connect_to_queue always ensures the queue exists, so reaching the
    // "queue not found" path means calling the data-access layer directly
    // against a name nothing ever created.
    let err = pgjobq::test_support::data_access::publish(&pool, "ghost", uuid::Uuid::new_v4(), b"x", None)
        .await
        .unwrap_err();
    assert!(matches!(err, pgjobq::QueueError::QueueNotFound(name) if name == "ghost"));
}

#[sqlx::test(migrations = "./migrations")]
async fn receive_from_nonexistent_queue_yields_nothing_rather_than_erroring(pool: PgPool) {
    let rows = pgjobq::test_support::data_access::poll(&pool, "ghost", 10, false)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn fifo_queue_delivers_in_publish_order(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), true)
        .await
        .unwrap();

    let first = queue.send(b"first").await.unwrap();
    let second = queue.send(b"second").await.unwrap();

    let jobs = queue.receive(2, CancellationToken::new()).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id(), first.id());
    assert_eq!(jobs[1].id(), second.id());
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_receivers_never_get_the_same_message(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    for i in 0..10 {
        queue.send(format!("job-{i}").as_bytes()).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..5 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .receive(2, CancellationToken::new())
                .await
                .unwrap()
                .into_iter()
                .map(|job| job.id())
                .collect::<Vec<_>>()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "message {id} delivered to more than one receiver");
        }
    }
    assert_eq!(seen.len(), 10);
}

#[sqlx::test(migrations = "./migrations")]
async fn wait_for_completion_resolves_after_ack(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    let sent = queue.send(b"payload").await.unwrap();

    let job = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();
    let acker = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        job.acquire().await.unwrap();
        job.ack().await.unwrap();
    });

    sent.wait_for_completion(Some(std::time::Duration::from_millis(10)))
        .await
        .unwrap();
    acker.await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn wait_for_completion_instant_poll_returns_immediately_if_already_done(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    let sent = queue.send(b"payload").await.unwrap();
    let job = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();
    job.acquire().await.unwrap();
    job.ack().await.unwrap();

    sent.wait_for_completion(Some(std::time::Duration::ZERO))
        .await
        .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn wait_for_any_resolves_on_matching_notification(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    let hub = NotificationHub::connect(&pool, CancellationToken::new()).await.unwrap();

    let waiter = tokio::spawn({
        let hub = hub.clone();
        async move {
            hub.wait_for_any(NotificationKind::NewJob, std::time::Duration::from_secs(1))
                .await
        }
    });

    // Give the waiter a moment to subscribe before the notification fires.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    queue.send(b"payload").await.unwrap();

    let event = waiter.await.unwrap();
    assert!(matches!(event, Some(pgjobq::NotificationEvent::NewJob { .. })));
}

#[sqlx::test(migrations = "./migrations")]
async fn wait_for_any_times_out_with_no_matching_notification(pool: PgPool) {
    let hub = NotificationHub::connect(&pool, CancellationToken::new()).await.unwrap();

    let event = hub
        .wait_for_any(NotificationKind::NewJob, std::time::Duration::from_millis(50))
        .await;
    assert!(event.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn statistics_are_monotonic_across_the_lifecycle(pool: PgPool) {
    let queue = QueueHandle::connect_to_queue_with_pool(pool.clone(), "orders", fast_queue_config(), false)
        .await
        .unwrap();

    let before = queue.statistics().await.unwrap();
    assert_eq!(before.total_messages_in_queue, 0);
    assert_eq!(before.undelivered_messages, 0);

    queue.send(b"a").await.unwrap();
    queue.send(b"b").await.unwrap();

    let after_send = queue.statistics().await.unwrap();
    assert_eq!(after_send.total_messages_in_queue, 2);
    assert_eq!(after_send.undelivered_messages, 2);

    let job = queue.receive_one(CancellationToken::new()).await.unwrap().unwrap();

    let after_receive = queue.statistics().await.unwrap();
    assert_eq!(after_receive.total_messages_in_queue, 2);
    assert_eq!(after_receive.undelivered_messages, 1);

    job.acquire().await.unwrap();
    job.ack().await.unwrap();

    let after_ack = queue.statistics().await.unwrap();
    assert_eq!(after_ack.total_messages_in_queue, 1);
    assert_eq!(after_ack.undelivered_messages, 1);
}
