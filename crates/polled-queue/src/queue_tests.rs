//! Tests for the queue adapter.

use super::*;
use crate::envelope::encode_message;
use crate::error::NotFoundReason;
use crate::remote::{InMemoryRemote, MAX_DELAY_SECONDS};
use crate::test_support::{server_error, RecordingRemote};

fn test_options() -> QueueOptions {
    let mut options = QueueOptions::default();
    options.add.min_backoff_ms = 1;
    options.delete.min_backoff_ms = 1;
    options
}

fn build(remote: &Arc<RecordingRemote>) -> PolledQueue {
    PolledQueue::builder(remote.clone(), test_options())
        .build()
        .expect("valid options")
}

fn not_found(reason: NotFoundReason, message: &str) -> RemoteError {
    RemoteError::NotFound {
        reason,
        message: message.to_string(),
    }
}

// ============================================================================
// Add
// ============================================================================

mod add {
    use super::*;

    /// Verify an empty task name fails fast with no remote call.
    #[tokio::test]
    async fn test_task_name_required() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        let mut message = Message::new("", &b"payload"[..]);
        let err = queue.add(&mut message).await.unwrap_err();
        queue.close().await.unwrap();

        assert!(matches!(err, QueueError::TaskNameRequired));
        assert_eq!(remote.calls("push"), 0);
        assert_eq!(queue.stats().add.processed, 0);
    }

    /// Verify a repeated name is marked duplicate and never pushed.
    #[tokio::test]
    async fn test_duplicate_name_suppressed() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        let mut first = Message::new("send", &b"a"[..]).with_name("welcome-1");
        let mut second = Message::new("send", &b"b"[..]).with_name("welcome-1");
        queue.add(&mut first).await.unwrap();
        queue.add(&mut second).await.unwrap();
        queue.close().await.unwrap();

        assert!(first.err.is_none());
        assert!(second.is_duplicate());
        assert_eq!(remote.calls("push"), 1);
    }

    /// Verify unnamed messages are never treated as duplicates.
    #[tokio::test]
    async fn test_unnamed_messages_not_deduplicated() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        for _ in 0..3 {
            let mut message = Message::new("send", &b"same"[..]);
            queue.add(&mut message).await.unwrap();
            assert!(message.err.is_none());
        }
        queue.close().await.unwrap();

        assert_eq!(remote.calls("push"), 3);
    }

    /// Verify a caller-supplied dedup store is consulted.
    #[tokio::test]
    async fn test_custom_dedup_store() {
        struct AlwaysSeen;

        #[async_trait]
        impl DedupStore for AlwaysSeen {
            async fn exists(&self, _key: &str) -> bool {
                true
            }
        }

        let remote = RecordingRemote::new("jobs");
        let queue = PolledQueue::builder(remote.clone(), test_options())
            .dedup_store(Arc::new(AlwaysSeen))
            .build()
            .unwrap();

        let mut message = Message::new("send", &b"x"[..]).with_name("n");
        queue.add(&mut message).await.unwrap();
        queue.close().await.unwrap();

        assert!(message.is_duplicate());
        assert_eq!(remote.calls("push"), 0);
    }

    /// Verify add is rejected once the adapter is closed.
    #[tokio::test]
    async fn test_add_after_close_rejected() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        queue.close().await.unwrap();

        let mut message = Message::new("send", &b"x"[..]);
        let err = queue.add(&mut message).await.unwrap_err();

        assert!(matches!(err, QueueError::Closed { .. }));
    }

    /// Verify invalid options are refused at build time.
    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let remote = RecordingRemote::new("jobs");
        let mut options = test_options();
        options.batch.max_batch_size = 50;

        let result = PolledQueue::builder(remote, options).build();

        assert!(matches!(result, Err(QueueError::Validation(_))));
    }
}

// ============================================================================
// Reserve
// ============================================================================

mod reserve {
    use super::*;

    /// Verify a pushed payload decodes unchanged after reservation.
    #[tokio::test]
    async fn test_push_then_reserve_round_trip() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        let payload = b"\x00binary\xffpayload".to_vec();
        let mut message = Message::new("process", payload.clone());
        queue.add(&mut message).await.unwrap();

        let mut reserved = Vec::new();
        for _ in 0..50 {
            reserved = queue.reserve_n(1, Duration::ZERO).await.unwrap();
            if !reserved.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(reserved.len(), 1);
        let got = &reserved[0];
        assert_eq!(got.payload.as_ref(), payload.as_slice());
        assert_eq!(got.task_name, "process");
        assert!(got.err.is_none());
        assert!(got.reservation().is_some());
        assert_eq!(got.reserved_count, 1);
        queue.close().await.unwrap();
    }

    /// Verify zero requested messages makes no remote call.
    #[tokio::test]
    async fn test_reserve_zero_is_local() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        let reserved = queue.reserve_n(0, Duration::ZERO).await.unwrap();

        assert!(reserved.is_empty());
        assert_eq!(remote.calls("long_poll"), 0);
    }

    /// Verify requests above the remote ceiling are clamped.
    #[tokio::test]
    async fn test_reserve_clamped_to_remote_ceiling() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        queue.reserve_n(500, Duration::ZERO).await.unwrap();

        assert_eq!(remote.poll_sizes(), vec![MAX_RESERVE_COUNT]);
    }

    /// Verify an unbounded wait is capped at the remote's long-poll limit.
    #[tokio::test]
    async fn test_reserve_wait_capped() {
        let remote = RecordingRemote::new("jobs");
        remote.inner().push("ready".to_string(), 0).await.unwrap();
        let queue = build(&remote);

        let reserved = queue.reserve_n(1, Duration::MAX).await.unwrap();

        assert_eq!(reserved.len(), 1);
        assert_eq!(remote.poll_waits(), vec![MAX_WAIT_SECONDS]);
        queue.close().await.unwrap();
    }

    /// Verify an empty-poll not-found answer is a normal empty result.
    #[tokio::test]
    async fn test_empty_poll_not_found_is_empty() {
        let remote = RecordingRemote::new("jobs");
        remote.fail_next(
            "long_poll",
            not_found(NotFoundReason::MessageNotFound, "Message not found"),
        );
        let queue = build(&remote);

        let reserved = queue.reserve_n(5, Duration::ZERO).await.unwrap();

        assert!(reserved.is_empty());
        assert_eq!(remote.calls("create_queue"), 0);
    }

    /// Verify a missing queue is recreated once and the error still surfaces.
    #[tokio::test]
    async fn test_missing_queue_repaired() {
        let remote = RecordingRemote::wrap(InMemoryRemote::missing("jobs"));
        let queue = build(&remote);

        let err = queue.reserve_n(1, Duration::ZERO).await.unwrap_err();

        assert!(matches!(
            err,
            QueueError::Remote(RemoteError::NotFound {
                reason: NotFoundReason::QueueNotFound,
                ..
            })
        ));
        assert_eq!(remote.calls("create_queue"), 1);

        // Repair takes effect on the next poll
        assert!(queue.reserve_n(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(remote.calls("create_queue"), 1);
    }

    /// Verify a failed repair does not mask the original error.
    #[tokio::test]
    async fn test_failed_repair_keeps_original_error() {
        let remote = RecordingRemote::wrap(InMemoryRemote::missing("jobs"));
        remote.fail_next("create_queue", server_error());
        let queue = build(&remote);

        let err = queue.reserve_n(1, Duration::ZERO).await.unwrap_err();

        assert!(matches!(err, QueueError::Remote(ref e) if e.is_queue_missing()));
        assert_eq!(remote.calls("create_queue"), 1);
    }

    /// Verify other errors surface unchanged without repair.
    #[tokio::test]
    async fn test_other_errors_surface() {
        let remote = RecordingRemote::new("jobs");
        remote.fail_next("long_poll", server_error());
        let queue = build(&remote);

        let err = queue.reserve_n(1, Duration::ZERO).await.unwrap_err();

        assert!(matches!(
            err,
            QueueError::Remote(RemoteError::Status { status: 503, .. })
        ));
        assert_eq!(remote.calls("create_queue"), 0);
    }

    /// Verify one undecodable record does not fail the batch.
    #[tokio::test]
    async fn test_decode_failure_isolated() {
        let remote = RecordingRemote::new("jobs");
        let good = encode_message(&Message::new("task", &b"ok"[..])).unwrap();
        remote.inner().push("%%% not base64".to_string(), 0).await.unwrap();
        remote.inner().push(good, 0).await.unwrap();
        let queue = build(&remote);

        let reserved = queue.reserve_n(10, Duration::ZERO).await.unwrap();

        assert_eq!(reserved.len(), 2);
        assert!(matches!(reserved[0].err, Some(MessageError::Decode(_))));
        assert!(reserved[0].reservation().is_some());
        assert!(reserved[1].err.is_none());
        assert_eq!(reserved[1].payload.as_ref(), b"ok");
    }
}

// ============================================================================
// Release and Delete
// ============================================================================

mod release_and_delete {
    use super::*;

    /// Verify release and delete refuse messages without a reservation.
    #[tokio::test]
    async fn test_reservation_required() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        let message = Message::new("task", &b"x"[..]);

        assert!(matches!(
            queue.release(&message).await,
            Err(QueueError::ReservationRequired { .. })
        ));
        assert!(matches!(
            queue.delete(&message).await,
            Err(QueueError::ReservationRequired { .. })
        ));
        assert!(matches!(
            queue.delete_batched(&message).await,
            Err(QueueError::ReservationRequired { .. })
        ));
        assert_eq!(remote.calls("release") + remote.calls("delete"), 0);
    }

    /// Verify release is retried on server errors.
    #[tokio::test]
    async fn test_release_retried() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        let message = remote.reserved(1).await.remove(0);
        remote.fail_next("release", server_error());
        remote.fail_next("release", server_error());

        queue.release(&message).await.unwrap();

        assert_eq!(remote.calls("release"), 3);
        assert_eq!(remote.inner().reserved_len(), 0);
    }

    /// Verify release honours the message delay.
    #[tokio::test(start_paused = true)]
    async fn test_release_with_delay() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        let message = remote.reserved(1).await.remove(0);

        queue
            .release(&message.with_delay(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(queue.reserve_n(1, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.reserve_n(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    /// Verify an unbounded release delay is capped instead of overflowing.
    #[tokio::test(start_paused = true)]
    async fn test_release_with_unbounded_delay() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        let message = remote.reserved(1).await.remove(0);

        queue
            .release(&message.with_delay(Duration::MAX))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(MAX_DELAY_SECONDS - 1)).await;
        assert!(queue.reserve_n(1, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.reserve_n(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    /// Verify deleting an already-gone message succeeds.
    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        let message = remote.reserved(1).await.remove(0);

        queue.delete(&message).await.unwrap();
        queue.delete(&message).await.unwrap();

        assert_eq!(remote.calls("delete"), 2);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    /// Verify permanent delete errors surface after one attempt.
    #[tokio::test]
    async fn test_delete_permanent_error() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        let message = remote.reserved(1).await.remove(0);
        remote.fail_next(
            "delete",
            RemoteError::Status {
                status: 401,
                message: "Unauthorized".to_string(),
            },
        );

        let err = queue.delete(&message).await.unwrap_err();

        assert!(matches!(err, QueueError::Remote(RemoteError::Status { status: 401, .. })));
        assert_eq!(remote.calls("delete"), 1);
    }
}

// ============================================================================
// Queue Operations and Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    /// Verify len and purge go straight to the remote.
    #[tokio::test]
    async fn test_len_and_purge() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);
        remote.inner().push("a".to_string(), 0).await.unwrap();
        remote.inner().push("b".to_string(), 0).await.unwrap();

        assert_eq!(queue.name(), "jobs");
        assert_eq!(queue.len().await.unwrap(), 2);
        assert!(!queue.is_empty().await.unwrap());

        queue.purge().await.unwrap();

        assert!(queue.is_empty().await.unwrap());
        assert_eq!(remote.calls("clear"), 1);
    }

    /// Verify a short close deadline fails while deletes are still buffered.
    #[tokio::test]
    async fn test_close_timeout_too_short() {
        let remote = RecordingRemote::new("jobs");
        remote.set_delete_latency(Duration::from_millis(300));
        let queue = build(&remote);

        for message in remote.reserved(6).await {
            queue.delete_batched(&message).await.unwrap();
        }
        let err = queue
            .close_timeout(Duration::from_millis(5))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::DrainTimeout { ref pipeline, .. } if pipeline == "jobs:delete-message"));
    }

    /// Verify a sufficient close deadline flushes every buffered delete.
    #[tokio::test]
    async fn test_close_timeout_flushes_buffered_deletes() {
        let remote = RecordingRemote::new("jobs");
        remote.set_delete_latency(Duration::from_millis(20));
        let queue = build(&remote);

        for message in remote.reserved(12).await {
            queue.delete_batched(&message).await.unwrap();
        }
        queue.close_timeout(Duration::from_secs(2)).await.unwrap();

        assert_eq!(remote.batch_sizes(), vec![9, 3]);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.stats().delete.processed, 12);
    }

    /// Verify close drains accepted adds to the remote.
    #[tokio::test]
    async fn test_close_drains_adds() {
        let remote = RecordingRemote::new("jobs");
        let queue = build(&remote);

        for i in 0..5 {
            let mut message = Message::new("task", format!("p{}", i).into_bytes());
            queue.add(&mut message).await.unwrap();
        }
        queue.close().await.unwrap();

        assert_eq!(remote.inner().info().await.unwrap().size, 5);
        assert_eq!(queue.stats().add.processed, 5);
    }
}
