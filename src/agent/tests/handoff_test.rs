//! Rendezvous handoff between ingestion and the agent loop

use agent::{Handoff, HandoffError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_send_blocks_until_received() {
    let handoff = Arc::new(Handoff::<u32>::new());
    let shutdown = CancellationToken::new();

    let producer = {
        let handoff = handoff.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let batch = handoff.batch();
            handoff.send(&batch, 7, &shutdown).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished(), "send completed before the item was taken");

    assert_eq!(handoff.recv(&shutdown).await.unwrap(), 7);
    assert_eq!(producer.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_items_arrive_in_order() {
    let handoff = Arc::new(Handoff::<u32>::new());
    let shutdown = CancellationToken::new();

    let producer = {
        let handoff = handoff.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let batch = handoff.batch();
            for i in 0..5 {
                handoff.send(&batch, i, &shutdown).await?;
            }
            Ok::<_, HandoffError>(())
        })
    };

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(handoff.recv(&shutdown).await.unwrap());
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
    assert_eq!(producer.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_abandon_discards_pending_item_and_stops_producer() {
    let handoff = Arc::new(Handoff::<&'static str>::new());
    let shutdown = CancellationToken::new();

    let producer = {
        let handoff = handoff.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let batch = handoff.batch();
            handoff.send(&batch, "first", &shutdown).await?;
            handoff.send(&batch, "stale", &shutdown).await?;
            handoff.send(&batch, "never", &shutdown).await
        })
    };

    assert_eq!(handoff.recv(&shutdown).await.unwrap(), "first");
    // Let the producer park "stale" in the slot before abandoning.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handoff.abandon();
    assert_eq!(producer.await.unwrap(), Err(HandoffError::Abandoned));

    let next_batch = handoff.batch();
    let feeder = {
        let handoff = handoff.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { handoff.send(&next_batch, "fresh", &shutdown).await })
    };
    assert_eq!(handoff.recv(&shutdown).await.unwrap(), "fresh");
    assert_eq!(feeder.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_send_on_abandoned_batch_fails_fast() {
    let handoff = Handoff::<u32>::new();
    let shutdown = CancellationToken::new();

    let batch = handoff.batch();
    handoff.abandon();
    assert!(batch.is_abandoned());
    assert_eq!(
        handoff.send(&batch, 1, &shutdown).await,
        Err(HandoffError::Abandoned)
    );
}

#[tokio::test]
async fn test_shutdown_unblocks_both_sides() {
    let handoff = Arc::new(Handoff::<u32>::new());
    let shutdown = CancellationToken::new();

    let receiver = {
        let handoff = handoff.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { handoff.recv(&shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();
    assert_eq!(receiver.await.unwrap(), Err(HandoffError::Cancelled));

    let batch = handoff.batch();
    assert_eq!(
        handoff.send(&batch, 1, &shutdown).await,
        Err(HandoffError::Cancelled)
    );
}
