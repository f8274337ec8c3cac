use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use telemetry_reporter::buffer::{AdmissionPolicy, QueueConfig, QueueError, event_queue};
use telemetry_reporter::{Event, Payload};

fn record(producer: u32, n: u32) -> Event {
    let line = format!("{{\"span\":{{\"producer\":{producer},\"n\":{n}}}}}\n");
    Event::Record(Payload::Bytes(Bytes::from(line)))
}

fn origin(event: &Event) -> (u32, u32) {
    let Event::Record(Payload::Bytes(bytes)) = event else {
        panic!("unexpected event {event:?}");
    };
    let value: serde_json::Value = serde_json::from_slice(bytes).unwrap();
    let span = &value["span"];
    (
        span["producer"].as_u64().unwrap() as u32,
        span["n"].as_u64().unwrap() as u32,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_per_producer_order() {
    let config = QueueConfig {
        max_queue_size: 16,
        policy: AdmissionPolicy::Block,
    };
    let (producer, mut consumer) = event_queue(&config);

    let tasks: Vec<_> = (0..8)
        .map(|id| {
            let producer = producer.clone();
            tokio::spawn(async move {
                for n in 0..250 {
                    producer.enqueue(record(id, n)).await.unwrap();
                }
            })
        })
        .collect();
    drop(producer);

    let mut last_seen: HashMap<u32, u32> = HashMap::new();
    let mut last_sequence = 0;
    let mut total = 0;
    while let Some(entry) = consumer.dequeue().await {
        assert!(entry.sequence > last_sequence);
        last_sequence = entry.sequence;

        let (id, n) = origin(&entry.event);
        if let Some(previous) = last_seen.insert(id, n) {
            assert_eq!(n, previous + 1, "producer {id} out of order");
        }
        total += 1;
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(total, 8 * 250);
    assert_eq!(last_sequence, 8 * 250);
}

#[tokio::test]
async fn test_drop_policy_counts_rejections() {
    let config = QueueConfig {
        max_queue_size: 5,
        policy: AdmissionPolicy::DropOnFull,
    };
    let (producer, mut consumer) = event_queue(&config);
    assert_eq!(producer.capacity(), 8);

    let mut accepted = 0;
    let mut rejected = 0;
    for n in 0..10 {
        match producer.enqueue(record(0, n)).await {
            Ok(_) => accepted += 1,
            Err(QueueError::Full) => rejected += 1,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!((accepted, rejected), (8, 2));

    let metrics = producer.metrics();
    assert_eq!(metrics.enqueued, 8);
    assert_eq!(metrics.rejected, 2);
    assert_eq!(metrics.depth, 8);
    assert!((metrics.fill_ratio() - 1.0).abs() < f64::EPSILON);

    while consumer.try_dequeue().is_some() {}
    assert_eq!(producer.metrics().dequeued, 8);
    assert!(producer.is_empty());
}

#[tokio::test]
async fn test_blocking_producer_resumes_when_consumer_drains() {
    let config = QueueConfig {
        max_queue_size: 2,
        policy: AdmissionPolicy::Block,
    };
    let (producer, mut consumer) = event_queue(&config);
    producer.enqueue(record(0, 0)).await.unwrap();
    producer.enqueue(record(0, 1)).await.unwrap();

    let blocked = {
        let producer = producer.clone();
        tokio::spawn(async move { producer.enqueue(record(0, 2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    assert!(consumer.dequeue().await.is_some());
    assert_eq!(blocked.await.unwrap(), Ok(3));
}
