use chrono::Utc;
use ffteis::buffers::FrameBuffer;
use ffteis::core::{ChannelScaling, Frame, RecordingParams};
use ffteis::error::EisError;
use tokio::time::{timeout, Duration};

fn frame(label: &str) -> Frame {
    let params = RecordingParams {
        sample_rate: 1000.0,
        frame_duration: 0.004,
        current_range: 1.0,
        channel1: ChannelScaling::default(),
        channel2: ChannelScaling::default(),
    };
    Frame::new(Utc::now(), params, vec![0.0; 4], vec![0.0; 4])
        .unwrap()
        .with_label(label)
}

#[test]
fn test_pop_front_is_fifo() {
    let buffer = FrameBuffer::new();
    for label in ["a", "b", "c"] {
        buffer.push(frame(label));
    }

    let first = buffer.pop_front(2).unwrap();
    let labels: Vec<_> = first.iter().map(|f| f.label().unwrap()).collect();
    assert_eq!(labels, vec!["a", "b"]);
    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer.pop_front(1).unwrap()[0].label(), Some("c"));
    assert!(buffer.is_empty());
}

#[test]
fn test_short_pop_leaves_buffer_untouched() {
    let buffer = FrameBuffer::new();
    buffer.push(frame("a"));
    buffer.push(frame("b"));

    match buffer.pop_front(3) {
        Err(EisError::BufferEmpty {
            requested,
            available,
        }) => {
            assert_eq!(requested, 3);
            assert_eq!(available, 2);
        }
        other => panic!("expected BufferEmpty, got {:?}", other.map(|v| v.len())),
    }
    assert_eq!(buffer.len(), 2);
}

#[test]
fn test_clear_and_clone_share_storage() {
    let buffer = FrameBuffer::new();
    let producer = buffer.clone();
    producer.push(frame("a"));
    assert_eq!(buffer.len(), 1);

    buffer.clear();
    assert!(producer.is_empty());
}

#[tokio::test]
async fn test_concurrent_producers() {
    let buffer = FrameBuffer::new();
    let mut handles = Vec::new();
    for p in 0..4 {
        let producer = buffer.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                producer.push(frame(&format!("{}-{}", p, i)));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(buffer.len(), 100);
}

#[tokio::test]
async fn test_ready_does_not_miss_earlier_push() {
    let buffer = FrameBuffer::new();
    buffer.push(frame("early"));

    timeout(Duration::from_millis(100), buffer.ready())
        .await
        .expect("push before ready() should still wake the consumer");
}

#[tokio::test]
async fn test_ready_wakes_on_push() {
    let buffer = FrameBuffer::new();
    let consumer = buffer.clone();
    let waiter = tokio::spawn(async move {
        consumer.ready().await;
        consumer.pop_front(1).unwrap()
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    buffer.push(frame("x"));

    let frames = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(frames[0].label(), Some("x"));
}
