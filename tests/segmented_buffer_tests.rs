//! Segmented buffer allocation tests
//!
//! Tests cover splitting, all-or-nothing failure against bounded allocators,
//! blocking allocation and moving multi-segment buffers through transports.

use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use neuron::{
    AllocFlags, Allocator, BudgetAllocator, Bus, BusConfig, ChannelDescriptor, ChannelKind,
    Direction, HeapAllocator, MessageQueue, NeuronError, PoolAllocator, QueueConfig,
    SegmentAllocator, SegmentConfig, Transport,
};

fn pool(block_size: usize, blocks: usize) -> Arc<PoolAllocator> {
    Arc::new(PoolAllocator::new(block_size, blocks).unwrap())
}

#[cfg(test)]
mod segmented_buffer_tests {
    use super::*;

    /// Test: a failed allocation leaves nothing behind
    #[test]
    fn test_all_or_nothing_against_pool() {
        let blocks = pool(256, 8);
        let bus = Bus::with_allocator(BusConfig::default(), blocks.clone()).unwrap();
        assert_eq!(bus.segments().max_segment_capacity(), 256);

        let held = bus.allocate(1000, AllocFlags::Atomic).unwrap();
        assert_eq!(held.segment_count(), 4);
        assert_eq!(held.len(), 1000);
        assert_eq!(blocks.free_blocks(), 4);

        let err = bus.allocate(2000, AllocFlags::Atomic).unwrap_err();
        assert!(matches!(err, NeuronError::OutOfMemory { requested: 2000 }));
        assert_eq!(blocks.free_blocks(), 4);

        drop(held);
        assert_eq!(blocks.free_blocks(), 8);

        let stats = bus.stats().segments;
        assert_eq!(stats.buffers_allocated, 1);
        assert_eq!(stats.allocation_failures, 1);
        assert_eq!(stats.segments_in_use, 0);
        assert_eq!(stats.segments_allocated, stats.segments_released);
        assert!(stats.peak_segments >= 4);
    }

    /// Test: a byte budget caps the total held by buffers
    #[test]
    fn test_budget_quota() {
        let heap: Arc<dyn Allocator> = Arc::new(HeapAllocator::new(8).unwrap());
        let budget = Arc::new(BudgetAllocator::new(heap, 1024));
        let segments = SegmentAllocator::new(
            budget.clone(),
            SegmentConfig::default().with_max_segment_capacity(300),
        )
        .unwrap();

        let first = segments.allocate(900, AllocFlags::Atomic).unwrap();
        assert_eq!(first.segment_count(), 3);
        assert!(segments.allocate(200, AllocFlags::Atomic).is_err());

        drop(first);
        let second = segments.allocate(1024, AllocFlags::Atomic).unwrap();
        assert_eq!(second.segment_count(), 4);
        assert_eq!(second.capacity(), 1024);
        assert!(second.accounted_size() > second.capacity());
    }

    /// Test: segments carved from an aligned pool start on the requested boundary
    #[test]
    fn test_segment_alignment_against_pool() {
        let config = SegmentConfig::default().with_alignment(64);
        let plain = pool(64, 8);
        assert!(matches!(
            SegmentAllocator::new(plain, config.clone()),
            Err(NeuronError::InvalidParameter { .. })
        ));

        let aligned = Arc::new(PoolAllocator::with_alignment(64, 8, 64).unwrap());
        let segments = SegmentAllocator::new(aligned.clone(), config).unwrap();
        let buffer = segments.allocate(256, AllocFlags::Atomic).unwrap();
        assert_eq!(buffer.segment_count(), 4);
        for segment in buffer.segments() {
            assert_eq!(segment.as_slice().as_ptr() as usize % 64, 0);
        }
        assert_eq!(aligned.free_blocks(), 4);
    }

    /// Test: a blocking allocation waits for another thread to release blocks
    #[test]
    fn test_may_block_waits_for_release() {
        let blocks = pool(128, 2);
        let segments = SegmentAllocator::new(blocks.clone(), SegmentConfig::default()).unwrap();

        let held = segments.allocate(256, AllocFlags::Atomic).unwrap();
        assert!(blocks.is_full());
        assert!(segments.allocate(128, AllocFlags::Atomic).is_err());

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });

        let flags = AllocFlags::MayBlock {
            timeout: Some(Duration::from_secs(5)),
        };
        let buffer = segments.allocate(128, flags).unwrap();
        releaser.join().unwrap();

        assert_eq!(buffer.len(), 128);
        assert!(segments.stats().blocking_retries > 0);
    }

    /// Test: threads sharing one pool never leak or double-hand a block
    #[test]
    fn test_concurrent_allocation() {
        let blocks = pool(256, 8);
        let segments = SegmentAllocator::new(blocks.clone(), SegmentConfig::default()).unwrap();
        let thread_count = 4;
        let barrier = Arc::new(Barrier::new(thread_count));

        let handles: Vec<_> = (0..thread_count)
            .map(|t| {
                let segments = segments.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let flags = AllocFlags::MayBlock {
                        timeout: Some(Duration::from_secs(10)),
                    };
                    for round in 0..100u32 {
                        let mut buffer = segments.allocate(512, flags).unwrap();
                        let pattern = vec![(t as u8) ^ (round as u8); 512];
                        buffer.fill_from(&pattern).unwrap();
                        thread::yield_now();
                        assert_eq!(buffer.to_vec(), pattern);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(blocks.free_blocks(), 8);
        let stats = segments.stats();
        assert_eq!(stats.buffers_allocated, 400);
        assert_eq!(stats.segments_in_use, 0);
    }

    /// Test: a multi-segment message crosses a vectored queue intact
    #[test]
    fn test_vectored_send_of_segmented_buffer() {
        let config = BusConfig::default().with_segments(
            SegmentConfig::default().with_max_segment_capacity(8),
        );
        let bus = Bus::new(config).unwrap();

        let (tx, rx) = MessageQueue::pair(QueueConfig::default().with_vectored(true));
        let id = match bus.register_channel(
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Send),
            tx,
        ) {
            Err(NeuronError::ShapeMismatch { channel }) => channel,
            other => panic!("unexpected {:?}", other),
        };
        let channel = bus.channel(id).unwrap();

        let payload: Vec<u8> = (0..30u8).collect();
        let mut message = bus.allocate(payload.len(), AllocFlags::Atomic).unwrap();
        assert_eq!(message.segment_count(), 4);
        message.fill_from(&payload).unwrap();

        let range = message.range(5, 12).unwrap();
        assert_eq!(range.chunks().count(), 3);
        assert_eq!(range.to_vec(), payload[5..17].to_vec());

        channel.send(&message).unwrap();

        let mut inbox = bus.allocate(64, AllocFlags::Atomic).unwrap();
        let received = rx.receive(&mut inbox).unwrap();
        assert_eq!(received.get(), 30);
        let mut out = vec![0u8; 30];
        inbox.read_at(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }
}
