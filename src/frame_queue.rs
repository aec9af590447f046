use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// A compressed frame waiting to be sent over the streaming channel.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub payload: Bytes,
    pub captured_at: Instant,
}

impl QueuedFrame {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            captured_at: Instant::now(),
        }
    }
}

/// Bounded drop-oldest buffer between the frame source and the streaming
/// channel. At capacity the oldest frame is evicted, so the queue always
/// holds the most recently captured frames rather than the head of the
/// full capture history.
pub struct FrameQueue {
    frames: Mutex<VecDeque<QueuedFrame>>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        })
    }

    /// Inserts a frame, evicting the oldest first when full. Returns true
    /// when an eviction happened so the caller can count dropped frames.
    pub fn push(&self, frame: QueuedFrame) -> bool {
        let evicted = {
            let mut frames = self.frames.lock();
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(frame);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Removes and returns the oldest frame, or None when empty.
    pub fn pop(&self) -> Option<QueuedFrame> {
        self.frames.lock().pop_front()
    }

    /// Puts a popped frame back at the head, so a frame whose send failed
    /// survives for the next connection attempt. A full queue wins: the
    /// newer frames that arrived in the meantime are kept instead.
    pub fn restore_front(&self, frame: QueuedFrame) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return false;
        }
        frames.push_front(frame);
        true
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Resolves once a frame has been pushed. Callers must re-check the
    /// queue afterwards; a wakeup does not reserve a frame.
    pub async fn frame_available(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> QueuedFrame {
        QueuedFrame::new(Bytes::from(vec![tag]))
    }

    #[test]
    fn test_push_pop_fifo() {
        let queue = FrameQueue::new(3);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().payload[0], 1);
        assert_eq!(queue.pop().unwrap().payload[0], 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drop_oldest_keeps_last_capacity_frames() {
        let queue = FrameQueue::new(3);
        let mut evictions = 0;
        for tag in 0..10u8 {
            if queue.push(frame(tag)) {
                evictions += 1;
            }
        }
        assert_eq!(evictions, 7);
        assert_eq!(queue.len(), 3);
        // Final contents are exactly the last three pushes in push order.
        assert_eq!(queue.pop().unwrap().payload[0], 7);
        assert_eq!(queue.pop().unwrap().payload[0], 8);
        assert_eq!(queue.pop().unwrap().payload[0], 9);
    }

    #[test]
    fn test_zero_capacity_is_treated_as_one() {
        let queue = FrameQueue::new(0);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().payload[0], 2);
    }

    #[test]
    fn test_restore_front_puts_frame_back_at_head() {
        let queue = FrameQueue::new(3);
        queue.push(frame(2));
        let popped = queue.pop().unwrap();
        queue.push(frame(3));
        assert!(queue.restore_front(popped));
        assert_eq!(queue.pop().unwrap().payload[0], 2);
        assert_eq!(queue.pop().unwrap().payload[0], 3);
    }

    #[test]
    fn test_restore_front_rejected_when_full() {
        let queue = FrameQueue::new(2);
        let stale = frame(1);
        queue.push(frame(2));
        queue.push(frame(3));
        assert!(!queue.restore_front(stale));
        assert_eq!(queue.pop().unwrap().payload[0], 2);
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = FrameQueue::new(2);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.frame_available().await;
                queue.pop().map(|f| f.payload[0])
            })
        };
        tokio::task::yield_now().await;
        queue.push(frame(9));
        assert_eq!(waiter.await.unwrap(), Some(9));
    }
}
