// src/utils/broadcast.rs

//! 1→N channel fan-out.
//!
//! Every follower gets its own bounded buffer. Delivery is synchronous: a
//! slow follower back-pressures the sender instead of dropping values,
//! because losing a new-listing signal is worse than stalling the poller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};

use crate::error::{AppError, Result};

pub const BROADCAST_DEFAULT_CAPACITY: usize = 16;

struct FollowerSlot<T> {
    id: u64,
    sender: mpsc::Sender<T>,
}

/// Receiving side of one subscription.
pub struct Follower<T> {
    id: u64,
    receiver: mpsc::Receiver<T>,
}

impl<T> Follower<T> {
    /// Next value, or `None` once the broadcast closed or unfollowed us.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

pub struct Broadcast<T> {
    followers: Mutex<Vec<FollowerSlot<T>>>,
    capacity: usize,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            BROADCAST_DEFAULT_CAPACITY
        } else {
            capacity
        };

        Self {
            followers: Mutex::new(Vec::new()),
            capacity,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn follow(&self) -> Result<Follower<T>> {
        self.follow_with_capacity(self.capacity).await
    }

    /// Subscribe with `memory` pre-enqueued. The buffer grows to
    /// `max(capacity, len + len/8 + 1)` so the memory always fits.
    pub async fn follow_with_memory(&self, memory: Vec<T>) -> Result<Follower<T>> {
        let required = memory.len() + memory.len() / 8 + 1;
        let follower = self
            .follow_with_capacity(self.capacity.max(required))
            .await?;

        let followers = self.followers.lock().await;
        if let Some(slot) = followers.iter().find(|slot| slot.id == follower.id) {
            for value in memory {
                // Capacity was sized for the memory; this cannot fill up.
                let _ = slot.sender.try_send(value);
            }
        }

        Ok(follower)
    }

    async fn follow_with_capacity(&self, capacity: usize) -> Result<Follower<T>> {
        let mut followers = self.followers.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::BroadcastClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(capacity);
        followers.push(FollowerSlot { id, sender });

        Ok(Follower { id, receiver })
    }

    /// Remove and close one subscription. Dropping the receiver first means
    /// a `send` currently blocked on this follower's full buffer gets
    /// unblocked rather than deadlocking with us.
    pub async fn unfollow(&self, follower: Follower<T>) -> Result<()> {
        let Follower { id, receiver } = follower;
        drop(receiver);

        let mut followers = self.followers.lock().await;
        match followers.iter().position(|slot| slot.id == id) {
            Some(index) => {
                followers.swap_remove(index);
                Ok(())
            }
            None => Err(AppError::FollowerNotFound),
        }
    }

    /// Deliver `value` to every follower, in registration order, waiting out
    /// full buffers.
    pub async fn send(&self, value: T) -> Result<()> {
        let followers = self.followers.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::BroadcastClosed);
        }

        for slot in followers.iter() {
            // An Err here means the follower's receiver is gone; skip it.
            let _ = slot.sender.send(value.clone()).await;
        }

        Ok(())
    }

    /// Close every follower channel and refuse further sends. Idempotent.
    pub async fn close(&self) {
        let mut followers = self.followers.lock().await;

        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            followers.clear();
        }
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.followers.lock().await.len()
    }

    pub fn cap(&self) -> usize {
        self.capacity
    }
}

/// Pump a channel into a fresh broadcast; the broadcast closes when the
/// source does.
pub fn broadcast_adapter<T: Clone + Send + 'static>(
    mut source: mpsc::Receiver<T>,
) -> std::sync::Arc<Broadcast<T>> {
    let broadcast = std::sync::Arc::new(Broadcast::new(source.max_capacity()));

    let pump = std::sync::Arc::clone(&broadcast);
    tokio::spawn(async move {
        while let Some(value) = source.recv().await {
            if pump.send(value).await.is_err() {
                break;
            }
        }
        pump.close().await;
    });

    broadcast
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_follow_and_unfollow() {
        let broadcast: Broadcast<i32> = Broadcast::new(0);

        let follower = broadcast.follow().await.unwrap();
        assert_eq!(broadcast.len().await, 1);

        broadcast.unfollow(follower).await.unwrap();
        assert_eq!(broadcast.len().await, 0);
    }

    #[tokio::test]
    async fn test_send_reaches_every_follower() {
        let broadcast: Broadcast<i32> = Broadcast::new(0);

        let mut first = broadcast.follow().await.unwrap();
        let mut second = broadcast.follow().await.unwrap();

        broadcast.send(42).await.unwrap();

        assert_eq!(first.recv().await, Some(42));
        assert_eq!(second.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_per_follower_order_matches_send_order() {
        let broadcast: Broadcast<i32> = Broadcast::new(8);
        let mut follower = broadcast.follow().await.unwrap();

        for value in [1, 2, 3] {
            broadcast.send(value).await.unwrap();
        }

        assert_eq!(follower.recv().await, Some(1));
        assert_eq!(follower.recv().await, Some(2));
        assert_eq!(follower.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_sends() {
        let broadcast: Broadcast<i32> = Broadcast::new(0);
        let mut follower = broadcast.follow().await.unwrap();

        broadcast.close().await;
        broadcast.close().await;
        assert!(broadcast.closed());

        assert!(matches!(
            broadcast.send(42).await,
            Err(AppError::BroadcastClosed)
        ));
        assert!(matches!(
            broadcast.follow().await,
            Err(AppError::BroadcastClosed)
        ));

        // The follower channel was closed.
        assert_eq!(follower.recv().await, None);
    }

    #[tokio::test]
    async fn test_follow_with_memory_preloads_values() {
        let broadcast: Broadcast<i32> = Broadcast::new(2);

        let mut follower = broadcast
            .follow_with_memory(vec![10, 20, 30])
            .await
            .unwrap();

        assert_eq!(follower.recv().await, Some(10));
        assert_eq!(follower.recv().await, Some(20));
        assert_eq!(follower.recv().await, Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_with_memory_capacity_formula() {
        let broadcast: Broadcast<i32> = Broadcast::new(2);

        // 20 values force a buffer of 20 + 20/8 + 1 = 23.
        let memory: Vec<i32> = (0..20).collect();
        let _follower = broadcast.follow_with_memory(memory).await.unwrap();

        // Three more sends fit without anyone consuming; the fourth blocks.
        for value in 0..3 {
            broadcast.send(value).await.unwrap();
        }
        let blocked = tokio::time::timeout(Duration::from_millis(50), broadcast.send(99)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_follower_backpressures_sender() {
        let broadcast: Arc<Broadcast<i32>> = Arc::new(Broadcast::new(2));

        let mut fast = broadcast.follow().await.unwrap();
        let mut slow = broadcast.follow().await.unwrap();

        broadcast.send(1).await.unwrap();
        broadcast.send(2).await.unwrap();
        assert_eq!(fast.recv().await, Some(1));
        assert_eq!(fast.recv().await, Some(2));

        // Slow follower's buffer is full: the third send must block.
        let sender = Arc::clone(&broadcast);
        let third_send = tokio::spawn(async move { sender.send(3).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third_send.is_finished());

        // One read from the slow follower unblocks it.
        assert_eq!(slow.recv().await, Some(1));
        third_send.await.unwrap().unwrap();
        assert_eq!(fast.recv().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfollow_unblocks_blocked_send() {
        let broadcast: Arc<Broadcast<i32>> = Arc::new(Broadcast::new(1));

        let mut fast = broadcast.follow().await.unwrap();
        let slow = broadcast.follow().await.unwrap();

        broadcast.send(1).await.unwrap();
        assert_eq!(fast.recv().await, Some(1));

        let sender = Arc::clone(&broadcast);
        let second_send = tokio::spawn(async move { sender.send(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_send.is_finished());

        broadcast.unfollow(slow).await.unwrap();
        second_send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unfollow_unknown_follower_fails() {
        let first: Broadcast<i32> = Broadcast::new(0);
        let second: Broadcast<i32> = Broadcast::new(0);

        let stranger = second.follow().await.unwrap();
        assert!(matches!(
            first.unfollow(stranger).await,
            Err(AppError::FollowerNotFound)
        ));
    }

    #[tokio::test]
    async fn test_adapter_pumps_until_source_closes() {
        let (tx, rx) = mpsc::channel::<i32>(4);
        let broadcast = broadcast_adapter(rx);

        let mut follower = broadcast.follow().await.unwrap();

        tx.send(7).await.unwrap();
        assert_eq!(follower.recv().await, Some(7));

        drop(tx);
        assert_eq!(follower.recv().await, None);

        // Give the pump task a beat to close the broadcast.
        tokio::task::yield_now().await;
        assert!(broadcast.closed());
    }

    #[tokio::test]
    async fn test_len_and_cap() {
        let broadcast: Broadcast<i32> = Broadcast::new(10);
        assert_eq!(broadcast.cap(), 10);
        assert_eq!(broadcast.len().await, 0);

        let _first = broadcast.follow().await.unwrap();
        let _second = broadcast.follow().await.unwrap();
        assert_eq!(broadcast.len().await, 2);
    }
}
