// src/services/pool.rs

//! Location-grouped rotating client queue.
//!
//! Each member of the queue is a group holding at most one client per
//! location, so one dispatch batch spreads across source regions. The queue
//! enforces `rest_interval` between successive uses of the same group.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::info;

use crate::services::client::PollClient;
use crate::services::geo::{LocationResolver, UNKNOWN_LOCATION};

struct QueueMember {
    clients: Vec<Arc<dyn PollClient>>,
    last_acquired_at: Instant,
}

/// FIFO pool of client groups. Group membership never changes after
/// construction; `acquire` and the returned guard are strictly balanced.
pub struct ClientQueuePool {
    sender: mpsc::Sender<QueueMember>,
    receiver: Mutex<mpsc::Receiver<QueueMember>>,
    queued: Arc<AtomicUsize>,
    rest_interval: Duration,
}

impl ClientQueuePool {
    /// Partition `clients` by location and build the rotating groups.
    /// Clients whose lookup fails share the `"unknown"` location.
    pub async fn new(
        clients: Vec<Arc<dyn PollClient>>,
        rest_interval: Duration,
        resolver: &dyn LocationResolver,
    ) -> Self {
        // Preserve first-seen location order so grouping is deterministic.
        let mut by_location: Vec<(String, Vec<Arc<dyn PollClient>>)> = Vec::new();
        for client in clients {
            let location = resolver
                .location(client.ip_address())
                .await
                .unwrap_or_else(|_| UNKNOWN_LOCATION.to_string());

            match by_location.iter_mut().find(|(known, _)| *known == location) {
                Some((_, bucket)) => bucket.push(client),
                None => by_location.push((location, vec![client])),
            }
        }

        let capacity: usize = by_location
            .iter()
            .map(|(_, bucket)| bucket.len())
            .max()
            .unwrap_or(0)
            .max(1);

        let (sender, receiver) = mpsc::channel(capacity);
        let queued = Arc::new(AtomicUsize::new(0));
        let init_time = Instant::now();

        loop {
            let mut group = Vec::new();
            let mut locations = Vec::new();

            for (location, bucket) in by_location.iter_mut() {
                if let Some(client) = bucket.pop() {
                    group.push(client);
                    locations.push(location.clone());
                }
            }

            if group.is_empty() {
                break;
            }

            info!(count = group.len(), locations = ?locations, "clients group");

            queued.fetch_add(1, Ordering::SeqCst);
            let _ = sender.try_send(QueueMember {
                clients: group,
                last_acquired_at: init_time,
            });
        }

        Self {
            sender,
            receiver: Mutex::new(receiver),
            queued,
            rest_interval,
        }
    }

    /// Take the group at the head of the queue, sleeping out whatever is
    /// left of its rest interval. The guard puts the group back when
    /// dropped, stamped with the acquisition instant.
    pub async fn acquire(&self) -> (Vec<Arc<dyn PollClient>>, ReleaseGuard) {
        let member = {
            let mut receiver = self.receiver.lock().await;
            receiver
                .recv()
                .await
                .expect("pool queue sender dropped while pool alive")
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let elapsed = Instant::now().duration_since(member.last_acquired_at);
        if elapsed < self.rest_interval {
            tokio::time::sleep(self.rest_interval - elapsed).await;
        }

        // Stamp the instant the caller receives the group, not when it
        // finishes using it.
        let acquired_at = Instant::now();

        let guard = ReleaseGuard {
            sender: self.sender.clone(),
            queued: Arc::clone(&self.queued),
            clients: member.clients.clone(),
            acquired_at,
        };

        (member.clients, guard)
    }

    /// Number of groups currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returns the acquired group to the queue on drop.
pub struct ReleaseGuard {
    sender: mpsc::Sender<QueueMember>,
    queued: Arc<AtomicUsize>,
    clients: Vec<Arc<dyn PollClient>>,
    acquired_at: Instant,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        // Capacity equals the group count, so the send cannot fail while
        // acquire/release stay balanced.
        self.queued.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.try_send(QueueMember {
            clients: std::mem::take(&mut self.clients),
            last_acquired_at: self.acquired_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    use crate::error::Result;
    use crate::models::Response;
    use crate::services::geo::StaticResolver;

    struct FakeClient {
        ip: String,
    }

    #[async_trait]
    impl PollClient for FakeClient {
        async fn request(&self, _url: &str) -> Result<Response> {
            unimplemented!("pool tests never dispatch")
        }

        fn proxy_address(&self) -> &str {
            &self.ip
        }

        fn ip_address(&self) -> &str {
            &self.ip
        }
    }

    fn fake_clients(ips: &[&str]) -> Vec<Arc<dyn PollClient>> {
        ips.iter()
            .map(|ip| Arc::new(FakeClient { ip: ip.to_string() }) as Arc<dyn PollClient>)
            .collect()
    }

    fn resolver(pairs: &[(&str, &str)]) -> StaticResolver {
        StaticResolver::new(
            pairs
                .iter()
                .map(|(ip, location)| (ip.to_string(), location.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[tokio::test]
    async fn test_groups_have_one_client_per_location() {
        let resolver = resolver(&[
            ("1.1.1.1", "Asia/Seoul"),
            ("2.2.2.2", "Asia/Seoul"),
            ("3.3.3.3", "Europe/Berlin"),
        ]);
        let pool = ClientQueuePool::new(
            fake_clients(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
            Duration::from_millis(0),
            &resolver,
        )
        .await;

        // Two Seoul clients force two groups; Berlin joins the first.
        assert_eq!(pool.len(), 2);

        let (first, first_guard) = pool.acquire().await;
        assert_eq!(first.len(), 2);
        let (second, second_guard) = pool.acquire().await;
        assert_eq!(second.len(), 1);

        drop(first_guard);
        drop(second_guard);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_lookup_lands_in_unknown_group() {
        let resolver = resolver(&[("1.1.1.1", "Asia/Seoul")]);
        let pool = ClientQueuePool::new(
            fake_clients(&["1.1.1.1", "9.9.9.9"]),
            Duration::from_millis(0),
            &resolver,
        )
        .await;

        // Seoul and unknown are distinct locations, so one group of two.
        assert_eq!(pool.len(), 1);
        let (group, _guard) = pool.acquire().await;
        assert_eq!(group.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_interval_between_reuses() {
        let resolver = resolver(&[("1.1.1.1", "Asia/Seoul")]);
        let rest = Duration::from_millis(500);
        let pool = ClientQueuePool::new(fake_clients(&["1.1.1.1"]), rest, &resolver).await;

        // First acquisition: the group rested since construction at t=0.
        let (_, guard) = pool.acquire().await;
        let first_acquired = tokio::time::Instant::now();
        drop(guard);

        // Immediate reacquisition must wait out the rest interval.
        let (_, guard) = pool.acquire().await;
        let second_acquired = tokio::time::Instant::now();
        assert!(second_acquired - first_acquired >= rest);
        drop(guard);
    }

    #[tokio::test]
    async fn test_group_count_is_stable_across_cycles() {
        let resolver = resolver(&[("1.1.1.1", "Asia/Seoul"), ("2.2.2.2", "Europe/Berlin")]);
        let pool = ClientQueuePool::new(
            fake_clients(&["1.1.1.1", "2.2.2.2"]),
            Duration::from_millis(0),
            &resolver,
        )
        .await;

        for _ in 0..5 {
            let (group, guard) = pool.acquire().await;
            assert_eq!(group.len(), 2);
            drop(guard);
        }
        assert_eq!(pool.len(), 1);
    }
}
