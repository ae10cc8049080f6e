pub mod position_sizer;
pub mod settlement;
pub mod subscription_ledger;
pub mod trade_engine;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-(user, bot) async locks serializing balance mutations.
///
/// Settlement applying PnL and the ledger tearing a subscription down must
/// not interleave on the same pair; unrelated pairs stay concurrent.
#[derive(Default)]
pub struct BalanceLocks {
    inner: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl BalanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: &str, bot_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // A strong count of 1 means only the map holds the lock, so no
            // guard is outstanding and the entry can go.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry((user_id.to_string(), bot_name.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked_pairs(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_pair_is_exclusive() {
        let locks = Arc::new(BalanceLocks::new());
        let guard = locks.acquire("u1", "bot").await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("u1", "bot").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_pairs_do_not_block() {
        let locks = BalanceLocks::new();
        let _a = locks.acquire("u1", "bot-a").await;
        let _b = locks.acquire("u1", "bot-b").await;
        let _c = locks.acquire("u2", "bot-a").await;
    }

    #[tokio::test]
    async fn test_released_entries_are_evicted() {
        let locks = BalanceLocks::new();
        for i in 0..10 {
            let guard = locks.acquire("u1", &format!("bot-{}", i)).await;
            drop(guard);
        }
        let _held = locks.acquire("u2", "bot-live").await;
        assert_eq!(locks.tracked_pairs().await, 1);
    }
}
