use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::ids::EnrollmentId;

const PRUNE_THRESHOLD: usize = 1024;

/// Per-enrollment mutual exclusion for read-modify-write transactions.
///
/// Two writers on the same enrollment are serialized; writers on different
/// enrollments never wait on each other. Readers don't take a lock.
#[derive(Debug, Default)]
pub struct EnrollmentLocks {
    table: Mutex<HashMap<EnrollmentId, Arc<AsyncMutex<()>>>>,
}

impl EnrollmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, enrollment_id: EnrollmentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if table.len() >= PRUNE_THRESHOLD {
                // Entries nobody holds or waits on
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            table
                .entry(enrollment_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        self.table
            .lock()
            .map(|table| table.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_enrollment_is_serialized() {
        let locks = Arc::new(EnrollmentLocks::new());
        let id = EnrollmentId::new();

        let guard = locks.acquire(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_enrollments_do_not_block() {
        let locks = EnrollmentLocks::new();
        let _first = locks.acquire(EnrollmentId::new()).await;
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(EnrollmentId::new()),
        )
        .await;
        assert!(second.is_ok());
        assert_eq!(locks.tracked(), 2);
    }
}
