use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

type Pending = HashMap<String, (u64, JoinHandle<()>)>;

/// Keyed trailing-edge debouncer: within the window only the last call runs.
#[derive(Clone, Default)]
pub struct Debouncer {
    pending: Arc<Mutex<Pending>>,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debounce<F, Fut>(&self, key: impl Into<String>, delay: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let task_key = key.clone();

        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                if map.get(&task_key).is_some_and(|(g, _)| *g == generation) {
                    map.remove(&task_key);
                }
            }
            f().await;
        });

        if let Some((_, previous)) = guard.insert(key.clone(), (generation, handle)) {
            debug!(key = %key, "Superseding debounced call");
            previous.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|m| m.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_once_with_last_args() {
        let debouncer = Debouncer::new();
        let calls = Arc::new(AsyncMutex::new(Vec::new()));

        for i in 0..5 {
            let calls = calls.clone();
            debouncer.debounce("ticket:1", Duration::from_millis(1000), move || async move {
                calls.lock().await.push(i);
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(*calls.lock().await, vec![4]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let debouncer = Debouncer::new();
        let calls = Arc::new(AsyncMutex::new(Vec::new()));

        for key in ["ticket:1", "ticket:2"] {
            let calls = calls.clone();
            debouncer.debounce(key, Duration::from_millis(100), move || async move {
                calls.lock().await.push(key);
            });
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut seen = calls.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec!["ticket:1", "ticket:2"]);
    }
}
