use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// Wake-up channels for suspended assign calls, one per
/// (colony, executor type).
#[derive(Debug, Default)]
pub struct WakeRegistry {
    channels: Mutex<HashMap<(String, String), Arc<Notify>>>,
}

impl WakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn channel(&self, colony_name: &str, executor_type: &str) -> Arc<Notify> {
        let mut channels = self.channels.lock().await;
        channels
            .entry((colony_name.to_string(), executor_type.to_string()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every assign currently waiting on this colony and type.
    pub async fn wake(&self, colony_name: &str, executor_type: &str) {
        let channels = self.channels.lock().await;
        if let Some(notify) = channels.get(&(colony_name.to_string(), executor_type.to_string())) {
            notify.notify_waiters();
        }
    }

    /// Wake every waiter in a colony regardless of type.
    pub async fn wake_colony(&self, colony_name: &str) {
        let channels = self.channels.lock().await;
        for ((colony, _), notify) in channels.iter() {
            if colony == colony_name {
                notify.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wake_reaches_enabled_waiter() {
        let registry = WakeRegistry::new();
        let notify = registry.channel("dev", "cli").await;
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        registry.wake("dev", "cli").await;
        tokio::time::timeout(Duration::from_millis(100), notified)
            .await
            .expect("waiter should be woken");
    }

    #[tokio::test]
    async fn wake_is_scoped_to_type() {
        let registry = WakeRegistry::new();
        let notify = registry.channel("dev", "gpu").await;
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        registry.wake("dev", "cli").await;
        assert!(tokio::time::timeout(Duration::from_millis(50), notified)
            .await
            .is_err());
    }
}
