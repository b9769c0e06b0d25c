//! LED Reactor (C11): drives a "system" LED off the aggregate enabled state
//! of all known streams.
//!
//! Grounded on the `DeviceRegistry`'s capability-trait boundary
//! ([`device::DeviceProbe`](crate::device::DeviceProbe)): the actual GPIO/sysfs
//! write stays behind `LedController` so platforms without an LED supply a
//! no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Solid,
    Blink,
}

impl LedPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedPattern::Solid => "solid",
            LedPattern::Blink => "blink",
        }
    }
}

/// Host-supplied capability: the actual GPIO/sysfs LED write.
#[async_trait]
pub trait LedController: Send + Sync {
    async fn set(&self, led: &str, enabled: bool, pattern: LedPattern) -> Result<()>;
    fn available(&self) -> bool;
    fn patterns(&self) -> Vec<LedPattern>;
}

const SYSTEM_LED: &str = "system";

/// Subscribes to `StreamStateChanged` and keeps the "system" LED's pattern in
/// sync with whether every known stream is currently enabled.
pub struct LedReactor {
    controller: Arc<dyn LedController>,
    states: Mutex<HashMap<String, bool>>,
}

impl LedReactor {
    pub fn new(controller: Arc<dyn LedController>) -> Self {
        Self {
            controller,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Desired pattern given the current map: blink if empty or any stream
    /// is disabled, solid only when every known stream is enabled.
    fn desired_pattern(states: &HashMap<String, bool>) -> LedPattern {
        if states.is_empty() || states.values().any(|enabled| !enabled) {
            LedPattern::Blink
        } else {
            LedPattern::Solid
        }
    }

    async fn apply(&self) {
        if !self.controller.available() {
            return;
        }
        let pattern = Self::desired_pattern(&self.states.lock());
        if let Err(e) = self.controller.set(SYSTEM_LED, true, pattern).await {
            tracing::warn!(error = %e, "failed to drive system LED");
        }
    }

    async fn handle_event(&self, event: Event) {
        if let Event::StreamStateChanged {
            stream_id, enabled, ..
        } = event
        {
            self.states.lock().insert(stream_id, enabled);
            self.apply().await;
        }
    }

    /// Drains the bus until it closes, updating the LED on every
    /// `StreamStateChanged` event.
    pub async fn run(self: Arc<Self>, bus: Arc<EventBus>) {
        let mut rx = bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeLed {
        calls: AsyncMutex<Vec<(String, bool, LedPattern)>>,
        available: bool,
    }

    #[async_trait]
    impl LedController for FakeLed {
        async fn set(&self, led: &str, enabled: bool, pattern: LedPattern) -> Result<()> {
            self.calls
                .lock()
                .await
                .push((led.to_string(), enabled, pattern));
            Ok(())
        }
        fn available(&self) -> bool {
            self.available
        }
        fn patterns(&self) -> Vec<LedPattern> {
            vec![LedPattern::Solid, LedPattern::Blink]
        }
    }

    fn changed(stream_id: &str, enabled: bool) -> Event {
        Event::StreamStateChanged {
            stream_id: stream_id.into(),
            enabled,
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_map_drives_blink() {
        let led = Arc::new(FakeLed {
            calls: AsyncMutex::new(vec![]),
            available: true,
        });
        let reactor = LedReactor::new(led.clone());
        reactor.apply().await;
        let calls = led.calls.lock().await;
        assert_eq!(calls.last().unwrap().2, LedPattern::Blink);
    }

    #[tokio::test]
    async fn all_enabled_drives_solid() {
        let led = Arc::new(FakeLed {
            calls: AsyncMutex::new(vec![]),
            available: true,
        });
        let reactor = LedReactor::new(led.clone());
        reactor.handle_event(changed("cam1", true)).await;
        reactor.handle_event(changed("cam2", true)).await;
        let calls = led.calls.lock().await;
        assert_eq!(calls.last().unwrap().2, LedPattern::Solid);
    }

    #[tokio::test]
    async fn any_disabled_drives_blink() {
        let led = Arc::new(FakeLed {
            calls: AsyncMutex::new(vec![]),
            available: true,
        });
        let reactor = LedReactor::new(led.clone());
        reactor.handle_event(changed("cam1", true)).await;
        reactor.handle_event(changed("cam2", false)).await;
        let calls = led.calls.lock().await;
        assert_eq!(calls.last().unwrap().2, LedPattern::Blink);
    }

    #[tokio::test]
    async fn unavailable_controller_is_never_called() {
        let led = Arc::new(FakeLed {
            calls: AsyncMutex::new(vec![]),
            available: false,
        });
        let reactor = LedReactor::new(led.clone());
        reactor.handle_event(changed("cam1", true)).await;
        assert!(led.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn run_reacts_to_bus_events() {
        let bus = Arc::new(EventBus::new());
        let led = Arc::new(FakeLed {
            calls: AsyncMutex::new(vec![]),
            available: true,
        });
        let reactor = Arc::new(LedReactor::new(led.clone()));

        let bus_clone = bus.clone();
        let reactor_clone = reactor.clone();
        let handle = tokio::spawn(async move { reactor_clone.run(bus_clone).await });

        bus.publish(changed("cam1", true));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        assert!(!led.calls.lock().await.is_empty());
    }
}
