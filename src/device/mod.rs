//! Device Registry (C4): enumerates capture devices via the `DeviceProbe`
//! capability and tracks readiness through hotplug + periodic/event-driven
//! signal probes.
//!
//! The actual V4L2/ALSA ioctl calls stay behind the `DeviceProbe` trait per
//! §1's scope boundary; this module only owns the state machine and retry
//! policy around it.

pub mod hotplug;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::model::{Device, DeviceAction, DeviceKind, FormatInfo, Framerate, Resolution, SignalState};

pub use hotplug::{parse_hotplug_message, HotplugEvent};

/// Periodic reprobe interval for devices that currently have signal.
pub const SIGNAL_REPROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Per-call timeout for the event-driven wait used on devices without signal.
pub const SIGNAL_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Settle window after a hotplug `add` before rescanning.
pub const HOTPLUG_ADD_SETTLE: Duration = Duration::from_secs(1);

/// Host-supplied capability: the actual V4L2/ALSA probing.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn list(&self) -> Result<Vec<Device>>;
    async fn probe_formats(&self, path: &str) -> Result<Vec<FormatInfo>>;
    async fn probe_resolutions(&self, path: &str, fmt: &str) -> Result<Vec<Resolution>>;
    async fn probe_framerates(&self, path: &str, fmt: &str, w: u32, h: u32) -> Result<Vec<Framerate>>;
    async fn probe_signal(&self, path: &str) -> Result<SignalState>;
    /// Blocks up to `timeout_ms` for a signal-state change; returns the
    /// number of changes observed (0 on timeout).
    async fn wait_signal_change(&self, path: &str, timeout_ms: u64) -> Result<u64>;
}

/// Host-supplied capability: the OS hotplug event channel.
#[async_trait]
pub trait HotplugSource: Send + Sync {
    async fn subscribe(&self) -> Result<tokio::sync::mpsc::Receiver<HotplugEvent>>;
}

/// In-memory registry of attached devices, owned exclusively by C4.
pub struct DeviceRegistry {
    probe: Arc<dyn DeviceProbe>,
    hotplug: Arc<dyn HotplugSource>,
    bus: Arc<EventBus>,
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new(probe: Arc<dyn DeviceProbe>, hotplug: Arc<dyn HotplugSource>, bus: Arc<EventBus>) -> Self {
        Self {
            probe,
            hotplug,
            bus,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn list(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    /// Full rescan: replace the in-memory table with a fresh probe, emitting
    /// a `DeviceDiscovery` event for every device whose known state changed.
    pub async fn rescan(&self) -> Result<()> {
        let fresh = self.probe.list().await?;
        let mut fresh_by_id: HashMap<String, Device> =
            fresh.into_iter().map(|d| (d.device_id.clone(), d)).collect();

        let mut guard = self.devices.write();
        let previous_ids: Vec<String> = guard.keys().cloned().collect();

        for id in &previous_ids {
            if !fresh_by_id.contains_key(id) {
                if let Some(removed) = guard.remove(id) {
                    self.bus.publish(Event::DeviceDiscovery {
                        action: DeviceAction::Remove,
                        device: removed,
                        ts: chrono::Utc::now(),
                    });
                }
            }
        }

        for (id, device) in fresh_by_id.drain() {
            let action = match guard.get(&id) {
                None => Some(DeviceAction::Add),
                Some(old) if old.ready != device.ready => Some(DeviceAction::StatusChanged),
                _ => None,
            };
            guard.insert(id, device.clone());
            if let Some(action) = action {
                self.bus.publish(Event::DeviceDiscovery {
                    action,
                    device,
                    ts: chrono::Utc::now(),
                });
            }
        }

        Ok(())
    }

    fn set_ready(&self, device_id: &str, ready: bool) -> Option<Device> {
        let mut guard = self.devices.write();
        let device = guard.get_mut(device_id)?;
        if device.ready == ready {
            return None;
        }
        device.ready = ready;
        device.last_change_ts = chrono::Utc::now();
        Some(device.clone())
    }

    /// Drive the hotplug subscription loop until `cancel` fires: `add` gets a
    /// settle window then a rescan; `remove` rescans immediately.
    pub async fn run_hotplug_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut rx = self.hotplug.subscribe().await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    match event.action.as_str() {
                        "add" => {
                            tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(HOTPLUG_ADD_SETTLE) => {}
                            }
                            if let Err(e) = self.rescan().await {
                                tracing::warn!(error = %e, "rescan after hotplug add failed");
                            }
                        }
                        "remove" => {
                            if let Err(e) = self.rescan().await {
                                tracing::warn!(error = %e, "rescan after hotplug remove failed");
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Drive the per-device signal-tracking loops until `cancel` fires:
    /// devices with signal get a periodic reprobe, devices without signal
    /// get an event-driven wait with a timeout so a missed wakeup still
    /// self-heals on the next loop iteration.
    pub async fn run_signal_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            let targets: Vec<(String, String, bool)> = self
                .devices
                .read()
                .values()
                .filter(|d| d.kind == DeviceKind::Hdmi)
                .map(|d| (d.device_id.clone(), d.kernel_path.clone(), d.ready))
                .collect();

            for (device_id, kernel_path, was_ready) in targets {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if was_ready {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(SIGNAL_REPROBE_INTERVAL) => {}
                    }
                    if let Ok(state) = self.probe.probe_signal(&kernel_path).await {
                        if let Some(device) = self.set_ready(&device_id, state.is_ready()) {
                            self.bus.publish(Event::DeviceDiscovery {
                                action: DeviceAction::StatusChanged,
                                device,
                                ts: chrono::Utc::now(),
                            });
                        }
                    }
                } else {
                    match self
                        .probe
                        .wait_signal_change(&kernel_path, SIGNAL_WAIT_TIMEOUT.as_millis() as u64)
                        .await
                    {
                        Ok(n) if n > 0 => {
                            if let Ok(state) = self.probe.probe_signal(&kernel_path).await {
                                if let Some(device) = self.set_ready(&device_id, state.is_ready()) {
                                    self.bus.publish(Event::DeviceDiscovery {
                                        action: DeviceAction::StatusChanged,
                                        device,
                                        ts: chrono::Utc::now(),
                                    });
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            if targets_empty(&self) {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

fn targets_empty(registry: &DeviceRegistry) -> bool {
    !registry
        .devices
        .read()
        .values()
        .any(|d| d.kind == DeviceKind::Hdmi)
}
