use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use candle_core::Device;

/// Ordered work queue on one device.
///
/// candle submits work to a single queue per device, so two streams on the same
/// device are already ordered; a stream only has to synchronize when it waits on
/// an event recorded against another device.
#[derive(Debug, Clone)]
pub struct Stream {
    device: Device,
    recorded: Arc<AtomicU64>,
}

impl Stream {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            recorded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }

    pub fn record(&self) -> Event {
        let sequence = self.recorded.fetch_add(1, Ordering::AcqRel) + 1;
        Event {
            device: self.device.clone(),
            sequence,
        }
    }

    pub fn wait(&self, event: &Event) -> Result<()> {
        if !self.device.same_device(&event.device) {
            event.synchronize()?;
        }
        Ok(())
    }

    pub fn events_recorded(&self) -> u64 {
        self.recorded.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    device: Device,
    sequence: u64,
}

impl Event {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
