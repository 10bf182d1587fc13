//! Device introspection and reset.

use super::{Device, DeviceInfo, IrqInfo, RegionInfo};
use crate::error::Result;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Everything the harness learned about a device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceSnapshot {
    pub info: DeviceInfo,
    pub regions: Vec<RegionInfo>,
    pub irqs: Vec<IrqInfo>,
}

/// Outcome of the final device reset. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResetOutcome {
    Completed,
    /// The device does not advertise `VFIO_DEVICE_FLAGS_RESET`.
    Unsupported,
    Failed(String),
}

impl fmt::Display for ResetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Query device info, then every region and IRQ descriptor by index.
///
/// Zero regions or IRQs yield empty lists.
pub fn introspect(device: &dyn Device) -> Result<DeviceSnapshot> {
    let info = device.info()?;
    info!(
        device = %device.name(),
        flags = %format!("{:#x}", info.flags),
        pci = info.is_pci(),
        reset = info.supports_reset(),
        regions = info.num_regions,
        irqs = info.num_irqs,
        "Device info"
    );

    let regions = (0..info.num_regions)
        .map(|index| {
            let region = device.region_info(index)?;
            debug!(
                index,
                flags = %format!("{:#x}", region.flags),
                size = %format!("{:#x}", region.size),
                offset = %format!("{:#x}", region.offset),
                mmap = region.is_mappable(),
                "Region"
            );
            Ok(region)
        })
        .collect::<Result<Vec<_>>>()?;

    let irqs = (0..info.num_irqs)
        .map(|index| {
            let irq = device.irq_info(index)?;
            debug!(index, flags = %format!("{:#x}", irq.flags), count = irq.count, "IRQ");
            Ok(irq)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DeviceSnapshot { info, regions, irqs })
}

/// Issue a device reset if the device supports one.
pub fn reset(device: &dyn Device, info: &DeviceInfo) -> ResetOutcome {
    if !info.supports_reset() {
        warn!(device = %device.name(), "Device does not support reset, skipping");
        return ResetOutcome::Unsupported;
    }

    match device.reset() {
        Ok(()) => {
            info!(device = %device.name(), "Device reset");
            ResetOutcome::Completed
        }
        Err(e) => {
            warn!(device = %device.name(), error = %e, "Device reset failed");
            ResetOutcome::Failed(e.to_string())
        }
    }
}
