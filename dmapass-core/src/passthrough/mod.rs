//! Passthrough orchestration.
//!
//! Walks the VFIO protocol once, strictly in order:
//!
//! ```text
//! Init → ContainerOpen → ApiChecked → ExtensionChecked → GroupOpen
//!      → GroupViable → Attached → IommuEnabled → MemoryAcquired
//!      → AwaitingConfirmation → DmaMapped → DeviceAcquired
//!      → DeviceIntrospected → Reset → Done
//! ```
//!
//! Any failure stops the walk and is reported with the stage that failed.
//! Everything acquired so far is owned by a session and released in
//! reverse order when it drops, on success and on failure alike.

pub mod gate;

pub use gate::{AutoConfirm, ConfirmationGate, LineGate};

use crate::config::PassthroughConfig;
use crate::error::{DmaPassError, Result};
use crate::memory::{MemorySource, MemoryStrategy, VirtRange};
use crate::observability::metrics;
use crate::vfio::sys::VFIO_API_VERSION;
use crate::vfio::{
    self, Container, Device, DeviceSnapshot, DmaMapping, DmaRegistry, Group, IommuInfo,
    ResetOutcome, VfioBackend,
};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Steps of a passthrough session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Init,
    ContainerOpen,
    ApiChecked,
    ExtensionChecked,
    GroupOpen,
    GroupViable,
    Attached,
    IommuEnabled,
    MemoryAcquired,
    AwaitingConfirmation,
    DmaMapped,
    DeviceAcquired,
    DeviceIntrospected,
    Reset,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ContainerOpen => "container_open",
            Stage::ApiChecked => "api_checked",
            Stage::ExtensionChecked => "extension_checked",
            Stage::GroupOpen => "group_open",
            Stage::GroupViable => "group_viable",
            Stage::Attached => "attached",
            Stage::IommuEnabled => "iommu_enabled",
            Stage::MemoryAcquired => "memory_acquired",
            Stage::AwaitingConfirmation => "awaiting_confirmation",
            Stage::DmaMapped => "dma_mapped",
            Stage::DeviceAcquired => "device_acquired",
            Stage::DeviceIntrospected => "device_introspected",
            Stage::Reset => "reset",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A session failure and the stage it happened in.
#[derive(Debug, Error)]
#[error("passthrough failed at stage {stage}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: DmaPassError,
}

fn reached(stages: &mut Vec<Stage>, stage: Stage) {
    debug!(stage = %stage, "Stage reached");
    stages.push(stage);
}

fn at<T>(stage: Stage, result: Result<T>) -> std::result::Result<T, StageError> {
    result.map_err(|source| StageError { stage, source })
}

/// What a completed session observed.
#[derive(Debug, Clone, Serialize)]
pub struct PassthroughReport {
    pub device: String,
    pub group: PathBuf,
    pub strategy: MemoryStrategy,
    /// Stages completed, in order.
    pub stages: Vec<Stage>,
    pub iommu: IommuInfo,
    pub memory: VirtRange,
    pub dma: DmaMapping,
    pub snapshot: DeviceSnapshot,
    pub reset: ResetOutcome,
}

/// Everything a session holds. Dropping it releases the lot, newest first.
struct Session<'a> {
    memory: Box<dyn MemorySource + 'a>,
    container: Option<Box<dyn Container>>,
    group: Option<Box<dyn Group>>,
    group_path: Option<PathBuf>,
    attached: bool,
    range: Option<VirtRange>,
    dma: DmaRegistry,
    device: Option<Box<dyn Device>>,
    stages: Vec<Stage>,
}

impl<'a> Session<'a> {
    fn new(memory: Box<dyn MemorySource + 'a>) -> Self {
        Self {
            memory,
            container: None,
            group: None,
            group_path: None,
            attached: false,
            range: None,
            dma: DmaRegistry::new(),
            device: None,
            stages: vec![Stage::Init],
        }
    }

    fn drive(
        &mut self,
        config: &PassthroughConfig,
        backend: &dyn VfioBackend,
        gate: &mut dyn ConfirmationGate,
    ) -> std::result::Result<PassthroughReport, StageError> {
        let container = at(Stage::ContainerOpen, backend.open_container(&config.container_path))?;
        let container: &dyn Container = &**self.container.insert(container);
        reached(&mut self.stages, Stage::ContainerOpen);

        let version = at(Stage::ApiChecked, container.api_version())?;
        if version != VFIO_API_VERSION {
            return Err(StageError {
                stage: Stage::ApiChecked,
                source: DmaPassError::ProtocolMismatch {
                    reason: format!(
                        "unknown API version {} (expected {})",
                        version, VFIO_API_VERSION
                    ),
                },
            });
        }
        reached(&mut self.stages, Stage::ApiChecked);

        if !at(Stage::ExtensionChecked, container.check_extension(config.iommu_model))? {
            return Err(StageError {
                stage: Stage::ExtensionChecked,
                source: DmaPassError::ProtocolMismatch {
                    reason: format!("{} not supported", config.iommu_model),
                },
            });
        }
        reached(&mut self.stages, Stage::ExtensionChecked);

        let group_path = at(Stage::GroupOpen, config.resolve_group_path())?;
        let group = at(Stage::GroupOpen, backend.open_group(&group_path))?;
        let group: &dyn Group = &**self.group.insert(group);
        self.group_path = Some(group_path.clone());
        reached(&mut self.stages, Stage::GroupOpen);

        let status = at(Stage::GroupViable, group.status())?;
        if !status.is_viable() {
            return Err(StageError {
                stage: Stage::GroupViable,
                source: DmaPassError::Unviable { group: group_path },
            });
        }
        if status.container_set() {
            warn!(group = %group_path.display(), "Group is already attached to a container");
        }
        reached(&mut self.stages, Stage::GroupViable);

        at(Stage::Attached, group.set_container(container))?;
        self.attached = true;
        reached(&mut self.stages, Stage::Attached);

        at(Stage::IommuEnabled, container.set_iommu(config.iommu_model))?;
        let iommu = at(Stage::IommuEnabled, container.iommu_info())?;
        info!(
            model = %config.iommu_model,
            iova_pgsizes = %format!("{:#x}", iommu.iova_pgsizes),
            "IOMMU enabled"
        );
        reached(&mut self.stages, Stage::IommuEnabled);

        let range = at(Stage::MemoryAcquired, self.memory.acquire(config.map_size))?;
        self.range = Some(range);
        info!(
            strategy = %self.memory.strategy(),
            addr = %format!("{:#x}", range.start),
            len = range.len,
            "Memory acquired"
        );
        reached(&mut self.stages, Stage::MemoryAcquired);

        let prompt = format!(
            "Mapped {:#x} bytes of {} memory at {:#x}, about to map DMA at IOVA {:#x}.",
            range.len,
            self.memory.strategy(),
            range.start,
            config.iova
        );
        at(Stage::AwaitingConfirmation, gate.confirm(&prompt))?;
        reached(&mut self.stages, Stage::AwaitingConfirmation);

        let mapping = DmaMapping::read_write(range.start, config.iova, range.len as u64);
        at(Stage::DmaMapped, self.dma.map(container, mapping, Some(&iommu)))?;
        reached(&mut self.stages, Stage::DmaMapped);

        let device = at(Stage::DeviceAcquired, group.open_device(&config.device))?;
        let device: &dyn Device = &**self.device.insert(device);
        reached(&mut self.stages, Stage::DeviceAcquired);

        let snapshot = at(Stage::DeviceIntrospected, vfio::introspect(device))?;
        reached(&mut self.stages, Stage::DeviceIntrospected);

        let reset = vfio::reset(device, &snapshot.info);
        reached(&mut self.stages, Stage::Reset);

        Ok(PassthroughReport {
            device: config.device.clone(),
            group: group_path,
            strategy: self.memory.strategy(),
            stages: Vec::new(),
            iommu,
            memory: range,
            dma: mapping,
            snapshot,
            reset,
        })
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            debug!(device = %device.name(), "Closing device");
            drop(device);
        }

        if let Some(container) = self.container.as_deref() {
            self.dma.unmap_all(container);
        }

        if let Some(range) = self.range.take() {
            match self.memory.release(range) {
                Ok(()) => debug!(addr = %format!("{:#x}", range.start), "Memory released"),
                Err(e) => warn!(error = %e, "Memory release failed"),
            }
        }

        if let Some(group) = self.group.take() {
            if self.attached {
                if let Err(e) = group.unset_container() {
                    warn!(error = %e, "Failed to detach group from container");
                }
                self.attached = false;
            }
            if let Some(path) = &self.group_path {
                debug!(group = %path.display(), "Closing group");
            }
            drop(group);
        }

        if let Some(container) = self.container.take() {
            debug!("Closing container");
            drop(container);
        }
    }
}

/// Runs one passthrough session against a VFIO backend.
pub struct Orchestrator<'a> {
    config: PassthroughConfig,
    backend: Box<dyn VfioBackend + 'a>,
    memory: Box<dyn MemorySource + 'a>,
    gate: Box<dyn ConfirmationGate + 'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: PassthroughConfig,
        backend: Box<dyn VfioBackend + 'a>,
        memory: Box<dyn MemorySource + 'a>,
        gate: Box<dyn ConfirmationGate + 'a>,
    ) -> Self {
        Self { config, backend, memory, gate }
    }

    /// Walk every stage, then tear the session down.
    pub fn run(self) -> std::result::Result<PassthroughReport, StageError> {
        let Orchestrator { config, backend, memory, mut gate } = self;
        let started = Instant::now();

        info!(
            device = %config.device,
            strategy = %config.strategy,
            size = config.map_size,
            iova = %format!("{:#x}", config.iova),
            "Starting passthrough session"
        );

        let mut session = Session::new(memory);
        let outcome = session.drive(&config, &*backend, &mut *gate);
        let mut stages = std::mem::take(&mut session.stages);
        drop(session);

        metrics::record_session(started.elapsed().as_secs_f64());

        match outcome {
            Ok(mut report) => {
                stages.push(Stage::Done);
                report.stages = stages;
                info!(
                    device = %report.device,
                    regions = report.snapshot.regions.len(),
                    irqs = report.snapshot.irqs.len(),
                    reset = %report.reset,
                    "Passthrough session complete"
                );
                Ok(report)
            }
            Err(e) => {
                metrics::record_stage_failure(e.stage.as_str());
                error!(stage = %e.stage, error = %e.source, "Passthrough session failed");
                Err(e)
            }
        }
    }
}
