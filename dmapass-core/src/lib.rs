//! dmapass core library
//!
//! IOMMU DMA passthrough test harness: a buffer provider that hands out
//! DMA-coherent memory through a mapping entry point, and an orchestrator that
//! registers such memory with a VFIO container and introspects the target
//! device.

pub mod config;
pub mod error;
pub mod memory;
pub mod observability;
pub mod passthrough;
pub mod pci;
pub mod provider;
pub mod vfio;

// Re-export commonly used items
pub use config::PassthroughConfig;
pub use error::{DmaPassError, Result};
pub use memory::{MemorySource, MemoryStrategy, VirtRange};
pub use observability::init as init_observability;
pub use passthrough::{Orchestrator, PassthroughReport, Stage, StageError};
pub use provider::{HostDmaBackend, MappingDevice};
