//! `dmapass [MEM_TYPE]` command

use anyhow::{Context, Result};
use colored::Colorize;
use dmapass_core::memory::{self, MemorySource, ProviderSource};
use dmapass_core::passthrough::{AutoConfirm, ConfirmationGate, LineGate};
use dmapass_core::pci::PciDevice;
use dmapass_core::provider::{HostDmaBackend, MappingDevice, TracingObserver};
use dmapass_core::vfio::SystemBackend;
use dmapass_core::{MemoryStrategy, Orchestrator, PassthroughConfig, PassthroughReport};
use std::path::PathBuf;
use tracing::{info, warn};

/// Everything the command line can set.
pub struct RunOptions {
    pub strategy: MemoryStrategy,
    pub config: Option<PathBuf>,
    pub container: Option<PathBuf>,
    pub group: Option<PathBuf>,
    pub device: Option<String>,
    pub yes: bool,
    pub simulate_provider: bool,
    pub json: bool,
}

/// Parse the optional memory type argument. Absent means anonymous memory.
pub fn parse_selector(raw: Option<&str>) -> Result<MemoryStrategy> {
    let Some(raw) = raw else {
        return Ok(MemoryStrategy::Anonymous);
    };
    let value: i64 = raw.trim().parse().with_context(|| {
        format!("invalid memory type '{}' (0: anonymous mmap, 1: dummymap, 2: devdax map)", raw)
    })?;
    Ok(MemoryStrategy::from_selector(value)?)
}

/// Run one passthrough session against the real VFIO devices.
pub fn run(options: RunOptions) -> Result<()> {
    let config = build_config(&options)?;

    if let Ok(device) = PciDevice::from_sysfs(&config.sysfs_pci_root, &config.device) {
        if !device.is_vfio_bound() {
            warn!(
                device = %config.device,
                driver = device.driver.as_deref().unwrap_or("none"),
                "Device is not bound to vfio-pci"
            );
        }
    }

    let gate: Box<dyn ConfirmationGate> =
        if options.yes { Box::new(AutoConfirm) } else { Box::new(LineGate::stdin()) };

    let report = if options.simulate_provider && config.strategy == MemoryStrategy::ProviderBacked {
        info!("Serving provider-backed memory in process");
        let mut provider =
            MappingDevice::register("dummymap", HostDmaBackend::new(), Box::new(TracingObserver));
        let source: Box<dyn MemorySource + '_> =
            Box::new(ProviderSource::new(&mut provider, config.target_addr));
        let report = Orchestrator::new(config, Box::new(SystemBackend::new()), source, gate).run();
        provider.teardown();
        report?
    } else {
        let source = memory::source_for(&config);
        Orchestrator::new(config, Box::new(SystemBackend::new()), source, gate).run()?
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn build_config(options: &RunOptions) -> Result<PassthroughConfig> {
    let mut config = match &options.config {
        Some(path) => PassthroughConfig::load(path)?,
        None => PassthroughConfig::default(),
    };

    // Flags override the file
    config.strategy = options.strategy;
    if let Some(container) = &options.container {
        config.container_path = container.clone();
    }
    if let Some(group) = &options.group {
        config.group_path = Some(group.clone());
    }
    if let Some(device) = &options.device {
        config.device = device.clone();
    }

    config.validate()?;
    Ok(config)
}

fn print_report(report: &PassthroughReport) {
    println!("{} Passthrough complete: {}", "✓".green().bold(), report.device.bold());
    println!("  Group:   {}", report.group.display());
    println!(
        "  Memory:  {} at {:#x} ({:#x} bytes)",
        report.strategy, report.memory.start, report.memory.len
    );
    println!("  DMA:     vaddr {:#x} -> iova {:#x}", report.dma.vaddr, report.dma.iova);
    println!("  IOMMU:   page sizes {:#x}", report.iommu.iova_pgsizes);

    let info = &report.snapshot.info;
    println!(
        "  Device:  flags {:#x}, {} regions, {} irqs",
        info.flags, info.num_regions, info.num_irqs
    );
    for region in &report.snapshot.regions {
        println!(
            "    region {:<2} flags {:#06x} size {:#x} offset {:#x}{}",
            region.index,
            region.flags,
            region.size,
            region.offset,
            if region.is_mappable() { " mmap" } else { "" }
        );
    }
    for irq in &report.snapshot.irqs {
        println!("    irq    {:<2} flags {:#06x} count {}", irq.index, irq.flags, irq.count);
    }

    let reset = report.reset.to_string();
    let reset = match report.reset {
        dmapass_core::vfio::ResetOutcome::Completed => reset.green(),
        dmapass_core::vfio::ResetOutcome::Unsupported => reset.dimmed(),
        dmapass_core::vfio::ResetOutcome::Failed(_) => reset.yellow(),
    };
    println!("  Reset:   {}", reset);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!(parse_selector(None).unwrap(), MemoryStrategy::Anonymous);
        assert_eq!(parse_selector(Some("1")).unwrap(), MemoryStrategy::ProviderBacked);
        assert_eq!(parse_selector(Some("2")).unwrap(), MemoryStrategy::PersistentMemory);
        assert!(parse_selector(Some("5")).is_err());
        assert!(parse_selector(Some("-1")).is_err());
        assert!(parse_selector(Some("devdax")).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let options = RunOptions {
            strategy: MemoryStrategy::PersistentMemory,
            config: None,
            container: Some(PathBuf::from("/tmp/vfio")),
            group: Some(PathBuf::from("/dev/vfio/7")),
            device: Some("0000:01:00.0".to_string()),
            yes: true,
            simulate_provider: false,
            json: false,
        };

        let config = build_config(&options).unwrap();
        assert_eq!(config.strategy, MemoryStrategy::PersistentMemory);
        assert_eq!(config.container_path, PathBuf::from("/tmp/vfio"));
        assert_eq!(config.group_path, Some(PathBuf::from("/dev/vfio/7")));
        assert_eq!(config.device, "0000:01:00.0");
    }

    #[test]
    fn test_invalid_device_rejected() {
        let options = RunOptions {
            strategy: MemoryStrategy::Anonymous,
            config: None,
            container: None,
            group: None,
            device: Some("11:00.0".to_string()),
            yes: true,
            simulate_provider: false,
            json: false,
        };
        assert!(build_config(&options).is_err());
    }
}
