//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//! - `_bytes` suffix for sizes

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    describe_counter!(
        "dmapass_buffer_allocations_total",
        "Total coherent buffers allocated by the buffer provider"
    );
    describe_counter!(
        "dmapass_buffer_allocation_failures_total",
        "Total buffer provider failures (by reason: allocation, map)"
    );
    describe_histogram!("dmapass_buffer_size_bytes", "Size of each allocated coherent buffer");
    describe_counter!(
        "dmapass_dma_mappings_total",
        "Total DMA mappings registered with a container"
    );
    describe_counter!("dmapass_dma_mapped_bytes_total", "Total bytes registered for DMA");
    describe_counter!(
        "dmapass_stage_failures_total",
        "Total passthrough sessions that failed (by stage)"
    );
    describe_histogram!(
        "dmapass_session_duration_seconds",
        "Time from container open to teardown of a passthrough session"
    );
}

pub fn record_buffer_allocation(len: usize) {
    counter!("dmapass_buffer_allocations_total").increment(1);
    histogram!("dmapass_buffer_size_bytes").record(len as f64);
}

pub fn record_buffer_failure(reason: &'static str) {
    counter!("dmapass_buffer_allocation_failures_total", "reason" => reason).increment(1);
}

pub fn record_dma_map(size: u64) {
    counter!("dmapass_dma_mappings_total").increment(1);
    counter!("dmapass_dma_mapped_bytes_total").increment(size);
}

pub fn record_stage_failure(stage: &str) {
    counter!("dmapass_stage_failures_total", "stage" => stage.to_string()).increment(1);
}

pub fn record_session(duration_secs: f64) {
    histogram!("dmapass_session_duration_seconds").record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        register_core_metrics();
        record_buffer_allocation(0x20_0000);
        record_buffer_failure("map");
        record_dma_map(0x20_0000);
        record_stage_failure("group_viable");
        record_session(0.25);
    }
}
