//! Heap statistics for the status endpoint and for diagnosing allocation failures.

/// Free heap in bytes, as reported by `/api/status`.
pub fn free_bytes() -> u32 {
    esp_alloc::HEAP.free() as u32
}

/// Log current heap statistics.
pub fn log_heap_stats(context: &str) {
    let free = esp_alloc::HEAP.free();
    let used = esp_alloc::HEAP.used();
    let total = free + used;

    log::info!(
        "heap[{}]: used={}KB free={}KB (total={}KB)",
        context,
        used / 1024,
        free / 1024,
        total / 1024,
    );
}

/// Log a warning if heap is getting low.
pub fn warn_if_low(threshold_kb: usize, context: &str) {
    let free_kb = esp_alloc::HEAP.free() / 1024;
    if free_kb < threshold_kb {
        log::warn!(
            "heap[{}]: LOW MEMORY - only {}KB free (threshold={}KB)",
            context,
            free_kb,
            threshold_kb
        );
    }
}
