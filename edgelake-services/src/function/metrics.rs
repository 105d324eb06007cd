use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct FunctionMetrics {
    calls: AtomicU64,
    call_time_ns: AtomicU64,
    cold_starts: AtomicU64,
    cold_start_ns: AtomicU64,
    max_memory: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionStats {
    pub calls: u64,
    pub avg_call_time: Duration,
    pub cold_starts: u64,
    pub avg_cold_start: Duration,
    /// Bytes.
    pub max_memory: u64,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn average(total_ns: u64, count: u64) -> Duration {
    match count {
        0 => Duration::ZERO,
        n => Duration::from_nanos(total_ns / n),
    }
}

impl FunctionMetrics {
    pub fn record_call(&self, elapsed: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.call_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_cold_start(&self, elapsed: Duration) {
        self.cold_starts.fetch_add(1, Ordering::Relaxed);
        self.cold_start_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_memory(&self, bytes: u64) {
        self.max_memory.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FunctionStats {
        let calls = self.calls.load(Ordering::Relaxed);
        let cold_starts = self.cold_starts.load(Ordering::Relaxed);
        FunctionStats {
            calls,
            avg_call_time: average(self.call_time_ns.load(Ordering::Relaxed), calls),
            cold_starts,
            avg_cold_start: average(self.cold_start_ns.load(Ordering::Relaxed), cold_starts),
            max_memory: self.max_memory.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average_and_high_water() {
        let m = FunctionMetrics::default();
        assert_eq!(m.snapshot().avg_call_time, Duration::ZERO);

        m.record_call(Duration::from_millis(10));
        m.record_call(Duration::from_millis(30));
        m.record_memory(4096);
        m.record_memory(1024);

        let stats = m.snapshot();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.avg_call_time, Duration::from_millis(20));
        assert_eq!(stats.max_memory, 4096);
        assert_eq!(stats.cold_starts, 0);
    }
}
