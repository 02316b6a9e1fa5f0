use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use sysinfo::System;
use tracing::debug;

use crate::clock::CancelToken;

const UNKNOWN: f64 = -1.0;

#[derive(Debug)]
struct Gauge(AtomicU64);

impl Gauge {
    fn new() -> Self {
        Gauge(AtomicU64::new(UNKNOWN.to_bits()))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Host and process gauges read by system rules and the scenario
/// detector. A negative reading means unknown and never blocks.
#[derive(Debug)]
pub struct SystemStatus {
    load: Gauge,
    cpu_usage: Gauge,
    thread_pool_usage: Gauge,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            load: Gauge::new(),
            cpu_usage: Gauge::new(),
            thread_pool_usage: Gauge::new(),
        }
    }
}

impl SystemStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-minute load average.
    pub fn load(&self) -> f64 {
        self.load.get()
    }

    pub fn set_load(&self, load: f64) {
        self.load.set(load);
    }

    /// Host CPU usage as a fraction.
    pub fn cpu_usage(&self) -> f64 {
        self.cpu_usage.get()
    }

    pub fn set_cpu_usage(&self, usage: f64) {
        self.cpu_usage.set(usage);
    }

    /// Busy share of the application's worker pool, as reported by the
    /// application.
    pub fn thread_pool_usage(&self) -> f64 {
        self.thread_pool_usage.get()
    }

    pub fn set_thread_pool_usage(&self, usage: f64) {
        self.thread_pool_usage.set(usage);
    }

    /// Starts a thread refreshing load and CPU usage every `interval`.
    ///
    /// The thread stops when the returned handle is dropped.
    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration) -> std::io::Result<SamplerHandle> {
        let cancel = CancelToken::new();
        let status = Arc::clone(self);
        let stop = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("shot-guard-system-sampler".into())
            .spawn(move || {
                let mut system = System::new();
                loop {
                    system.refresh_cpu_usage();
                    let cpu = system.global_cpu_usage() as f64 / 100.0;
                    let load = System::load_average().one;
                    status.set_cpu_usage(cpu);
                    status.set_load(load);
                    debug!(cpu, load, "system status sampled");
                    if stop.wait_timeout(interval) {
                        return;
                    }
                }
            })?;
        Ok(SamplerHandle {
            cancel,
            thread: Some(thread),
        })
    }
}

/// Owns the sampler thread; dropping it stops and joins the thread.
#[derive(Debug)]
pub struct SamplerHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_start_unknown() {
        let status = SystemStatus::new();
        assert!(status.load() < 0.0);
        assert!(status.cpu_usage() < 0.0);
        status.set_thread_pool_usage(0.75);
        assert_eq!(status.thread_pool_usage(), 0.75);
    }

    #[test]
    fn sampler_fills_cpu_and_stops_on_drop() {
        let status = Arc::new(SystemStatus::new());
        let handle = status.spawn_sampler(Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while status.cpu_usage() < 0.0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(status.cpu_usage() >= 0.0);
        drop(handle);
        assert_eq!(Arc::strong_count(&status), 1);
    }
}
