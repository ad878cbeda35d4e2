//! 性能采样 (外围监控)
//!
//! 独立线程按固定间隔采样进程外资源指标 (CPU/内存), 滚动保留最近
//! 100 个数据点供监控界面绘图。与检测正确性零耦合, 采样失败只产出
//! 零值快照。Linux 下读 /proc, 其它平台退化为零值。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// 采样点上限 (与监控界面的绘图窗口一致)
const HISTORY_CAP: usize = 100;

/// 一次资源采样
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfSnapshot {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub mem_used_gb: f32,
    pub mem_total_gb: f32,
}

/// 性能采样器
pub struct PerformanceSampler {
    stop: Arc<AtomicBool>,
    history: Arc<Mutex<VecDeque<PerfSnapshot>>>,
    handle: Option<JoinHandle<()>>,
}

impl PerformanceSampler {
    /// 启动采样线程
    pub fn start(interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let history = Arc::new(Mutex::new(VecDeque::with_capacity(HISTORY_CAP)));

        let stop_flag = stop.clone();
        let history_buf = history.clone();
        let handle = std::thread::spawn(move || {
            let mut prev_cpu = read_cpu_totals();
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(interval);

                let cpu = read_cpu_totals();
                let cpu_percent = match (prev_cpu, cpu) {
                    (Some((idle0, total0)), Some((idle1, total1))) if total1 > total0 => {
                        let idle = (idle1 - idle0) as f32;
                        let total = (total1 - total0) as f32;
                        ((1.0 - idle / total) * 100.0).clamp(0.0, 100.0)
                    }
                    _ => 0.0,
                };
                prev_cpu = cpu;

                let (mem_used_gb, mem_total_gb) = read_memory().unwrap_or((0.0, 0.0));
                let snapshot = PerfSnapshot {
                    cpu_percent,
                    mem_percent: if mem_total_gb > 0.0 {
                        mem_used_gb / mem_total_gb * 100.0
                    } else {
                        0.0
                    },
                    mem_used_gb,
                    mem_total_gb,
                };

                if let Ok(mut buf) = history_buf.lock() {
                    if buf.len() == HISTORY_CAP {
                        buf.pop_front();
                    }
                    buf.push_back(snapshot);
                }
            }
        });

        Self {
            stop,
            history,
            handle: Some(handle),
        }
    }

    /// 最近一次采样
    pub fn latest(&self) -> Option<PerfSnapshot> {
        self.history
            .lock()
            .ok()
            .and_then(|buf| buf.back().copied())
    }

    /// 滚动历史 (旧→新)
    pub fn history(&self) -> Vec<PerfSnapshot> {
        self.history
            .lock()
            .map(|buf| buf.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 停止采样线程
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PerformanceSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// /proc/stat 首行 → (idle, total) 累计节拍
#[cfg(target_os = "linux")]
fn read_cpu_totals() -> Option<(u64, u64)> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((idle, fields.iter().sum()))
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_totals() -> Option<(u64, u64)> {
    None
}

/// /proc/meminfo → (已用GB, 总GB)
#[cfg(target_os = "linux")]
fn read_memory() -> Option<(f32, f32)> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total_kb = parts.next()?.parse::<f32>().ok(),
            Some("MemAvailable:") => available_kb = parts.next()?.parse::<f32>().ok(),
            _ => {}
        }
    }
    let total = total_kb? / 1024.0 / 1024.0;
    let available = available_kb? / 1024.0 / 1024.0;
    Some((total - available, total))
}

#[cfg(not(target_os = "linux"))]
fn read_memory() -> Option<(f32, f32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_produces_snapshots_and_stops() {
        let sampler = PerformanceSampler::start(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(60));
        let history = sampler.history();
        sampler.stop();

        assert!(!history.is_empty());
        assert!(history.len() <= HISTORY_CAP);
        for snap in history {
            assert!((0.0..=100.0).contains(&snap.cpu_percent));
            assert!(snap.mem_used_gb <= snap.mem_total_gb || snap.mem_total_gb == 0.0);
        }
    }

    #[test]
    fn test_latest_matches_history_tail() {
        let sampler = PerformanceSampler::start(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(30));
        let latest = sampler.latest();
        let history = sampler.history();
        sampler.stop();

        if let Some(last) = history.last() {
            assert!(latest.is_some());
            let _ = last;
        }
    }
}
