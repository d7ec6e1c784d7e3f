//! Host capacity measurement.
//!
//! Used to size the local container pool when the operator does not
//! configure it explicitly.

/// CPU and memory capacity of the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub cpus: f64,
    pub total_memory_mb: i64,
    pub available_memory_mb: i64,
}

const FALLBACK_TOTAL_MB: i64 = 16 * 1024;
const FALLBACK_AVAILABLE_MB: i64 = 8 * 1024;

impl HostCapacity {
    pub fn measure() -> Self {
        let (total_memory_mb, available_memory_mb) = memory_mb();
        Self {
            cpus: cpu_count() as f64,
            total_memory_mb,
            available_memory_mb,
        }
    }
}

fn cpu_count() -> usize {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as usize;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn memory_mb() -> (i64, i64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(parsed) = parse_meminfo(&meminfo) {
            return parsed;
        }
    }
    sysconf_memory_mb().unwrap_or((FALLBACK_TOTAL_MB, FALLBACK_AVAILABLE_MB))
}

#[cfg(not(target_os = "linux"))]
fn memory_mb() -> (i64, i64) {
    sysconf_memory_mb()
        .map(|(total, _)| (total, total / 2))
        .unwrap_or((FALLBACK_TOTAL_MB, FALLBACK_AVAILABLE_MB))
}

#[cfg(unix)]
fn sysconf_memory_mb() -> Option<(i64, i64)> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size <= 0 || total_pages <= 0 {
        return None;
    }

    let total = (page_size as i64 * total_pages as i64) / (1024 * 1024);

    #[cfg(target_os = "linux")]
    let available = {
        let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
        if avail_pages > 0 {
            (page_size as i64 * avail_pages as i64) / (1024 * 1024)
        } else {
            total
        }
    };
    #[cfg(not(target_os = "linux"))]
    let available = total;

    Some((total, available))
}

#[cfg(not(unix))]
fn sysconf_memory_mb() -> Option<(i64, i64)> {
    None
}

/// Parse `/proc/meminfo` into (total, available) megabytes.
#[cfg(any(target_os = "linux", test))]
fn parse_meminfo(content: &str) -> Option<(i64, i64)> {
    let mut total_kb = 0i64;
    let mut available_kb = None;
    let mut reclaimable_kb = 0i64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<i64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total_kb = kb,
            "MemAvailable:" => available_kb = Some(kb),
            "MemFree:" | "Buffers:" | "Cached:" => reclaimable_kb += kb,
            _ => {}
        }
    }

    if total_kb == 0 {
        return None;
    }
    let available_kb = available_kb.unwrap_or(reclaimable_kb);
    Some((total_kb / 1024, available_kb / 1024))
}
