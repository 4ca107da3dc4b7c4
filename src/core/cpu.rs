// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CPU topology helpers: hybrid-core detection, current-CPU sampling and
//! worker pinning.

#[allow(unused_imports)]
use crate::macros::{log_debug, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::sync::OnceLock;

/// Returns whether the CPU exposes heterogeneous core types.
///
/// The result is computed once and cached for the process lifetime; the
/// topology cannot change underneath a running pool.
pub fn is_hybrid() -> bool {
    static HYBRID: OnceLock<bool> = OnceLock::new();
    *HYBRID.get_or_init(detect_hybrid)
}

/// Heterogeneous core types show up as different maximum frequencies in the
/// cpufreq tree.
#[cfg(all(not(miri), target_os = "linux"))]
fn detect_hybrid() -> bool {
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/cpu") else {
        return false;
    };

    let mut min_freq = u64::MAX;
    let mut max_freq = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("cpu") || !name[3..].bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let path = entry.path().join("cpufreq/cpuinfo_max_freq");
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        let Ok(freq) = contents.trim().parse::<u64>() else {
            continue;
        };
        min_freq = min_freq.min(freq);
        max_freq = max_freq.max(freq);
    }

    max_freq != 0 && min_freq != max_freq
}

#[cfg(any(miri, not(target_os = "linux")))]
fn detect_hybrid() -> bool {
    false
}

/// Returns the CPU the calling thread currently runs on, or -1 if unknown.
#[cfg(all(not(miri), any(target_os = "android", target_os = "linux")))]
pub(crate) fn current_cpu() -> i64 {
    // SAFETY: `sched_getcpu()` takes no arguments and only reads kernel state.
    let cpu = unsafe { nix::libc::sched_getcpu() };
    i64::from(cpu)
}

#[cfg(any(miri, not(any(target_os = "android", target_os = "linux"))))]
pub(crate) fn current_cpu() -> i64 {
    -1
}

/// Pins the calling thread to the given CPU, logging a warning on failure.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
pub(crate) fn pin_current_thread(id: usize, cpu: usize) {
    let mut cpu_set = CpuSet::new();
    if let Err(_e) = cpu_set.set(cpu) {
        log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
    } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
    } else {
        log_debug!("Pinned thread #{id} to CPU #{cpu}");
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
pub(crate) fn pin_current_thread(_id: usize, _cpu: usize) {
    log_warn!("Pinning threads to CPUs is not implemented on this platform.");
}
