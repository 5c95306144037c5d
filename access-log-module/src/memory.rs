// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Memory counters of the current process

/// Resident memory of the current process in bytes, if the platform exposes it.
#[cfg(target_os = "linux")]
pub(crate) fn current() -> Option<u64> {
    use nix::unistd::{sysconf, SysconfVar};

    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = u64::try_from(sysconf(SysconfVar::PAGE_SIZE).ok()??).ok()?;
    pages.checked_mul(page_size)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn current() -> Option<u64> {
    None
}

/// Peak resident memory of the current process in bytes.
#[cfg(unix)]
pub(crate) fn peak() -> Option<u64> {
    use nix::sys::resource::{getrusage, UsageWho};

    let max_rss = u64::try_from(getrusage(UsageWho::RUSAGE_SELF).ok()?.max_rss()).ok()?;

    // macOS reports bytes, everybody else kilobytes
    if cfg!(target_os = "macos") {
        Some(max_rss)
    } else {
        max_rss.checked_mul(1024)
    }
}

#[cfg(not(unix))]
pub(crate) fn peak() -> Option<u64> {
    None
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn counters_on_linux() {
        let current = current().unwrap();
        let peak = peak().unwrap();
        assert!(current > 0);
        assert!(peak > 0);
    }
}
