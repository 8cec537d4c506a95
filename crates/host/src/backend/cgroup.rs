// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! cgroup partition layout for container resource buckets.

use std::fs;
use std::io;
use std::path::Path;

/// Controllers a partition directory is created under.
pub const CONTROLLERS: [&str; 9] = [
    "blkio", "cpu", "cpuacct", "cpuset", "devices", "freezer", "memory", "net_cls",
    "perf_event",
];

const CPUSET_PARAMS: [&str; 2] = ["cpuset.cpus", "cpuset.mems"];

/// Convert a milli-CPU limit to cgroup cpu shares.
///
/// Zero shares is invalid; 2 is the controller minimum.
pub fn milli_cpu_to_shares(milli_cpu: u64) -> u64 {
    const MIN_SHARES: u64 = 2;
    const SHARES_PER_CPU: u64 = 1024;
    const MILLI_PER_CPU: u64 = 1000;

    if milli_cpu == 0 {
        return MIN_SHARES;
    }
    let shares = milli_cpu * SHARES_PER_CPU / MILLI_PER_CPU;
    shares.max(MIN_SHARES)
}

fn read_param(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(data),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}

/// Create the `machine/<name>.partition` subtree under every controller and
/// seed its cpuset parameters.
///
/// An empty `cpuset.cpus`/`cpuset.mems` on the parent makes container
/// creation fail with `ENOSPC`, so the parent is populated from the cgroup
/// root before the partition inherits it.
pub fn create_partition(root: &Path, name: &str, cpu_shares: u64) -> io::Result<()> {
    let dir_name = format!("{}.partition", name);

    for controller in CONTROLLERS {
        fs::create_dir_all(root.join(controller).join("machine").join(&dir_name))?;
    }

    for param in CPUSET_PARAMS {
        let parent = root.join("cpuset/machine").join(param);
        let mut data = read_param(&parent)?;
        if data.trim().is_empty() {
            data = read_param(&root.join("cpuset").join(param))?;
            fs::write(&parent, &data)?;
        }
        fs::write(
            root.join("cpuset/machine").join(&dir_name).join(param),
            &data,
        )?;
    }

    fs::write(
        root.join("cpu/machine").join(&dir_name).join("cpu.shares"),
        cpu_shares.to_string(),
    )?;
    Ok(())
}

#[cfg(test)]
#[path = "cgroup_tests.rs"]
mod tests;
