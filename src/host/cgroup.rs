// src/host/cgroup.rs

//! cgroup v2 limits under `<cgroup_root>/account-<id>`.
//!
//! Writes go straight to the control files; cgroupfs does not support the
//! temp-and-rename sequence used for descriptors.

use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::model::{Limits, UNLIMITED};
use crate::store::Layout;

/// cpu.max period in microseconds
pub const CPU_PERIOD_US: i64 = 100_000;

/// `cpu.max` content for a cpu percentage
pub fn cpu_max(cpu_percent: i64) -> String {
    if cpu_percent == UNLIMITED {
        format!("max {}", CPU_PERIOD_US)
    } else {
        format!("{} {}", cpu_percent.max(1).saturating_mul(1000), CPU_PERIOD_US)
    }
}

/// `memory.max` content for a RAM limit in MB
pub fn memory_max(ram_mb: i64) -> String {
    if ram_mb == UNLIMITED {
        "max".to_string()
    } else {
        (ram_mb.max(0) as u64).saturating_mul(1024 * 1024).to_string()
    }
}

/// Whether a cgroup v2 hierarchy is usable at the configured root
pub fn available(layout: &Layout) -> bool {
    let root = layout.cgroup_root();
    if root.is_dir() {
        return true;
    }
    root.parent()
        .map(|parent| parent.join("cgroup.controllers").is_file())
        .unwrap_or(false)
}

/// Writes cpu.max and memory.max for a tenant.
/// Returns `false` without touching anything when cgroup v2 is unavailable.
pub fn apply_limits(layout: &Layout, tenant_id: u32, limits: &Limits) -> Result<bool> {
    if !available(layout) {
        debug!(tenant_id, "cgroup v2 not available, skipping limits");
        return Ok(false);
    }

    let root = layout.cgroup_root();
    let fresh_root = !root.exists();
    fs::create_dir_all(root).map_err(|e| CoreError::io(root, e))?;
    if fresh_root {
        // Let children of our subtree use the cpu and memory controllers
        enable_controllers(root.parent());
        enable_controllers(Some(root));
    }

    let dir = layout.cgroup_dir(tenant_id);
    fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;

    write_control(&dir.join("cpu.max"), &cpu_max(limits.cpu_percent))?;
    write_control(&dir.join("memory.max"), &memory_max(limits.ram_mb))?;

    info!(tenant_id, "Applied cgroup limits in {}", dir.display());
    Ok(true)
}

fn enable_controllers(dir: Option<&Path>) {
    let Some(dir) = dir else { return };
    let control = dir.join("cgroup.subtree_control");
    if control.exists() {
        if let Err(e) = fs::write(&control, "+cpu +memory") {
            debug!("Could not enable controllers in {}: {}", dir.display(), e);
        }
    }
}

fn write_control(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| CoreError::io(path, e))
}

/// Removes a tenant's cgroup; a missing group is not an error
pub fn remove(layout: &Layout, tenant_id: u32) -> Result<()> {
    let dir = layout.cgroup_dir(tenant_id);
    // Real cgroup directories only accept rmdir; plain directories need the recursive form
    let result = fs::remove_dir(&dir).or_else(|e| match e.kind() {
        io::ErrorKind::NotFound => Ok(()),
        _ => fs::remove_dir_all(&dir),
    });
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::io(&dir, e)),
    }
}
