// src/host/quota.rs

use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::host::{run_checked, HostOps};
use crate::model::{Limits, UNLIMITED};

/// Block and inode limits handed to setquota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSpec {
    /// Soft block limit in KB
    pub block_soft: u64,
    pub block_hard: u64,
    pub inode_soft: u64,
    pub inode_hard: u64,
}

impl QuotaSpec {
    /// Soft limits from the plan, hard limits 10% above. `0` means no limit.
    pub fn from_limits(limits: &Limits) -> Self {
        let block_soft = if limits.disk_mb == UNLIMITED {
            0
        } else {
            (limits.disk_mb.max(0) as u64).saturating_mul(1024)
        };
        let inode_soft = if limits.inodes == UNLIMITED {
            0
        } else {
            limits.inodes.max(0) as u64
        };
        Self {
            block_soft,
            block_hard: with_headroom(block_soft),
            inode_soft,
            inode_hard: with_headroom(inode_soft),
        }
    }
}

/// 10% above `soft`, saturating
fn with_headroom(soft: u64) -> u64 {
    soft.saturating_add(soft / 10)
}

/// Runs `setquota -u <uid> <soft> <hard> <isoft> <ihard> <mount>`.
/// Callers treat every failure as a warning.
pub async fn apply_quota(host: &dyn HostOps, uid: u32, limits: &Limits, mount: &Path) -> Result<()> {
    let spec = QuotaSpec::from_limits(limits);
    let uid = uid.to_string();
    let values = [
        spec.block_soft.to_string(),
        spec.block_hard.to_string(),
        spec.inode_soft.to_string(),
        spec.inode_hard.to_string(),
    ];
    let mount = mount.to_string_lossy().into_owned();

    run_checked(
        host,
        "setquota",
        &["-u", &uid, &values[0], &values[1], &values[2], &values[3], &mount],
        &[],
    )
    .await?;
    info!("Set disk quota for uid {}: {:?}", uid, spec);
    Ok(())
}
