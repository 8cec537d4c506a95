// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bind mounts into container rootfs trees and mount-namespace hygiene.

use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Mount syscall surface, split out so tests can account for binds without
/// touching the host mount table.
pub trait Mounter: Send + Sync {
    /// Bind `src` onto `dest`, creating `dest` (file or directory, matching
    /// `src`) when missing. Propagation is set to private after the bind.
    fn bind_mount(&self, src: &Path, dest: &Path, writeable: bool) -> io::Result<()>;

    fn unmount(&self, path: &Path) -> io::Result<()>;
}

/// Production mounter using mount(2)/umount(2).
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind_mount(&self, src: &Path, dest: &Path, writeable: bool) -> io::Result<()> {
        use nix::mount::{mount, MsFlags};

        let meta = std::fs::metadata(src)?;
        if !dest.exists() {
            if meta.is_dir() {
                std::fs::create_dir_all(dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::File::create(dest)?;
            }
        }

        let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
        if !writeable {
            flags |= MsFlags::MS_RDONLY;
        }
        mount(Some(src), dest, Some("bind"), flags, None::<&str>)
            .map_err(io::Error::from)?;
        mount(None::<&str>, dest, None::<&str>, MsFlags::MS_PRIVATE, None::<&str>)
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn unmount(&self, path: &Path) -> io::Result<()> {
        nix::mount::umount(path).map_err(io::Error::from)
    }
}

/// Parse the mountpoints out of a `/proc/<pid>/mounts` document.
///
/// Field two of each line, with the four kernel octal escapes decoded.
pub fn parse_mountpoints(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mountpoint)
        .map(PathBuf::from)
        .collect()
}

fn unescape_mountpoint(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escape: String = chars.by_ref().take(3).collect();
        match escape.as_str() {
            "040" => out.push(' '),
            "011" => out.push('\t'),
            "012" => out.push('\n'),
            "134" => out.push('\\'),
            other => {
                out.push('\\');
                out.push_str(other);
            }
        }
    }
    out
}

/// Order mountpoints so children unmount before their parents.
pub fn sort_deepest_first(mountpoints: &mut [PathBuf]) {
    mountpoints.sort_by_key(|b| std::cmp::Reverse(b.components().count()));
}

/// Unmount everything under `roots` inside the mount namespace of `pid`.
///
/// The container supervisor inherits bind mounts from the host namespace
/// when it starts; left alone they pin the image layers forever.
pub async fn cleanup_supervisor_mounts(
    helper: &Path,
    pid: i32,
    roots: &[&Path],
) -> io::Result<()> {
    let contents = tokio::fs::read_to_string(format!("/proc/{}/mounts", pid)).await?;
    let mut targets: Vec<PathBuf> = parse_mountpoints(&contents)
        .into_iter()
        .filter(|mp| roots.iter().any(|root| mp.starts_with(root)))
        .collect();
    if targets.is_empty() {
        return Ok(());
    }
    sort_deepest_first(&mut targets);

    let output = Command::new(helper)
        .arg(pid.to_string())
        .args(targets.iter().map(|p| p.as_os_str()))
        .output()
        .await?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "nsumount {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "mounts_tests.rs"]
mod tests;
