// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot host network setup: bridge, forwarding, NAT, container resolver.

use crate::error::NetworkError;
use rand::RngCore;
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::process::Command;

pub mod ipalloc;
pub use ipalloc::{AllocError, IpAllocator};

/// Parse `addr/prefix` CIDR notation.
pub fn parse_cidr(subnet: &str) -> Result<(Ipv4Addr, u8), NetworkError> {
    let invalid = |reason: &str| NetworkError::InvalidSubnet {
        subnet: subnet.to_string(),
        reason: reason.to_string(),
    };
    let (addr, prefix) = subnet.split_once('/').ok_or_else(|| invalid("missing prefix"))?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad address"))?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix"))?;
    if prefix > 30 {
        return Err(invalid("prefix leaves no room for containers"));
    }
    Ok((addr, prefix))
}

/// A stable locally-administered MAC for the bridge. Without an explicit
/// address the kernel lowers the bridge MAC to the smallest enslaved
/// interface's, resetting connections on every container start.
pub fn bridge_mac() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "fe:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// Build the resolver file bound into containers: the host's search domains
/// plus the bridge address as the only nameserver.
pub fn render_resolv_conf(host_resolv: &str, nameserver: Ipv4Addr) -> String {
    let search: Vec<&str> = host_resolv
        .lines()
        .filter_map(|line| line.trim().strip_prefix("search "))
        .flat_map(|domains| domains.split_whitespace())
        .collect();

    let mut out = String::new();
    if !search.is_empty() {
        out.push_str("search ");
        out.push_str(&search.join(" "));
        out.push('\n');
    }
    out.push_str(&format!("nameserver {}\n", nameserver));
    out
}

async fn run(cmd: &mut Command) -> Result<(), std::io::Error> {
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "{:?} failed: {}",
            cmd.as_std().get_program(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Create the bridge if missing, pin its MAC, assign the address and bring
/// the link up. Existing foreign addresses on the bridge are removed.
pub async fn setup_bridge(
    name: &str,
    addr: Ipv4Addr,
    prefix: u8,
    mtu: u32,
) -> Result<(), NetworkError> {
    let exists = Command::new("ip")
        .args(["link", "show", name])
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);

    if !exists {
        run(Command::new("ip").args(["link", "add", name, "type", "bridge"]))
            .await
            .map_err(|e| NetworkError::BridgeSetup(e.to_string()))?;
        run(Command::new("ip").args(["link", "set", name, "address", &bridge_mac()]))
            .await
            .map_err(|e| NetworkError::BridgeSetup(e.to_string()))?;
    }

    run(Command::new("ip").args(["addr", "flush", "dev", name]))
        .await
        .map_err(|e| NetworkError::BridgeSetup(e.to_string()))?;
    run(Command::new("ip").args([
        "addr",
        "add",
        &format!("{}/{}", addr, prefix),
        "dev",
        name,
    ]))
    .await
    .map_err(|e| NetworkError::BridgeSetup(e.to_string()))?;
    run(Command::new("ip").args(["link", "set", name, "mtu", &mtu.to_string(), "up"]))
        .await
        .map_err(|e| NetworkError::BridgeSetup(e.to_string()))?;
    Ok(())
}

/// Enable IPv4 forwarding via the proc interface.
pub async fn enable_ip_forward(proc_path: &Path) -> Result<(), NetworkError> {
    tokio::fs::write(proc_path, b"1\n").await?;
    Ok(())
}

/// Install the outbound MASQUERADE rule for the container subnet, unless an
/// identical rule is already present.
pub async fn enable_outbound_nat(bridge: &str, subnet: &str) -> Result<(), NetworkError> {
    let rule = [
        "POSTROUTING",
        "-t",
        "nat",
        "-s",
        subnet,
        "!",
        "-o",
        bridge,
        "-j",
        "MASQUERADE",
    ];

    let present = Command::new("iptables")
        .arg("-C")
        .args(rule)
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);
    if present {
        return Ok(());
    }

    run(Command::new("iptables").arg("-A").args(rule))
        .await
        .map_err(|e| NetworkError::NatSetup(e.to_string()))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
