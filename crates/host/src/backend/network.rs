// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot bridge network configuration for the backend.

use super::{ContainerBackend, NetworkState};
use crate::conf::NetworkConfig;
use crate::error::NetworkError;
use crate::net::{self, IpAllocator};
use std::path::Path;

const IP_FORWARD_PROC: &str = "/proc/sys/net/ipv4/ip_forward";
const CONTAINER_RESOLV_DIR: &str = "/etc/gantry";

impl ContainerBackend {
    /// Configure the container bridge network. Called exactly once at host
    /// start; until it completes, any `run` without host networking blocks.
    ///
    /// Side effects: the bridge exists with the configured address and a
    /// pinned MAC, forwarding is on, outbound NAT is installed, and the
    /// container resolver file points at the bridge.
    pub async fn configure_networking(&self, config: &NetworkConfig) -> Result<(), NetworkError> {
        let (bridge_addr, prefix) = net::parse_cidr(&config.subnet)?;

        let mut alloc = IpAllocator::new(bridge_addr, prefix);
        // The bridge address must never be handed to a container.
        let _ = alloc.request(Some(bridge_addr));

        net::setup_bridge(&self.conf.bridge_name, bridge_addr, prefix, config.mtu).await?;

        if let Err(err) = self.deps.virt.ensure_network(&self.conf.bridge_name).await {
            return Err(NetworkError::BridgeSetup(err.to_string()));
        }
        // The stock default network runs a resolver bound to every
        // interface, which blocks service discovery from binding its own.
        if let Err(err) = self.deps.virt.destroy_network("default").await {
            tracing::debug!(error = %err, "no default network to destroy");
        }

        net::enable_ip_forward(Path::new(IP_FORWARD_PROC)).await?;
        net::enable_outbound_nat(&self.conf.bridge_name, &config.subnet).await?;

        // Write a resolv.conf to be bound into containers, pointing at the
        // discovery DNS listener on the bridge address.
        let host_resolv =
            tokio::fs::read_to_string(&*self.resolv_conf.lock()).await.unwrap_or_default();
        tokio::fs::create_dir_all(CONTAINER_RESOLV_DIR).await?;
        let container_resolv = Path::new(CONTAINER_RESOLV_DIR).join("resolv.conf");
        tokio::fs::write(&container_resolv, net::render_resolv_conf(&host_resolv, bridge_addr))
            .await?;
        *self.resolv_conf.lock() = container_resolv;

        // Re-pin addresses for jobs that survived a host restart.
        {
            let containers = self.containers.read();
            for container in containers.values() {
                if container.job.config.host_network {
                    continue;
                }
                if let Some(ip) = container.ip {
                    if let Err(err) = alloc.request(Some(ip)) {
                        tracing::error!(job.id = %container.job.id, ip = %ip, error = %err, "error re-requesting ip");
                    }
                }
            }
        }

        *self.network.lock() = Some(NetworkState {
            bridge_addr,
            prefix,
            subnet: config.subnet.clone(),
            alloc,
        });
        self.mark_network_configured();
        Ok(())
    }

    /// Install the bridge network state without touching the host, for tests.
    #[cfg(test)]
    pub(crate) fn configure_test_network(&self, subnet: &str) {
        let (bridge_addr, prefix) = net::parse_cidr(subnet).expect("valid test subnet");
        let mut alloc = IpAllocator::new(bridge_addr, prefix);
        let _ = alloc.request(Some(bridge_addr));
        *self.network.lock() = Some(NetworkState {
            bridge_addr,
            prefix,
            subnet: subnet.to_string(),
            alloc,
        });
        self.mark_network_configured();
    }
}
