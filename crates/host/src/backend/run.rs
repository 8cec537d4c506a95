// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `run` path: from job request to started domain.

use super::container::Container;
use super::{cgroup, ContainerBackend};
use crate::error::BackendError;
use crate::init::{InitConfig, CONFIG_NAME};
use crate::virt::{BridgeInterface, DomainSpec, VirtError};
use gantry_core::job::DEFAULT_PARTITION;
use gantry_core::{Job, PortProto};
use rand::Rng;
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Per-run options supplied by the dispatcher.
#[derive(Debug, Default)]
pub struct RunConfig {
    /// Address to pin, used when restoring jobs that already had one.
    pub ip: Option<Ipv4Addr>,
}

/// Bounded retry against transient control-plane unavailability.
const VIRT_RETRY_TOTAL: Duration = Duration::from_secs(10);
const VIRT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Layer mounts can fail transiently with EINVAL right after a previous
/// checkout of the same layers is torn down.
const CHECKOUT_RETRY_TOTAL: Duration = Duration::from_secs(1);
const CHECKOUT_RETRY_DELAY: Duration = Duration::from_millis(50);

impl ContainerBackend {
    /// Launch a job. Returns once the domain is defined and started; payload
    /// readiness is signalled separately through the registry.
    ///
    /// On any error after IP allocation the address is released and partial
    /// mounts are torn down, and the job is marked failed.
    pub async fn run(self: &Arc<Self>, job: Job, run_config: RunConfig) -> Result<(), BackendError> {
        let mut job = job;

        // A stop that raced the dispatch wins.
        if self.state.get_job(&job.id).map(|j| j.force_stop).unwrap_or(false) {
            tracing::info!(job.id = %job.id, "skipping start of stopped job");
            return Ok(());
        }

        tracing::info!(
            job.id = %job.id,
            artifact.uri = %job.image_artifact.uri,
            cmd = ?job.config.cmd,
            "starting job"
        );

        if job.partition.is_empty() {
            job.partition = DEFAULT_PARTITION.to_string();
        }
        if !self.conf.partitions.contains_key(&job.partition) {
            let err = BackendError::InvalidPartition(job.partition.clone());
            self.state.set_status_failed(&job.id, &err);
            return Err(err);
        }

        if !job.config.host_network {
            self.wait_network_configured().await;
        }
        if !job.config.env.contains_key("DISCOVERD") {
            self.wait_discoverd_configured().await;
        }

        let ip = if job.config.host_network {
            None
        } else {
            let mut network = self.network.lock();
            let net = network.as_mut().ok_or(BackendError::NoIpAvailable {
                subnet: "unconfigured".to_string(),
            })?;
            let ip = net.alloc.request(run_config.ip).map_err(|err| {
                tracing::error!(job.id = %job.id, error = %err, "error requesting ip");
                BackendError::NoIpAvailable { subnet: net.subnet.clone() }
            })?;
            tracing::info!(job.id = %job.id, ip = %ip, subnet = %net.subnet, "obtained ip");
            Some(ip)
        };
        if let Some(ip) = ip {
            self.state.set_container_ip(&job.id, ip);
        }

        match self.run_inner(&job, ip).await {
            Ok(container) => {
                let backend = self.clone();
                let watched = container.clone();
                tokio::spawn(async move {
                    watched.watch(backend, None, HashMap::new()).await;
                });
                tracing::info!(job.id = %job.id, "job started");
                Ok(())
            }
            Err(err) => {
                tracing::error!(job.id = %job.id, error = %err, "error starting job");
                self.state.set_status_failed(&job.id, &err);
                // Partial teardown: unbind whatever was mounted, drop the
                // checkout, give the address back.
                let backend = self.clone();
                let failed = Container::partial(job, ip);
                tokio::spawn(async move { failed.cleanup(&backend).await });
                Err(err)
            }
        }
    }

    async fn run_inner(
        self: &Arc<Self>,
        job: &Job,
        ip: Option<Ipv4Addr>,
    ) -> Result<Arc<Container>, BackendError> {
        let id = &job.id;

        tracing::info!(job.id = %id, "pulling image");
        let artifact_uri = self.resolve_discoverd_uri(&job.image_artifact.uri).await?;
        let image_id = self
            .deps
            .images
            .pull(&artifact_uri)
            .await
            .map_err(|e| BackendError::ImagePull(e.to_string()))?;

        tracing::info!(job.id = %id, image.id = %image_id, "reading image config");
        let image_config = self
            .deps
            .images
            .image_config(&image_id)
            .await
            .map_err(|e| BackendError::ImagePull(e.to_string()))?;

        tracing::info!(job.id = %id, "checking out image");
        let root_path = self.checkout_with_retry(id, &image_id).await?;

        tracing::info!(job.id = %id, root = %root_path.display(), "mounting container directories and files");
        let mounter = &self.deps.mounter;
        let bind = |src: &Path, dest: &Path, writeable: bool| {
            mounter.bind_mount(src, dest, writeable).map_err(|source| BackendError::Mount {
                path: dest.display().to_string(),
                source,
            })
        };

        bind(&self.conf.init_path, &root_path.join(".containerinit"), false)?;
        std::fs::create_dir_all(root_path.join("etc"))?;
        let resolv = self.resolv_conf.lock().clone();
        bind(&resolv, &root_path.join("etc/resolv.conf"), false)?;

        let hostname = job.container_hostname().to_string();
        write_hosts(&root_path.join("etc/hosts"), &hostname)?;

        let shared = root_path.join(".container-shared");
        std::fs::create_dir_all(&shared)?;
        set_mode(&shared, 0o700)?;

        for mount in &job.config.mounts {
            if mount.target.is_empty() {
                return Err(BackendError::EmptyMountTarget);
            }
            let dest = root_path.join(mount.location.trim_start_matches('/'));
            std::fs::create_dir_all(&dest)?;
            bind(Path::new(&mount.target), &dest, mount.writeable)?;
        }

        for volume in &job.config.volumes {
            let Some(location) = self.deps.volumes.lookup(&volume.volume_id) else {
                return Err(BackendError::MissingVolume {
                    job_id: id.clone(),
                    volume_id: volume.volume_id.clone(),
                });
            };
            let dest = root_path.join(volume.target.trim_start_matches('/'));
            std::fs::create_dir_all(&dest)?;
            bind(&location, &dest, volume.writeable)?;
        }

        // Assign ports and derive their env before composing the config.
        let mut ports = job.config.ports.clone();
        let mut port_env = HashMap::new();
        for (i, port) in ports.iter_mut().enumerate() {
            if port.proto == PortProto::Unknown {
                return Err(BackendError::UnknownPortProto(port.proto.to_string()));
            }
            if port.port == 0 {
                port.port = 5000 + i as u16;
            }
            if i == 0 {
                port_env.insert("PORT".to_string(), port.port.to_string());
            }
            port_env.insert(format!("PORT_{}", i), port.port.to_string());
        }
        if let Some(ip) = ip {
            port_env.insert("EXTERNAL_IP".to_string(), ip.to_string());
        }

        let mut config = InitConfig {
            args: compose_args(job, &image_config.entrypoint, &image_config.cmd),
            ports,
            work_dir: if job.config.working_dir.is_empty() {
                image_config.working_dir.clone()
            } else {
                job.config.working_dir.clone()
            },
            uid: (job.config.uid > 0).then_some(job.config.uid),
            tty: job.config.tty,
            open_stdin: job.config.open_stdin,
            file_artifacts: job.file_artifacts.clone(),
            ..InitConfig::default()
        };
        if let Some(ip) = ip {
            let network = self.network.lock();
            if let Some(net) = network.as_ref() {
                config.ip = Some(format!("{}/{}", ip, net.prefix));
                config.gateway = Some(net.bridge_addr.to_string());
            }
        }

        // Env precedence: baseline < host default < job < port/ip < HOSTNAME.
        tracing::info!(job.id = %id, "writing config");
        let mut env = HashMap::new();
        env.insert(
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        );
        env.insert("TERM".to_string(), "xterm".to_string());
        env.insert("HOME".to_string(), "/".to_string());
        env.extend(self.default_env.read().clone());
        env.extend(job.config.env.clone());
        env.extend(port_env);
        env.insert("HOSTNAME".to_string(), hostname);
        config.env = env;

        let config_bytes =
            serde_json::to_vec(&config).map_err(|e| BackendError::ConfigWrite(e.into()))?;
        std::fs::write(root_path.join(CONFIG_NAME), config_bytes)
            .map_err(BackendError::ConfigWrite)?;

        let mut spec = DomainSpec::new(id.clone(), root_path.clone(), "/.containerinit".into());
        spec.partition = format!("/machine/{}", job.partition);
        if let Some(memory) = job.resources.memory {
            spec.memory_bytes = memory;
        }
        if let Some(cpu) = job.resources.cpu {
            spec.cpu_shares = Some(cgroup::milli_cpu_to_shares(cpu));
        }
        if !job.config.host_network {
            spec.interface = Some(BridgeInterface { bridge: self.conf.bridge_name.clone() });
        }

        tracing::info!(job.id = %id, "defining domain");
        let uuid = self
            .with_virt_retries(|| {
                let virt = self.deps.virt.clone();
                let spec = spec.clone();
                async move { virt.define(&spec).await }
            })
            .await
            .map_err(|e| BackendError::DomainDefine(e.to_string()))?;

        tracing::info!(job.id = %id, container.id = %uuid, "creating domain");
        self.with_virt_retries(|| {
            let virt = self.deps.virt.clone();
            let uuid = uuid.clone();
            async move { virt.create(&uuid).await }
        })
        .await
        .map_err(|e| BackendError::DomainCreate(e.to_string()))?;

        self.state.set_container_id(id, &uuid);

        let pid = self.deps.virt.supervisor_pid(&uuid).await.unwrap_or_default();

        Ok(Arc::new(Container::new(job.clone(), root_path, uuid, pid, ip)))
    }

    /// Resolve a `.discoverd` artifact host to a concrete backend address.
    ///
    /// The host itself typically doesn't resolve DNS through discovery, so
    /// the lookup goes through the discovery API and substitutes a randomly
    /// chosen healthy address.
    pub(crate) async fn resolve_discoverd_uri(&self, uri: &str) -> Result<String, BackendError> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            return Ok(uri.to_string());
        };
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, format!("/{}", path)),
            None => (rest, String::new()),
        };
        let Some(service) = host.strip_suffix(".discoverd") else {
            return Ok(uri.to_string());
        };

        self.wait_discoverd_configured().await;
        let addrs = self
            .deps
            .discovery
            .service_addrs(service)
            .await
            .map_err(|e| BackendError::ArtifactResolve(e.to_string()))?;
        if addrs.is_empty() {
            return Err(BackendError::ArtifactResolve(format!(
                "lookup {}: no such host",
                host
            )));
        }
        let addr = &addrs[rand::thread_rng().gen_range(0..addrs.len())];
        Ok(format!("{}://{}{}", scheme, addr, path))
    }

    async fn checkout_with_retry(
        &self,
        job_id: &str,
        image_id: &str,
    ) -> Result<std::path::PathBuf, BackendError> {
        let start = tokio::time::Instant::now();
        loop {
            match self.deps.images.checkout(job_id, image_id).await {
                Ok(path) => return Ok(path),
                Err(err) => {
                    let transient = err.raw_os_error() == Some(22)
                        || err.to_string().ends_with("invalid argument");
                    if !transient || start.elapsed() >= CHECKOUT_RETRY_TOTAL {
                        return Err(BackendError::ImageCheckout(err.to_string()));
                    }
                    tokio::time::sleep(CHECKOUT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Retry a control-plane call while it fails transiently.
    pub(crate) async fn with_virt_retries<T, F, Fut>(&self, mut f: F) -> Result<T, VirtError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, VirtError>>,
    {
        let start = tokio::time::Instant::now();
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && start.elapsed() < VIRT_RETRY_TOTAL => {
                    tokio::time::sleep(VIRT_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Pick argv: the job's entrypoint wins outright; otherwise the image
/// entrypoint followed by the job's cmd (or the image's).
fn compose_args(job: &Job, image_entrypoint: &[String], image_cmd: &[String]) -> Vec<String> {
    let mut args = Vec::new();
    if !job.config.entrypoint.is_empty() {
        args.extend_from_slice(&job.config.entrypoint);
        args.extend_from_slice(&job.config.cmd);
    } else {
        args.extend_from_slice(image_entrypoint);
        if !job.config.cmd.is_empty() {
            args.extend_from_slice(&job.config.cmd);
        } else {
            args.extend_from_slice(image_cmd);
        }
    }
    args
}

/// Append the container's localhost line to its `/etc/hosts`.
fn write_hosts(path: &Path, hostname: &str) -> Result<(), BackendError> {
    let mut file =
        std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    if len > 0 {
        file.write_all(b"\n")?;
    }
    writeln!(file, "127.0.0.1 localhost {}", hostname)?;
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
