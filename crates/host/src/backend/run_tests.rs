// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the run path: validation, layout, config composition.

use crate::backend::test_helpers::{bare_harness, harness, Harness, TEST_SUBNET};
use crate::error::BackendError;
use crate::init::{InitConfig, CONFIG_NAME};
use gantry_core::{JobStatus, Mount, Port, PortProto, VolumeBinding};
use std::collections::HashMap;

fn read_init_config(h: &Harness, job_id: &str) -> InitConfig {
    let path = h.images.checkout_path(job_id).join(CONFIG_NAME);
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn rejects_unknown_partition() {
    let h = harness();
    let mut job = h.job("host0-part");
    job.partition = "nonexistent".to_string();
    h.state.add_job(&job);

    let err = h.backend.run(job, Default::default()).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidPartition(p) if p == "nonexistent"));
    assert_eq!(h.state.get_job("host0-part").unwrap().status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn empty_partition_defaults_to_user() {
    let h = harness();
    let job = h.job("host0-defpart");
    assert!(job.partition.is_empty());
    h.run_job(job).await;

    let uuid = h.virt.uuid_for("host0-defpart").unwrap();
    let spec = h.virt.domains.lock().get(&uuid).unwrap().spec.clone();
    assert_eq!(spec.partition, "/machine/user");
}

#[tokio::test(start_paused = true)]
async fn force_stopped_job_is_skipped() {
    let h = harness();
    let job = h.job("host0-stopped");
    h.state.add_job(&job);
    h.state.set_force_stop(&job.id);

    h.backend.run(job, Default::default()).await.unwrap();
    assert!(h.virt.uuid_for("host0-stopped").is_none());
    assert_eq!(h.allocated_ips(), 0);
}

#[tokio::test(start_paused = true)]
async fn ip_is_allocated_and_recorded() {
    let h = harness();
    h.run_job(h.job("host0-ip")).await;

    assert_eq!(h.allocated_ips(), 1);
    let active = h.state.get_job("host0-ip").unwrap();
    assert!(active.internal_ip.is_some());
}

#[tokio::test(start_paused = true)]
async fn host_network_job_takes_no_ip() {
    let h = harness();
    let mut job = h.job("host0-hostnet");
    job.config.host_network = true;
    h.run_job(job).await;

    assert_eq!(h.allocated_ips(), 0);
    assert!(h.state.get_job("host0-hostnet").unwrap().internal_ip.is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_volume_fails_and_releases_ip() {
    let h = harness();
    let mut job = h.job("host0-vol");
    job.config.volumes =
        vec![VolumeBinding { volume_id: "vol-missing".to_string(), target: "/data".to_string(), writeable: true }];
    h.state.add_job(&job);

    let err = h.backend.run(job, Default::default()).await.unwrap_err();
    assert!(matches!(err, BackendError::MissingVolume { .. }));
    assert_eq!(h.state.get_job("host0-vol").unwrap().status, JobStatus::Failed);

    // The deferred cleanup releases the address and unbinds partial mounts.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.allocated_ips(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_mount_target_is_rejected() {
    let h = harness();
    let mut job = h.job("host0-badmount");
    job.config.mounts = vec![Mount {
        target: String::new(),
        location: "/data".to_string(),
        writeable: false,
    }];
    h.state.add_job(&job);

    let err = h.backend.run(job, Default::default()).await.unwrap_err();
    assert!(matches!(err, BackendError::EmptyMountTarget));
}

#[tokio::test(start_paused = true)]
async fn unknown_port_proto_is_rejected() {
    let h = harness();
    let mut job = h.job("host0-badproto");
    job.config.ports = vec![Port { proto: PortProto::Unknown, port: 80 }];
    h.state.add_job(&job);

    let err = h.backend.run(job, Default::default()).await.unwrap_err();
    assert!(matches!(err, BackendError::UnknownPortProto(_)));
}

#[tokio::test(start_paused = true)]
async fn zero_ports_default_from_5000() {
    let h = harness();
    let mut job = h.job("host0-ports");
    job.config.ports = vec![
        Port { proto: PortProto::Tcp, port: 0 },
        Port { proto: PortProto::Udp, port: 0 },
    ];
    h.run_job(job).await;

    let config = read_init_config(&h, "host0-ports");
    assert_eq!(config.env.get("PORT").map(String::as_str), Some("5000"));
    assert_eq!(config.env.get("PORT_0").map(String::as_str), Some("5000"));
    assert_eq!(config.env.get("PORT_1").map(String::as_str), Some("5001"));
    assert_eq!(
        config.ports,
        vec![
            Port { proto: PortProto::Tcp, port: 5000 },
            Port { proto: PortProto::Udp, port: 5001 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn env_merges_in_precedence_order() {
    let h = harness();
    h.backend.set_default_env("SHARED", "from-host");
    h.backend.set_default_env("HOST_ONLY", "host");

    let mut env = HashMap::new();
    env.insert("SHARED".to_string(), "from-job".to_string());
    let mut job = h.job("host0-env");
    job.config.env = env;
    h.run_job(job).await;

    let config = read_init_config(&h, "host0-env");
    // Baseline survives.
    assert_eq!(
        config.env.get("PATH").map(String::as_str),
        Some("/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
    );
    assert_eq!(config.env.get("TERM").map(String::as_str), Some("xterm"));
    // Job env beats host default env.
    assert_eq!(config.env.get("SHARED").map(String::as_str), Some("from-job"));
    assert_eq!(config.env.get("HOST_ONLY").map(String::as_str), Some("host"));
    // Hostname is derived from the job ID and always wins.
    assert_eq!(config.env.get("HOSTNAME").map(String::as_str), Some("env"));
    // Bridge-network jobs export their address.
    assert!(config.env.contains_key("EXTERNAL_IP"));
    assert!(config.ip.as_deref().unwrap().ends_with("/24"));
    assert_eq!(config.gateway.as_deref(), Some("100.100.0.1"));
}

#[tokio::test(start_paused = true)]
async fn job_entrypoint_overrides_image() {
    let h = harness();
    let mut job = h.job("host0-args");
    job.config.entrypoint = vec!["/custom".to_string()];
    job.config.cmd = vec!["--flag".to_string()];
    h.run_job(job).await;

    let config = read_init_config(&h, "host0-args");
    assert_eq!(config.args, vec!["/custom".to_string(), "--flag".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn image_entrypoint_is_used_without_job_override() {
    let h = harness();
    {
        let mut config = h.images.config.lock();
        config.entrypoint = vec!["/bin/payload".to_string()];
        config.cmd = vec!["serve".to_string()];
    }
    h.run_job(h.job("host0-imgargs")).await;

    let config = read_init_config(&h, "host0-imgargs");
    assert_eq!(config.args, vec!["/bin/payload".to_string(), "serve".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn hosts_file_names_the_container() {
    let h = harness();
    h.run_job(h.job("host0-hostsfile")).await;

    let hosts =
        std::fs::read_to_string(h.images.checkout_path("host0-hostsfile").join("etc/hosts"))
            .unwrap();
    assert_eq!(hosts, "127.0.0.1 localhost hostsfile\n");
}

#[tokio::test(start_paused = true)]
async fn init_and_resolv_are_bound_readonly() {
    let h = harness();
    h.run_job(h.job("host0-binds")).await;

    let root = h.images.checkout_path("host0-binds");
    let bound = h.mounter.bound.lock().clone();
    assert!(bound
        .iter()
        .any(|(_, dest, writeable)| dest == &root.join(".containerinit") && !writeable));
    assert!(bound
        .iter()
        .any(|(_, dest, writeable)| dest == &root.join("etc/resolv.conf") && !writeable));
}

#[tokio::test(start_paused = true)]
async fn requested_mounts_and_volumes_are_bound() {
    let h = harness();
    h.volumes.add("vol-1", "/srv/volumes/vol-1");
    let mut job = h.job("host0-mounts");
    job.config.mounts = vec![Mount {
        target: "/opt/src".to_string(),
        location: "/app".to_string(),
        writeable: false,
    }];
    job.config.volumes = vec![VolumeBinding {
        volume_id: "vol-1".to_string(),
        target: "/data".to_string(),
        writeable: true,
    }];
    h.run_job(job).await;

    let root = h.images.checkout_path("host0-mounts");
    let bound = h.mounter.bound.lock().clone();
    assert!(bound.iter().any(|(src, dest, writeable)| {
        src == std::path::Path::new("/opt/src") && dest == &root.join("app") && !writeable
    }));
    assert!(bound.iter().any(|(src, dest, writeable)| {
        src == std::path::Path::new("/srv/volumes/vol-1")
            && dest == &root.join("data")
            && *writeable
    }));
}

#[tokio::test(start_paused = true)]
async fn resources_shape_the_domain() {
    let h = harness();
    let mut job = h.job("host0-res");
    job.resources.memory = Some(512 * 1024 * 1024);
    job.resources.cpu = Some(500);
    h.run_job(job).await;

    let uuid = h.virt.uuid_for("host0-res").unwrap();
    let spec = h.virt.domains.lock().get(&uuid).unwrap().spec.clone();
    assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
    assert_eq!(spec.cpu_shares, Some(512));
    assert_eq!(spec.on_poweroff, crate::virt::ExitAction::Preserve);
    assert_eq!(spec.on_crash, crate::virt::ExitAction::Preserve);
    assert_eq!(spec.interface.as_ref().unwrap().bridge, "gantrybr0");
}

#[tokio::test(start_paused = true)]
async fn checkout_retries_through_transient_einval() {
    let h = harness();
    h.images.checkout_einval_remaining.store(3, std::sync::atomic::Ordering::SeqCst);
    h.run_job(h.job("host0-retry")).await;
    assert!(h.virt.uuid_for("host0-retry").is_some());
}

#[tokio::test(start_paused = true)]
async fn checkout_gives_up_after_a_second() {
    let h = harness();
    h.images.checkout_einval_remaining.store(1000, std::sync::atomic::Ordering::SeqCst);
    let job = h.job("host0-retrydead");
    h.state.add_job(&job);

    let err = h.backend.run(job, Default::default()).await.unwrap_err();
    assert!(matches!(err, BackendError::ImageCheckout(_)));
}

#[tokio::test(start_paused = true)]
async fn domain_define_retries_transient_unavailability() {
    let h = harness();
    h.virt.transient_failures.store(2, std::sync::atomic::Ordering::SeqCst);
    h.run_job(h.job("host0-virtretry")).await;
    assert!(h.virt.uuid_for("host0-virtretry").is_some());
}

#[tokio::test(start_paused = true)]
async fn discoverd_artifact_host_is_resolved() {
    let h = harness();
    h.discovery.register("blobstore", vec!["10.5.5.5:8080".to_string()]);
    let mut job = h.job("host0-disc");
    job.image_artifact = gantry_core::Artifact::new("http://blobstore.discoverd/images/app?id=1");
    h.run_job(job).await;

    let pulled = h.images.pulled.lock().clone();
    assert_eq!(pulled, vec!["http://10.5.5.5:8080/images/app?id=1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unresolvable_discoverd_host_fails_artifact_resolve() {
    let h = harness();
    let mut job = h.job("host0-nodisc");
    job.image_artifact = gantry_core::Artifact::new("http://missing.discoverd/app");
    h.state.add_job(&job);

    let err = h.backend.run(job, Default::default()).await.unwrap_err();
    assert!(matches!(err, BackendError::ArtifactResolve(_)));
}

#[tokio::test(start_paused = true)]
async fn run_blocks_until_network_and_discovery_are_configured() {
    let h = bare_harness();
    let job = h.job("host0-blocked");
    h.state.add_job(&job);
    h.init.register("host0-blocked");

    let backend = h.backend.clone();
    let pending = tokio::spawn(async move { backend.run(job, Default::default()).await });

    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    assert!(!pending.is_finished(), "run proceeded before the network barrier opened");

    h.backend.configure_test_network(TEST_SUBNET);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(!pending.is_finished(), "run proceeded before discovery was configured");

    h.backend.set_default_env("DISCOVERD", "http://100.100.0.1:1111");
    pending.await.unwrap().unwrap();
    assert!(h.virt.uuid_for("host0-blocked").is_some());
}

#[tokio::test(start_paused = true)]
async fn host_network_job_with_discoverd_env_skips_both_barriers() {
    let h = bare_harness();
    let mut job = h.job("host0-nobarrier");
    job.config.host_network = true;
    job.config.env.insert("DISCOVERD".to_string(), "http://10.0.0.1:1111".to_string());
    h.init.register("host0-nobarrier");
    h.state.add_job(&job);

    h.backend.run(job, Default::default()).await.unwrap();
    assert!(h.virt.uuid_for("host0-nobarrier").is_some());
}
