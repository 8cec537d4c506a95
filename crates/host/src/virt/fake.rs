// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scriptable fake control plane.

use super::{DomainSpec, DomainState, VirtControlPlane, VirtError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct FakeDomain {
    pub spec: DomainSpec,
    pub state: DomainState,
}

#[derive(Default)]
pub struct FakeVirt {
    pub domains: Mutex<HashMap<String, FakeDomain>>,
    /// Remaining define/create calls that fail as transiently unavailable.
    pub transient_failures: AtomicUsize,
    pub fail_create: AtomicBool,
    pub destroyed_networks: Mutex<Vec<String>>,
    pub ensured_networks: Mutex<Vec<String>>,
}

impl FakeVirt {
    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// UUID of the domain defined under this name.
    pub fn uuid_for(&self, name: &str) -> Option<String> {
        self.domains
            .lock()
            .iter()
            .find(|(_, d)| d.spec.name == name)
            .map(|(uuid, _)| uuid.clone())
    }

    pub fn set_state(&self, uuid: &str, state: DomainState) {
        if let Some(domain) = self.domains.lock().get_mut(uuid) {
            domain.state = state;
        }
    }

    pub fn state_of(&self, uuid: &str) -> Option<DomainState> {
        self.domains.lock().get(uuid).map(|d| d.state)
    }
}

#[async_trait]
impl VirtControlPlane for FakeVirt {
    async fn define(&self, spec: &DomainSpec) -> Result<String, VirtError> {
        if self.take_transient_failure() {
            return Err(VirtError::Unavailable("control plane restarting".to_string()));
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        self.domains.lock().insert(
            uuid.clone(),
            FakeDomain { spec: spec.clone(), state: DomainState::NoState },
        );
        Ok(uuid)
    }

    async fn create(&self, uuid: &str) -> Result<(), VirtError> {
        if self.take_transient_failure() {
            return Err(VirtError::Unavailable("control plane restarting".to_string()));
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(VirtError::Other("cgroup exhausted".to_string()));
        }
        let mut domains = self.domains.lock();
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| VirtError::UnknownDomain(uuid.to_string()))?;
        domain.state = DomainState::Running;
        Ok(())
    }

    async fn destroy(&self, uuid: &str) -> Result<(), VirtError> {
        let mut domains = self.domains.lock();
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| VirtError::UnknownDomain(uuid.to_string()))?;
        domain.state = DomainState::Shutoff;
        Ok(())
    }

    async fn state(&self, uuid: &str) -> Result<DomainState, VirtError> {
        self.domains
            .lock()
            .get(uuid)
            .map(|d| d.state)
            .ok_or_else(|| VirtError::UnknownDomain(uuid.to_string()))
    }

    async fn supervisor_pid(&self, uuid: &str) -> Result<Option<i32>, VirtError> {
        if self.domains.lock().contains_key(uuid) {
            Ok(None)
        } else {
            Err(VirtError::UnknownDomain(uuid.to_string()))
        }
    }

    async fn ensure_network(&self, bridge: &str) -> Result<(), VirtError> {
        self.ensured_networks.lock().push(bridge.to_string());
        Ok(())
    }

    async fn destroy_network(&self, name: &str) -> Result<(), VirtError> {
        self.destroyed_networks.lock().push(name.to_string());
        Ok(())
    }
}
