//! The UUID-addressed instance registry.
//!
//! The registry owns every [`KvmInstance`] in the process and is the only
//! thing allowed to mutate the set.  HTTP handlers resolve their target
//! instance through [`KvmRegistry::get_by_uuid`] and never hold module
//! globals.  Mutation happens on administrative paths only (add, remove,
//! start, stop), so a `tokio::sync::RwLock` around the list is plenty.
//!
//! UUID uniqueness is enforced here: two dongles reporting the same UUID
//! (cloned aux MCU firmware does exist in the wild) would make
//! UUID-addressed routing ambiguous, so the second claimant is reassigned
//! a generated v4 with a warning.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::VideoBackend;
use crate::error::DeviceError;
use crate::instance::{InstanceOptions, InstanceSummary, KvmInstance};

struct RegistryInner {
    instances: Vec<Arc<KvmInstance>>,
    occupied_uuids: HashSet<String>,
}

/// Ordered collection of instances plus the occupied-UUID set.
pub struct KvmRegistry {
    backend: Arc<dyn VideoBackend>,
    inner: RwLock<RegistryInner>,
}

impl KvmRegistry {
    pub fn new(backend: Arc<dyn VideoBackend>) -> Self {
        Self {
            backend,
            inner: RwLock::new(RegistryInner {
                instances: Vec::new(),
                occupied_uuids: HashSet::new(),
            }),
        }
    }

    /// Validates `options` and appends a cold instance.
    pub async fn add(&self, options: InstanceOptions) -> Result<(), DeviceError> {
        let instance = Arc::new(KvmInstance::new(options, Arc::clone(&self.backend))?);
        self.inner.write().await.instances.push(instance);
        Ok(())
    }

    /// Number of registered instances.
    pub async fn len(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.instances.is_empty()
    }

    /// The first instance, for single-dongle deployments.
    pub async fn first(&self) -> Option<Arc<KvmInstance>> {
        self.inner.read().await.instances.first().cloned()
    }

    /// Starts every instance in order, claiming UUIDs as they resolve.
    ///
    /// Fails on the first instance that refuses to start, leaving the
    /// already-started ones running (the caller decides whether to tear
    /// down or limp along).
    pub async fn start_all(&self) -> Result<(), DeviceError> {
        let instances: Vec<Arc<KvmInstance>> =
            self.inner.read().await.instances.iter().cloned().collect();

        for instance in instances {
            instance.start().await?;
            self.claim_uuid(&instance).await;
        }
        Ok(())
    }

    /// Registers the instance's UUID, resolving duplicates with a fresh
    /// v4.
    async fn claim_uuid(&self, instance: &Arc<KvmInstance>) {
        let mut inner = self.inner.write().await;
        let mut uuid = instance.uuid();
        if inner.occupied_uuids.contains(&uuid) {
            let replacement = Uuid::new_v4().to_string();
            warn!(
                duplicate = %uuid,
                replacement = %replacement,
                "duplicate instance UUID; assigning a generated one"
            );
            instance.set_uuid(replacement.clone());
            uuid = replacement;
        }
        inner.occupied_uuids.insert(uuid.clone());
        info!(%uuid, "instance registered");
    }

    /// Stops every instance in reverse start order.
    pub async fn stop_all(&self) {
        let instances: Vec<Arc<KvmInstance>> =
            self.inner.read().await.instances.iter().cloned().collect();
        for instance in instances.iter().rev() {
            if instance.is_started() {
                instance.stop().await;
            }
        }
    }

    /// Stops one instance by UUID; it stays registered.
    pub async fn stop(&self, uuid: &str) -> Result<(), DeviceError> {
        let instance = self.get_by_uuid(uuid).await?;
        instance.stop().await;
        Ok(())
    }

    /// Stops and removes one instance by UUID.
    pub async fn remove(&self, uuid: &str) -> Result<(), DeviceError> {
        let instance = self.get_by_uuid(uuid).await?;
        instance.stop().await;

        let mut inner = self.inner.write().await;
        inner.instances.retain(|i| i.uuid() != uuid);
        inner.occupied_uuids.remove(uuid);
        Ok(())
    }

    /// Resolves an instance by UUID.
    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Arc<KvmInstance>, DeviceError> {
        self.inner
            .read()
            .await
            .instances
            .iter()
            .find(|instance| instance.uuid() == uuid)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(uuid.to_string()))
    }

    /// Serializable snapshot of every instance.
    pub async fn list(&self) -> Vec<InstanceSummary> {
        self.inner
            .read()
            .await
            .instances
            .iter()
            .map(|instance| instance.summary())
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::mock::MockVideoBackend;

    fn registry() -> KvmRegistry {
        KvmRegistry::new(Arc::new(MockVideoBackend::capture_card()))
    }

    fn options(tag: u32) -> InstanceOptions {
        InstanceOptions {
            usb_kvm_device_path: format!("/dev/ttyUSB{tag}"),
            video_capture_device_path: format!("/dev/video{tag}"),
            audio_capture_device_path: format!("/dev/snd/pcmC{tag}D0c"),
            ..InstanceOptions::default()
        }
    }

    #[tokio::test]
    async fn test_add_validates_options() {
        let registry = registry();
        let mut bad = options(0);
        bad.video_capture_device_path.clear();
        assert!(registry.add(bad).await.is_err());
        assert!(registry.is_empty().await);

        registry.add(options(0)).await.unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_by_unknown_uuid_is_not_found() {
        let registry = registry();
        registry.add(options(0)).await.unwrap();
        let err = registry.get_by_uuid("no-such-uuid").await.unwrap_err();
        match err {
            DeviceError::NotFound(uuid) => assert_eq!(uuid, "no-such-uuid"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_by_uuid_finds_assigned_instance() {
        let registry = registry();
        registry.add(options(0)).await.unwrap();
        let instance = registry.first().await.unwrap();
        instance.set_uuid("abc-123".into());

        let found = registry.get_by_uuid("abc-123").await.unwrap();
        assert!(Arc::ptr_eq(&instance, &found));
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_reassigned() {
        let registry = registry();
        registry.add(options(0)).await.unwrap();
        registry.add(options(1)).await.unwrap();

        let inner = registry.inner.read().await;
        let first = inner.instances[0].clone();
        let second = inner.instances[1].clone();
        drop(inner);

        first.set_uuid("same-uuid".into());
        registry.claim_uuid(&first).await;

        second.set_uuid("same-uuid".into());
        registry.claim_uuid(&second).await;

        assert_eq!(first.uuid(), "same-uuid");
        assert_ne!(second.uuid(), "same-uuid", "duplicate must be replaced");
        assert_eq!(second.uuid().len(), 36, "replacement is a v4 UUID string");
    }

    #[tokio::test]
    async fn test_remove_drops_instance_and_uuid() {
        let registry = registry();
        registry.add(options(0)).await.unwrap();
        let instance = registry.first().await.unwrap();
        instance.set_uuid("gone-soon".into());
        registry.claim_uuid(&instance).await;

        registry.remove("gone-soon").await.unwrap();
        assert!(registry.is_empty().await);
        assert!(registry.get_by_uuid("gone-soon").await.is_err());
    }

    #[tokio::test]
    async fn test_list_reports_summaries() {
        let registry = registry();
        registry.add(options(0)).await.unwrap();
        registry.add(options(1)).await.unwrap();

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].usb_kvm_device, "/dev/ttyUSB0");
        assert_eq!(listed[1].video_capture_dev, "/dev/video1");
        assert!(listed[0].usb_mass_storage_side.is_none());
    }
}
