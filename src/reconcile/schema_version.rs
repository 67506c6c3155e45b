//! SchemaVersion reconciler
//!
//! New versions are activated and their predecessor deactivated. Once a
//! version has left the store, its registry entry is soft then permanently
//! deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::error::{InstanceError, ReconcileError};
use crate::reconcile::{instance_message, resolve_instance, Action, Reconciler};
use crate::registry::SchemaRegistryApi;
use crate::resource::{ObjectKey, SchemaVersion};
use crate::store::ResourceStore;

pub struct SchemaVersionReconciler<S> {
    store: Arc<S>,
    registry: Arc<dyn SchemaRegistryApi>,
    config: OperatorConfig,
}

impl<S: ResourceStore> SchemaVersionReconciler<S> {
    pub fn new(store: Arc<S>, registry: Arc<dyn SchemaRegistryApi>, config: OperatorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    #[instrument(skip(self), fields(schemaversion = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(version) = self.store.get::<SchemaVersion>(key).await? else {
            debug!("schema version not found, deletion is handled from the tombstone");
            return Ok(Action::Done);
        };
        if version.metadata.is_deleting() {
            return Ok(Action::Done);
        }

        let version = if version.status.ready {
            version
        } else {
            let mut activated = version;
            activated.status.ready = true;
            activated.status.active = true;
            let activated = self.store.update_status(&activated).await?;
            info!(subject = %activated.spec.subject, version = activated.spec.version, "schema version activated");
            activated
        };

        if !version.status.active {
            return Ok(Action::Done);
        }

        if version.previous_version().is_none() {
            let e = ReconcileError::InvalidSchemaVersionModification(version.metadata.key());
            error!(error = %e, "cannot deactivate predecessor");
            let mut flagged = version;
            flagged.status.message = e.to_string();
            self.store.update_status(&flagged).await?;
            return Ok(Action::Done);
        }

        if let Some(previous) = version.previous_object_name() {
            let sibling_key = ObjectKey::new(&version.metadata.namespace, previous);
            self.deactivate(&sibling_key).await?;
        }
        Ok(Action::Done)
    }

    async fn deactivate(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let Some(sibling) = self.store.get::<SchemaVersion>(key).await? else {
            debug!(previous = %key, "previous schema version no longer exists");
            return Ok(());
        };
        if sibling.status.ready && !sibling.status.active {
            return Ok(());
        }

        let mut deactivated = sibling;
        deactivated.status.active = false;
        deactivated.status.ready = true;
        self.store.update_status(&deactivated).await?;
        info!(previous = %key, "previous schema version deactivated");
        Ok(())
    }

    /// Remove the registry entry of a version that left the store
    #[instrument(skip(self, tombstone), fields(schemaversion = %tombstone.metadata.key()))]
    pub async fn cleanup(&self, tombstone: &SchemaVersion) -> Result<Action, ReconcileError> {
        let instance = match resolve_instance(self.store.as_ref(), &tombstone.metadata).await {
            Ok(instance) => instance,
            Err(InstanceError::Store(e)) => return Err(e.into()),
            Err(e) => {
                warn!(reason = %instance_message(&e), "cannot resolve instance, leaving registry entry in place");
                return Ok(Action::Done);
            }
        };

        let endpoint = instance.endpoint(&self.config.registry);
        let subject = &tombstone.spec.subject;
        let version = tombstone.spec.version;

        match self.registry.delete_version(&endpoint, subject, version, false).await {
            Ok(()) => debug!(%subject, version, "schema version soft deleted"),
            Err(e) if e.is_absent() => debug!(%subject, version, error = %e, "schema version already soft deleted"),
            Err(e) => warn!(%subject, version, error = %e, "soft delete failed, trying permanent delete"),
        }

        match self.registry.delete_version(&endpoint, subject, version, true).await {
            Ok(()) => {
                info!(%subject, version, instance = %instance.metadata.name, "schema version deleted from registry");
                Ok(Action::Done)
            }
            Err(e) if e.is_absent() => {
                debug!(%subject, version, "schema version already absent from registry");
                Ok(Action::Done)
            }
            Err(e) => {
                error!(%subject, version, error = %e, "failed to permanently delete schema version");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<S: ResourceStore> Reconciler for SchemaVersionReconciler<S> {
    type Object = SchemaVersion;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        SchemaVersionReconciler::reconcile(self, key).await
    }

    async fn cleanup(&self, tombstone: &SchemaVersion) -> Result<Action, ReconcileError> {
        SchemaVersionReconciler::cleanup(self, tombstone).await
    }

    fn error_backoff(&self) -> Duration {
        self.config.controller.error_backoff()
    }
}

