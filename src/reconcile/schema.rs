//! Schema reconciler
//!
//! One pass walks the object through instance resolution, change detection,
//! the subject uniqueness check, registration, compatibility, and finally the
//! creation of the next SchemaVersion in the history chain. Deletion is
//! handled behind the finalizer: the subject is removed from the registry
//! before the object is released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::error::{InstanceError, ReconcileError, RegistryError, StoreError};
use crate::reconcile::{instance_message, resolve_instance, Action, Reconciler, SCHEMA_DEPLOYED};
use crate::registry::{RegisteredSchema, RegistryEndpoint, SchemaRegistryApi, SchemaSubmission};
use crate::resource::{
    LabelSelector, ObjectKey, ObjectMeta, Resource, Schema, SchemaRegistry, SchemaStatus,
    SchemaVersion, SchemaVersionSpec, CONTENT_HASH_LABEL, FINALIZER, INSTANCE_LABEL,
    PREVIOUS_VERSION_ANNOTATION,
};
use crate::store::ResourceStore;

pub struct SchemaReconciler<S> {
    store: Arc<S>,
    registry: Arc<dyn SchemaRegistryApi>,
    config: OperatorConfig,
}

impl<S: ResourceStore> SchemaReconciler<S> {
    pub fn new(store: Arc<S>, registry: Arc<dyn SchemaRegistryApi>, config: OperatorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    #[instrument(skip(self), fields(schema = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(schema) = self.store.get::<Schema>(key).await? else {
            info!("schema resource not found, ignoring since object must be deleted");
            return Ok(Action::Done);
        };

        let instance = resolve_instance(self.store.as_ref(), &schema.metadata).await;

        if schema.metadata.is_deleting() {
            return self.finalize(schema, instance).await;
        }

        let instance = match instance {
            Ok(instance) => instance,
            Err(InstanceError::Store(e)) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "cannot resolve schema registry instance");
                self.write_status(schema, false, instance_message(&e)).await?;
                return Ok(Action::RequeueAfter(self.config.controller.instance_backoff()));
            }
        };

        let resync = schema.sync_interval(self.config.controller.sync_interval());

        if !schema.content_changed() && schema.status.ready {
            debug!("content unchanged, skipping registry");
            let schema = self.ensure_finalizer(schema).await?;
            let message = schema.status.message.clone();
            self.write_status(schema, true, message).await?;
            return Ok(Action::RequeueAfter(resync));
        }

        let subject = schema.effective_subject();

        if schema.is_first_registration() {
            if let Some(owner) = self.subject_claimed_by(&schema, &instance, &subject).await? {
                let message = format!(
                    "Subject {} is already used by Schema {} on instance {}",
                    subject, owner, instance.metadata.name
                );
                warn!(%subject, %owner, "subject collision, not registering");
                self.write_status(schema, false, message).await?;
                return Ok(Action::RequeueAfter(self.config.controller.instance_backoff()));
            }
        }

        // Only a Schema that may own the subject guards its deletion
        let schema = self.ensure_finalizer(schema).await?;

        let endpoint = instance.endpoint(&self.config.registry);
        let registered = match self.deploy(&endpoint, &schema, &subject).await {
            Ok(registered) => registered,
            Err(e) => {
                error!(error = %e, %subject, "failed to deploy schema to schema registry");
                let message = format!(
                    "Failed to deploy schema to Schema Registry: {}",
                    instance.metadata.name
                );
                let mut schema = schema;
                schema.status.registry_error = e.domain_message().unwrap_or_default().to_string();
                self.write_status(schema, false, message).await?;
                return Ok(Action::RequeueAfter(self.config.controller.error_backoff()));
            }
        };

        let compatibility_warning = self.apply_compatibility(&endpoint, &schema, &subject).await;

        let previous = schema.status.latest_version;
        if registered.version != previous {
            if let Err(e) = self
                .create_version(&schema, &instance, &subject, registered, previous)
                .await
            {
                error!(error = %e, version = registered.version, "failed to create SchemaVersion");
                let message = format!(
                    "Failed to create new SchemaVersion with version: {}",
                    registered.version
                );
                self.write_status(schema, false, message).await?;
                return Err(e.into());
            }
        }

        // Without the hash label the next pass takes the full path and
        // retries the compatibility level.
        let mut committed = schema;
        if compatibility_warning.is_none() {
            let checksum = committed.content_checksum();
            committed
                .metadata
                .labels
                .insert(CONTENT_HASH_LABEL.to_string(), checksum.label_value().to_string());
            committed = self.store.update(&committed).await?;
        }

        committed.status.latest_version = registered.version;
        committed.status.registry_error.clear();
        let (message, action) = match compatibility_warning {
            Some(warning) => (
                format!("{}, {}", SCHEMA_DEPLOYED, warning),
                Action::RequeueAfter(self.config.controller.error_backoff()),
            ),
            None => (SCHEMA_DEPLOYED.to_string(), Action::RequeueAfter(resync)),
        };
        self.write_status(committed, true, message).await?;

        info!(%subject, version = registered.version, id = registered.id, "schema registered");
        Ok(action)
    }

    /// Deletion path: remove the subject, then release the finalizer
    async fn finalize(
        &self,
        schema: Schema,
        instance: Result<SchemaRegistry, InstanceError>,
    ) -> Result<Action, ReconcileError> {
        if !schema.metadata.has_finalizer(FINALIZER) {
            return Ok(Action::Done);
        }

        match instance {
            Ok(instance) => {
                let subject = schema.effective_subject();
                let owner = if schema.is_first_registration() && schema.status.latest_version == 0 {
                    self.subject_claimed_by(&schema, &instance, &subject).await?
                } else {
                    None
                };
                match owner {
                    Some(owner) => {
                        info!(%subject, %owner, "schema never registered the subject, leaving it to its owner");
                    }
                    None => {
                        let endpoint = instance.endpoint(&self.config.registry);
                        self.delete_subject(&endpoint, &subject).await?;
                    }
                }
            }
            Err(InstanceError::Store(e)) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "registry instance unresolvable, releasing schema without registry cleanup");
            }
        }

        let mut released = schema;
        released.metadata.remove_finalizer(FINALIZER);
        self.store.update(&released).await?;
        info!("finalizer removed");
        Ok(Action::Done)
    }

    /// Soft then permanent subject removal; an absent subject counts as removed
    async fn delete_subject(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<(), RegistryError> {
        info!(%subject, "deleting subject in schema registry");

        let soft = self.registry.delete_subject(endpoint, subject, false).await;
        match &soft {
            Ok(()) => debug!(%subject, "subject soft deleted"),
            Err(e) if e.is_absent() => debug!(%subject, "subject already absent"),
            Err(e) => warn!(%subject, error = %e, "failed to soft delete subject"),
        }

        match self.registry.delete_subject(endpoint, subject, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_absent() => Ok(()),
            Err(e) => {
                error!(%subject, error = %e, "failed to permanently delete subject");
                match soft {
                    Err(soft) if !soft.is_absent() => Err(soft),
                    _ => Ok(()),
                }
            }
        }
    }

    async fn ensure_finalizer(&self, schema: Schema) -> Result<Schema, StoreError> {
        if schema.metadata.has_finalizer(FINALIZER) {
            return Ok(schema);
        }
        let mut guarded = schema;
        guarded.metadata.add_finalizer(FINALIZER);
        self.store.update(&guarded).await
    }

    /// Name of another Schema already holding the subject on the same instance
    ///
    /// A sibling holds the subject if it has converged before, or if it was
    /// created first.
    async fn subject_claimed_by(
        &self,
        schema: &Schema,
        instance: &SchemaRegistry,
        subject: &str,
    ) -> Result<Option<String>, StoreError> {
        let selector = LabelSelector::everything().with(INSTANCE_LABEL, &instance.metadata.name);
        let siblings = self
            .store
            .list::<Schema>(&schema.metadata.namespace, &selector)
            .await?;

        let claimant = siblings.into_iter().find(|other| {
            other.metadata.name != schema.metadata.name
                && other.effective_subject() == subject
                && (!other.is_first_registration()
                    || other.status.ready
                    || created_before(&other.metadata, &schema.metadata))
        });
        Ok(claimant.map(|other| other.metadata.name))
    }

    async fn deploy(
        &self,
        endpoint: &RegistryEndpoint,
        schema: &Schema,
        subject: &str,
    ) -> Result<RegisteredSchema, RegistryError> {
        let submission = SchemaSubmission {
            content: &schema.spec.content,
            format: schema.spec.format,
            normalize: schema.spec.normalize,
        };
        let id = self.registry.register(endpoint, subject, submission).await?;
        debug!(%subject, id, "schema registered");
        self.registry.fetch_latest(endpoint, subject).await
    }

    /// Best effort; returns a note for the status message when it fails
    async fn apply_compatibility(
        &self,
        endpoint: &RegistryEndpoint,
        schema: &Schema,
        subject: &str,
    ) -> Option<String> {
        let desired = schema.spec.compatibility_level;
        let current = match self.registry.get_compatibility(endpoint, subject).await {
            Ok(current) => current,
            Err(e) => {
                warn!(%subject, error = %e, "failed to read compatibility level");
                return Some(format!("failed to read compatibility level: {}", e));
            }
        };
        if current == Some(desired) {
            return None;
        }

        match self.registry.set_compatibility(endpoint, subject, desired).await {
            Ok(()) => {
                info!(%subject, level = %desired, "compatibility level applied");
                None
            }
            Err(e) => {
                warn!(%subject, level = %desired, error = %e, "failed to apply compatibility level");
                Some(format!("failed to apply compatibility level {}: {}", desired, e))
            }
        }
    }

    /// Append the next record to the version history
    async fn create_version(
        &self,
        schema: &Schema,
        instance: &SchemaRegistry,
        subject: &str,
        registered: RegisteredSchema,
        previous: u32,
    ) -> Result<(), StoreError> {
        let mut metadata = ObjectMeta::new(
            &schema.metadata.namespace,
            SchemaVersion::object_name(subject, registered.version),
        );
        metadata
            .labels
            .insert(INSTANCE_LABEL.to_string(), instance.metadata.name.clone());
        metadata
            .annotations
            .insert(PREVIOUS_VERSION_ANNOTATION.to_string(), previous.to_string());
        metadata.owner_references.push(schema.controller_reference());

        let version = SchemaVersion {
            metadata,
            spec: SchemaVersionSpec {
                subject: subject.to_string(),
                content: schema.spec.content.clone(),
                version: registered.version,
                registry_schema_id: registered.id,
            },
            status: Default::default(),
        };

        // Version records are immutable: create, never update
        match self.store.create(&version).await {
            Ok(created) => {
                info!(schemaversion = %created.key(), previous, "SchemaVersion created");
                Ok(())
            }
            Err(StoreError::AlreadyExists { key, .. }) => {
                debug!(schemaversion = %key, "SchemaVersion already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_status(&self, mut schema: Schema, ready: bool, message: String) -> Result<Schema, StoreError> {
        set_condition(&mut schema.status, ready, message);
        self.store.update_status(&schema).await
    }
}

fn set_condition(status: &mut SchemaStatus, ready: bool, message: String) {
    if status.ready != ready || status.last_transition_time.is_none() {
        status.last_transition_time = Some(Utc::now());
    }
    status.ready = ready;
    status.message = message;
}

fn created_before(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    (a.creation_timestamp, &a.name) < (b.creation_timestamp, &b.name)
}

#[async_trait]
impl<S: ResourceStore> Reconciler for SchemaReconciler<S> {
    type Object = Schema;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        SchemaReconciler::reconcile(self, key).await
    }

    fn error_backoff(&self) -> Duration {
        self.config.controller.error_backoff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let mut status = SchemaStatus::default();
        set_condition(&mut status, false, "pending".to_string());
        let first = status.last_transition_time;
        assert!(first.is_some());

        set_condition(&mut status, false, "still pending".to_string());
        assert_eq!(status.last_transition_time, first);
        assert_eq!(status.message, "still pending");

        set_condition(&mut status, true, SCHEMA_DEPLOYED.to_string());
        assert!(status.ready);
        assert!(status.last_transition_time >= first);
    }

    #[test]
    fn test_created_before_breaks_ties_by_name() {
        let now = Utc::now();
        let mut a = ObjectMeta::new("default", "a");
        let mut b = ObjectMeta::new("default", "b");
        a.creation_timestamp = Some(now);
        b.creation_timestamp = Some(now);
        assert!(created_before(&a, &b));
        assert!(!created_before(&b, &a));

        b.creation_timestamp = Some(now - chrono::Duration::seconds(5));
        assert!(created_before(&b, &a));
    }
}
