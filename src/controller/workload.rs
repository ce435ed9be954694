//! Sync state machine for the service catalog API server.
//!
//! Every pass re-reads `ServiceCatalogAPIServer/cluster` and branches on its
//! management state. The managed branch applies the operand, evaluates its
//! health and writes status once, only if it changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceSpec, ServiceReference,
};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::client::{KubeOperatorClient, OperatorClient};
use super::probe::{check_for_apis, ApiProbe, KubeApiProbe};
use super::removal::{KubeRemovalClient, RemovalClient, RemovalSequencer};
use crate::apply::{HashedObjectRef, KubeApplier, ResourceApplier};
use crate::assets::{self, CONFIG_MAP_ASSET, DAEMON_SET_ASSET, REDEPLOY_TRIGGERS, STATIC_ASSETS};
use crate::config::OperatorSettings;
use crate::crd::{
    expected_generation, is_condition_true, set_generation, set_operator_condition,
    GenerationStatus, LogLevel, ManagementState, OperatorCondition, ServiceCatalogAPIServer,
    CONDITION_AVAILABLE,
};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::metrics::{MetricsReporter, NoopMetricsReporter};
use crate::status::{
    degraded_condition, needs_requeue, number_available, operand_image, progressing_condition,
    removed_conditions, unmanaged_conditions, AvailabilityReport,
};
use crate::worker::Syncer;
use crate::{
    Error, GroupVersion, Result, COMPONENT_NAME, DAEMON_SET_NAME, FIELD_MANAGER,
    MANAGED_GROUP_VERSIONS, SERVICE_NAME, TARGET_NAMESPACE,
};

/// Annotation carrying the operand image so a pull-spec change is always a diff
pub const PULL_SPEC_ANNOTATION: &str = "svcatapiservers.operator.openshift.io/pull-spec";

/// Annotation asking the service CA operator to fill in `caBundle`
pub const INJECT_CA_BUNDLE_ANNOTATION: &str = "service.alpha.openshift.io/inject-cabundle";

/// Result of a successful sync pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The operand is settled; clear the key's backoff
    Converged,
    /// Something is still moving; drive the key again after backoff
    RequeueRequested,
}

/// Collaborators of the sync pass
pub struct Context {
    /// Control resource accessor
    pub operator: Arc<dyn OperatorClient>,
    /// Manifest applier
    pub applier: Arc<dyn ResourceApplier>,
    /// Discovery probe
    pub probe: Arc<dyn ApiProbe>,
    /// Cluster operations used during removal
    pub removal: Arc<dyn RemovalClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Metrics sink
    pub metrics: Arc<dyn MetricsReporter>,
    /// Runtime settings
    pub settings: OperatorSettings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context from explicit collaborators
    #[cfg(test)]
    pub fn for_testing(
        operator: Arc<dyn OperatorClient>,
        applier: Arc<dyn ResourceApplier>,
        probe: Arc<dyn ApiProbe>,
        removal: Arc<dyn RemovalClient>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsReporter>,
    ) -> Self {
        Self {
            operator,
            applier,
            probe,
            removal,
            events,
            metrics,
            settings: OperatorSettings::default(),
        }
    }
}

/// Builder for [`Context`]; unset collaborators default to Kubernetes-backed ones
pub struct ContextBuilder {
    client: Client,
    operator: Option<Arc<dyn OperatorClient>>,
    applier: Option<Arc<dyn ResourceApplier>>,
    probe: Option<Arc<dyn ApiProbe>>,
    removal: Option<Arc<dyn RemovalClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Arc<dyn MetricsReporter>>,
    settings: OperatorSettings,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            operator: None,
            applier: None,
            probe: None,
            removal: None,
            events: None,
            metrics: None,
            settings: OperatorSettings::default(),
        }
    }

    /// Set runtime settings
    pub fn settings(mut self, settings: OperatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the control resource accessor
    pub fn operator_client(mut self, operator: Arc<dyn OperatorClient>) -> Self {
        self.operator = Some(operator);
        self
    }

    /// Override the applier
    pub fn applier(mut self, applier: Arc<dyn ResourceApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Override the API discovery check
    pub fn probe(mut self, probe: Arc<dyn ApiProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Override the removal client
    pub fn removal(mut self, removal: Arc<dyn RemovalClient>) -> Self {
        self.removal = Some(removal);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the metrics reporter
    pub fn metrics(mut self, metrics: Arc<dyn MetricsReporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            operator: self
                .operator
                .unwrap_or_else(|| Arc::new(KubeOperatorClient::new(self.client.clone()))),
            applier: self
                .applier
                .unwrap_or_else(|| Arc::new(KubeApplier::new(self.client.clone()))),
            probe: self
                .probe
                .unwrap_or_else(|| Arc::new(KubeApiProbe::new(self.client.clone()))),
            removal: self
                .removal
                .unwrap_or_else(|| Arc::new(KubeRemovalClient::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), FIELD_MANAGER))
            }),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(NoopMetricsReporter)),
            settings: self.settings,
        }
    }
}

#[async_trait]
impl Syncer for Context {
    async fn sync(&self) -> Result<SyncOutcome> {
        sync(self).await
    }
}

/// Run one pass of the state machine
#[instrument(skip(ctx))]
pub async fn sync(ctx: &Context) -> Result<SyncOutcome> {
    let config = ctx.operator.get().await?;

    match &config.spec.management_state {
        ManagementState::Managed => {
            ctx.metrics.record_enabled();
            sync_managed(ctx, config).await
        }
        ManagementState::Unmanaged => {
            write_fixed_conditions(ctx, &config, unmanaged_conditions()).await?;
            Ok(SyncOutcome::Converged)
        }
        ManagementState::Removed => sync_removed(ctx, config).await,
        other => {
            warn!(state = %other, "Unrecognized management state");
            ctx.events
                .publish(
                    &config.object_ref(&()),
                    EventType::Warning,
                    reasons::MANAGEMENT_STATE_UNKNOWN,
                    actions::SYNC,
                    Some(format!(
                        "Unrecognized operator management state \"{}\"",
                        other.as_str()
                    )),
                )
                .await;
            Ok(SyncOutcome::Converged)
        }
    }
}

async fn sync_removed(ctx: &Context, config: ServiceCatalogAPIServer) -> Result<SyncOutcome> {
    let sequencer = RemovalSequencer::new(
        Arc::clone(&ctx.removal),
        TARGET_NAMESPACE,
        MANAGED_GROUP_VERSIONS,
    )
    .with_polling(
        ctx.settings.removal_poll_interval,
        ctx.settings.removal_timeout,
    );

    if let Err(e) = sequencer.run().await {
        ctx.events
            .publish(
                &config.object_ref(&()),
                EventType::Warning,
                reasons::REMOVAL_FAILED,
                actions::REMOVE,
                Some(e.to_string()),
            )
            .await;
        return Err(e);
    }

    info!("Service catalog apiserver removed");
    write_fixed_conditions(ctx, &config, removed_conditions()).await?;
    ctx.metrics.record_disabled();
    Ok(SyncOutcome::Converged)
}

/// Set `conditions` and write status if anything changed
async fn write_fixed_conditions(
    ctx: &Context,
    config: &ServiceCatalogAPIServer,
    conditions: [OperatorCondition; 3],
) -> Result<()> {
    let previous = config.status_or_default();
    let mut status = previous.clone();
    for condition in conditions {
        set_operator_condition(&mut status.conditions, condition);
    }

    if status != previous {
        let mut updated = config.clone();
        updated.status = Some(status);
        ctx.operator.update_status(&updated).await?;
    }
    Ok(())
}

/// Converge the operand and report its health.
///
/// Step failures are collected rather than returned early so one pass
/// surfaces all of them through the Degraded condition.
async fn sync_managed(ctx: &Context, config: ServiceCatalogAPIServer) -> Result<SyncOutcome> {
    let previous = config.status_or_default();
    let mut status = previous.clone();
    let generation = config.generation();
    let mut errors: Vec<String> = Vec::new();

    let mut force_rollout = false;
    for result in ctx.applier.apply_directly(STATIC_ASSETS).await {
        if let Some(e) = &result.error {
            errors.push(format!("{:?} ({}): {}", result.file, result.kind, e));
            continue;
        }
        if result.changed && REDEPLOY_TRIGGERS.contains(&result.file.as_str()) {
            force_rollout = true;
        }
    }

    let config_map_changed = match manage_config_map(ctx).await {
        Ok(changed) => changed,
        Err(e) => {
            errors.push(format!("\"configmap\": {e}"));
            false
        }
    };

    // compared against the status read at the start of the pass, which the
    // previous pass stamped; a spec change therefore forces exactly one rollout
    let generation_changed = generation != previous.observed_generation;
    force_rollout = force_rollout || config_map_changed || generation_changed;
    debug!(
        force_rollout,
        generation_changed, config_map_changed, "Computed rollout decision"
    );

    let daemon_set = match manage_daemon_set(ctx, &config, &previous.generations, force_rollout)
        .await
    {
        Ok(ds) => Some(ds),
        Err(e) => {
            errors.push(format!("\"daemonsets\": {e}"));
            None
        }
    };

    // only register APIServices once a pod can serve them
    let mut api_services = Vec::new();
    if daemon_set.as_ref().is_some_and(|ds| number_available(ds) > 0) {
        match manage_api_services(ctx).await {
            Ok(applied) => api_services = applied,
            Err(e) => errors.push(format!("\"apiservices\": {e}")),
        }
    }

    let mut availability = AvailabilityReport::from_workload(daemon_set.as_ref(), &api_services);
    if !availability.is_failing() {
        let missing = check_for_apis(ctx.probe.as_ref(), MANAGED_GROUP_VERSIONS).await;
        availability.add_discovery_failures(missing);
    }
    set_operator_condition(&mut status.conditions, availability.into_condition());

    set_operator_condition(
        &mut status.conditions,
        progressing_condition(daemon_set.as_ref(), generation, previous.observed_generation),
    );

    status.observed_generation = generation;
    if let Some(ds) = &daemon_set {
        set_generation(&mut status.generations, daemon_set_generation(ds));
    }

    set_operator_condition(&mut status.conditions, degraded_condition(&errors));

    if is_condition_true(&status.conditions, CONDITION_AVAILABLE) {
        if let Some(image) = daemon_set.as_ref().and_then(operand_image) {
            ctx.metrics.record_version(COMPONENT_NAME, image);
        }
    }

    if status != previous {
        let mut updated = config.clone();
        updated.status = Some(status.clone());
        ctx.operator.update_status(&updated).await?;
        debug!(generation, "Status updated");
    }

    if !errors.is_empty() {
        ctx.events
            .publish(
                &config.object_ref(&()),
                EventType::Warning,
                reasons::SYNC_FAILED,
                actions::SYNC,
                Some(errors.join("\n")),
            )
            .await;
        return Err(Error::Sync(errors));
    }

    if needs_requeue(&status.conditions) {
        Ok(SyncOutcome::RequeueRequested)
    } else {
        Ok(SyncOutcome::Converged)
    }
}

/// Objects whose content is hashed into the operand config map
fn config_inputs() -> Vec<HashedObjectRef> {
    vec![
        HashedObjectRef::config_map(TARGET_NAMESPACE, "aggregator-client-ca"),
        HashedObjectRef::config_map(TARGET_NAMESPACE, "client-ca"),
        HashedObjectRef::secret(TARGET_NAMESPACE, "etcd-client"),
        HashedObjectRef::config_map(TARGET_NAMESPACE, "etcd-serving-ca"),
        HashedObjectRef::secret(TARGET_NAMESPACE, "serving-cert"),
    ]
}

async fn manage_config_map(ctx: &Context) -> Result<bool> {
    let mut required = assets::read_config_map(CONFIG_MAP_ASSET)?;
    let hashes = ctx.applier.hash_object_refs(&config_inputs()).await?;
    required
        .data
        .get_or_insert_with(BTreeMap::new)
        .extend(hashes);

    let (_, changed) = ctx.applier.apply_config_map(required).await?;
    Ok(changed)
}

/// Bundled DaemonSet with image, pull-spec annotation and verbosity filled in
fn required_daemon_set(image: &str, log_level: LogLevel) -> Result<DaemonSet> {
    let mut required = assets::read_daemon_set(DAEMON_SET_ASSET)?;

    let container = required
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod| pod.containers.first_mut())
        .ok_or_else(|| Error::apply("daemonset template has no containers"))?;
    if !image.is_empty() {
        container.image = Some(image.to_string());
    }
    container
        .args
        .get_or_insert_with(Vec::new)
        .push(format!("-v={}", log_level.verbosity()));

    required
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(PULL_SPEC_ANNOTATION.to_string(), image.to_string());

    Ok(required)
}

async fn manage_daemon_set(
    ctx: &Context,
    config: &ServiceCatalogAPIServer,
    generations: &[GenerationStatus],
    force_rollout: bool,
) -> Result<DaemonSet> {
    let required = required_daemon_set(ctx.settings.image_pull_spec(), config.spec.log_level)?;
    let expected = expected_generation(
        generations,
        "apps",
        "daemonsets",
        TARGET_NAMESPACE,
        DAEMON_SET_NAME,
    );
    let (actual, changed) = ctx
        .applier
        .apply_daemon_set(required, expected, force_rollout)
        .await?;
    if changed {
        info!(force_rollout, expected_generation = expected, "Applied operand daemonset");
    }
    Ok(actual)
}

fn daemon_set_generation(ds: &DaemonSet) -> GenerationStatus {
    GenerationStatus {
        group: "apps".to_string(),
        resource: "daemonsets".to_string(),
        namespace: ds.namespace().unwrap_or_default(),
        name: ds.name_any(),
        last_generation: ds.metadata.generation.unwrap_or(0),
    }
}

/// APIService registration for one served group/version
fn required_api_service(gv: &GroupVersion) -> APIService {
    APIService {
        metadata: ObjectMeta {
            name: Some(gv.api_service_name()),
            annotations: Some(BTreeMap::from([(
                INJECT_CA_BUNDLE_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(APIServiceSpec {
            group: Some(gv.group.to_string()),
            version: Some(gv.version.to_string()),
            service: Some(ServiceReference {
                namespace: Some(TARGET_NAMESPACE.to_string()),
                name: Some(SERVICE_NAME.to_string()),
                port: None,
            }),
            group_priority_minimum: 9900,
            version_priority: 15,
            ..Default::default()
        }),
        status: None,
    }
}

async fn manage_api_services(ctx: &Context) -> Result<Vec<APIService>> {
    let mut applied = Vec::with_capacity(MANAGED_GROUP_VERSIONS.len());
    for gv in MANAGED_GROUP_VERSIONS {
        let (api_service, _) = ctx.applier.apply_api_service(required_api_service(gv)).await?;
        applied.push(api_service);
    }
    Ok(applied)
}
