//! Status aggregation.
//!
//! Everything here is a pure function from observed facts to conditions, so
//! the sync pass can build the new status, compare it with the one it read,
//! and write only when they differ.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::ResourceExt;

use crate::crd::{
    is_condition_false, is_condition_true, ConditionStatus, OperatorCondition, CONDITION_AVAILABLE,
    CONDITION_DEGRADED, CONDITION_PROGRESSING,
};
use crate::{DAEMON_SET_NAME, TARGET_NAMESPACE};

/// Condition reasons written by the operator
pub mod reasons {
    /// Operand DaemonSet could not be read
    pub const NO_DAEMON: &str = "NoDaemon";
    /// No operand pod is available on any node
    pub const NO_API_SERVER_POD: &str = "NoAPIServerPod";
    /// No APIService is registered
    pub const NO_REGISTERED_API_SERVICES: &str = "NoRegisteredAPIServices";
    /// A registered APIService reports Available=False
    pub const API_SERVICE_NOT_AVAILABLE: &str = "APIServiceNotAvailable";
    /// Discovery for a managed group/version did not return 200
    pub const DISCOVERY_NOT_READY: &str = "DiscoveryNotReady";
    /// More than one availability problem
    pub const MULTIPLE: &str = "Multiple";
    /// Generations have not caught up yet
    pub const DESIRED_STATE_NOT_YET_ACHIEVED: &str = "DesiredStateNotYetAchieved";
    /// At least one sync step failed
    pub const SYNC_ERROR: &str = "SyncError";
    /// Management state is Unmanaged
    pub const UNMANAGED: &str = "Unmanaged";
    /// Management state is Removed and teardown finished
    pub const REMOVED: &str = "Removed";
}

/// Availability problems found while evaluating the operand
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvailabilityReport {
    reason: String,
    messages: Vec<String>,
}

impl AvailabilityReport {
    /// Evaluate the DaemonSet and the registered APIServices.
    ///
    /// `api_services` only holds what was applied this pass; it is empty when
    /// registration was skipped because no pod was available.
    pub fn from_workload(daemon_set: Option<&DaemonSet>, api_services: &[APIService]) -> Self {
        let mut report = Self::default();

        match daemon_set {
            None => report.push(
                reasons::NO_DAEMON,
                format!("daemonset/{DAEMON_SET_NAME}.{TARGET_NAMESPACE}: could not be retrieved"),
            ),
            Some(ds) if number_available(ds) == 0 => report.push(
                reasons::NO_API_SERVER_POD,
                format!("no {TARGET_NAMESPACE} daemon pods available on any node."),
            ),
            Some(_) if api_services.is_empty() => report.push(
                reasons::NO_REGISTERED_API_SERVICES,
                "registered apiservices could not be retrieved",
            ),
            Some(_) => {}
        }

        for api_service in api_services {
            let available = api_service
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|conds| conds.iter().find(|c| c.type_ == "Available"));
            if let Some(cond) = available.filter(|c| c.status == "False") {
                report.push(
                    reasons::API_SERVICE_NOT_AVAILABLE,
                    format!(
                        "apiservice/{}: not available: {}",
                        api_service.name_any(),
                        cond.message.as_deref().unwrap_or_default()
                    ),
                );
            }
        }

        report
    }

    /// True when any problem was recorded
    pub fn is_failing(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Record discovery probe failures
    pub fn add_discovery_failures(&mut self, messages: Vec<String>) {
        for message in messages {
            self.push(reasons::DISCOVERY_NOT_READY, message);
        }
    }

    fn push(&mut self, reason: &str, message: impl Into<String>) {
        self.reason = reason.to_string();
        self.messages.push(message.into());
    }

    /// Fold into the Available condition
    pub fn into_condition(self) -> OperatorCondition {
        match self.messages.len() {
            0 => OperatorCondition::new(CONDITION_AVAILABLE, ConditionStatus::True, "", ""),
            1 => OperatorCondition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                self.reason,
                self.messages.concat(),
            ),
            _ => OperatorCondition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                reasons::MULTIPLE,
                self.messages.join("\n"),
            ),
        }
    }
}

/// Progressing condition from DaemonSet and control resource generations.
///
/// `observed_generation` is the status value read at the start of the pass.
pub fn progressing_condition(
    daemon_set: Option<&DaemonSet>,
    generation: i64,
    observed_generation: i64,
) -> OperatorCondition {
    let mut messages = Vec::new();

    if let Some(ds) = daemon_set {
        let desired = ds.metadata.generation.unwrap_or(0);
        let observed = ds
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0);
        if desired != observed {
            messages.push(format!(
                "daemonset/{DAEMON_SET_NAME}.{TARGET_NAMESPACE}: observed generation is {observed}, desired generation is {desired}."
            ));
        }
    }

    if generation != observed_generation {
        messages.push(format!(
            "servicecatalogapiservers/cluster: observed generation is {observed_generation}, desired generation is {generation}."
        ));
    }

    if messages.is_empty() {
        OperatorCondition::new(CONDITION_PROGRESSING, ConditionStatus::False, "", "")
    } else {
        OperatorCondition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            reasons::DESIRED_STATE_NOT_YET_ACHIEVED,
            messages.join("\n"),
        )
    }
}

/// Degraded condition from the errors collected during a pass
pub fn degraded_condition(errors: &[String]) -> OperatorCondition {
    if errors.is_empty() {
        OperatorCondition::new(CONDITION_DEGRADED, ConditionStatus::False, "", "")
    } else {
        OperatorCondition::new(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            reasons::SYNC_ERROR,
            errors.join("\n"),
        )
    }
}

/// Conditions reported while the operand is unmanaged
pub fn unmanaged_conditions() -> [OperatorCondition; 3] {
    [
        OperatorCondition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::Unknown,
            reasons::UNMANAGED,
            "the apiserver is in an unmanaged state, therefore its availability is unknown.",
        ),
        OperatorCondition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            reasons::UNMANAGED,
            "the apiserver is in an unmanaged state, therefore no changes are being applied.",
        ),
        OperatorCondition::new(
            CONDITION_DEGRADED,
            ConditionStatus::False,
            reasons::UNMANAGED,
            "the apiserver is in an unmanaged state, therefore no operator actions are degraded.",
        ),
    ]
}

/// Conditions reported once teardown has completed
pub fn removed_conditions() -> [OperatorCondition; 3] {
    [
        OperatorCondition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            reasons::REMOVED,
            "the apiserver is in the desired state (Removed).",
        ),
        OperatorCondition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            reasons::REMOVED,
            "",
        ),
        OperatorCondition::new(CONDITION_DEGRADED, ConditionStatus::False, reasons::REMOVED, ""),
    ]
}

/// Whether a managed pass must be driven again.
///
/// Anything short of Available=True, Progressing=False, Degraded=False
/// keeps the key cycling. Passes that recorded errors never get here.
pub fn needs_requeue(conditions: &[OperatorCondition]) -> bool {
    !is_condition_false(conditions, CONDITION_DEGRADED)
        || !is_condition_false(conditions, CONDITION_PROGRESSING)
        || !is_condition_true(conditions, CONDITION_AVAILABLE)
}

/// Image of the first container of the DaemonSet's pod template
pub fn operand_image(daemon_set: &DaemonSet) -> Option<&str> {
    daemon_set
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

/// `status.numberAvailable`, 0 when unset
pub fn number_available(daemon_set: &DaemonSet) -> i32 {
    daemon_set
        .status
        .as_ref()
        .and_then(|s| s.number_available)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
    use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
        APIService, APIServiceCondition, APIServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::assets;

    /// Bundled DaemonSet with the given generation/rollout counters
    pub fn daemon_set(generation: i64, observed: i64, available: i32) -> DaemonSet {
        let mut ds = assets::read_daemon_set(assets::DAEMON_SET_ASSET).unwrap();
        ds.metadata.generation = Some(generation);
        ds.status = Some(DaemonSetStatus {
            observed_generation: Some(observed),
            number_available: Some(available),
            ..Default::default()
        });
        ds
    }

    /// APIService with an Available condition of the given status
    pub fn api_service(name: &str, available: &str, message: &str) -> APIService {
        APIService {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(APIServiceStatus {
                conditions: Some(vec![APIServiceCondition {
                    type_: "Available".to_string(),
                    status: available.to_string(),
                    message: Some(message.to_string()),
                    ..Default::default()
                }]),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{api_service, daemon_set};
    use super::*;

    mod availability {
        use super::*;

        #[test]
        fn test_missing_daemon_set() {
            let cond = AvailabilityReport::from_workload(None, &[]).into_condition();
            assert_eq!(cond.status, ConditionStatus::False);
            assert_eq!(cond.reason, reasons::NO_DAEMON);
            assert_eq!(
                cond.message,
                "daemonset/apiserver.openshift-service-catalog-apiserver: could not be retrieved"
            );
        }

        #[test]
        fn test_no_available_pods() {
            let ds = daemon_set(1, 1, 0);
            let cond = AvailabilityReport::from_workload(Some(&ds), &[]).into_condition();
            assert_eq!(cond.reason, reasons::NO_API_SERVER_POD);
        }

        #[test]
        fn test_pods_without_registered_api_services() {
            let ds = daemon_set(1, 1, 3);
            let report = AvailabilityReport::from_workload(Some(&ds), &[]);
            assert!(report.is_failing());
            assert_eq!(report.into_condition().reason, reasons::NO_REGISTERED_API_SERVICES);
        }

        #[test]
        fn test_unavailable_api_service_reports_its_message() {
            let ds = daemon_set(1, 1, 3);
            let services = [api_service(
                "v1beta1.servicecatalog.k8s.io",
                "False",
                "FailedDiscoveryCheck",
            )];
            let cond = AvailabilityReport::from_workload(Some(&ds), &services).into_condition();

            assert_eq!(cond.reason, reasons::API_SERVICE_NOT_AVAILABLE);
            assert_eq!(
                cond.message,
                "apiservice/v1beta1.servicecatalog.k8s.io: not available: FailedDiscoveryCheck"
            );
        }

        /// Story: several problems at once collapse into "Multiple"
        #[test]
        fn story_multiple_problems_are_newline_joined() {
            let ds = daemon_set(1, 1, 3);
            let services = [
                api_service("v1beta1.a.io", "False", "down"),
                api_service("v1.b.io", "False", "also down"),
            ];
            let cond = AvailabilityReport::from_workload(Some(&ds), &services).into_condition();

            assert_eq!(cond.reason, reasons::MULTIPLE);
            assert_eq!(
                cond.message,
                "apiservice/v1beta1.a.io: not available: down\napiservice/v1.b.io: not available: also down"
            );
        }

        #[test]
        fn test_healthy_workload_is_available() {
            let ds = daemon_set(2, 2, 3);
            let services = [api_service("v1beta1.servicecatalog.k8s.io", "True", "")];
            let report = AvailabilityReport::from_workload(Some(&ds), &services);
            assert!(!report.is_failing());

            let cond = report.into_condition();
            assert_eq!(cond.status, ConditionStatus::True);
            assert!(cond.reason.is_empty());
        }

        #[test]
        fn test_discovery_failure_alone() {
            let mut report = AvailabilityReport::default();
            report.add_discovery_failures(vec![
                "v1beta1.servicecatalog.k8s.io is not ready: 503".to_string(),
            ]);
            let cond = report.into_condition();
            assert_eq!(cond.status, ConditionStatus::False);
            assert_eq!(cond.reason, reasons::DISCOVERY_NOT_READY);
            assert_eq!(cond.message, "v1beta1.servicecatalog.k8s.io is not ready: 503");
        }
    }

    mod progressing {
        use super::*;

        #[test]
        fn test_settled_generations_are_not_progressing() {
            let ds = daemon_set(4, 4, 1);
            let cond = progressing_condition(Some(&ds), 2, 2);
            assert_eq!(cond.status, ConditionStatus::False);
        }

        #[test]
        fn test_both_lags_are_reported() {
            let ds = daemon_set(5, 4, 1);
            let cond = progressing_condition(Some(&ds), 3, 2);

            assert_eq!(cond.status, ConditionStatus::True);
            assert_eq!(cond.reason, reasons::DESIRED_STATE_NOT_YET_ACHIEVED);
            let lines: Vec<&str> = cond.message.lines().collect();
            assert_eq!(lines.len(), 2);
            assert!(lines[0].contains("observed generation is 4, desired generation is 5."));
            assert!(lines[1].contains("observed generation is 2, desired generation is 3."));
        }

        #[test]
        fn test_missing_daemon_set_only_checks_control_resource() {
            let cond = progressing_condition(None, 1, 1);
            assert_eq!(cond.status, ConditionStatus::False);
        }
    }

    #[test]
    fn test_degraded_joins_errors() {
        assert_eq!(degraded_condition(&[]).status, ConditionStatus::False);

        let cond = degraded_condition(&["a".to_string(), "b".to_string()]);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, reasons::SYNC_ERROR);
        assert_eq!(cond.message, "a\nb");
    }

    mod requeue {
        use super::*;

        fn settled() -> Vec<OperatorCondition> {
            vec![
                OperatorCondition::new(CONDITION_AVAILABLE, ConditionStatus::True, "", ""),
                OperatorCondition::new(CONDITION_PROGRESSING, ConditionStatus::False, "", ""),
                OperatorCondition::new(CONDITION_DEGRADED, ConditionStatus::False, "", ""),
            ]
        }

        #[test]
        fn test_settled_status_does_not_requeue() {
            assert!(!needs_requeue(&settled()));
        }

        #[test]
        fn test_degraded_with_errors_requeues() {
            let mut conditions = settled();
            conditions[2] = degraded_condition(&["\"sa.yaml\": forbidden".to_string()]);
            assert!(needs_requeue(&conditions));
        }

        #[test]
        fn test_any_unsettled_condition_requeues() {
            for (idx, status) in [
                (0, ConditionStatus::False),
                (1, ConditionStatus::True),
                (2, ConditionStatus::Unknown),
            ] {
                let mut conditions = settled();
                conditions[idx].status = status;
                assert!(needs_requeue(&conditions), "condition {idx}");
            }
        }

        #[test]
        fn test_missing_conditions_requeue() {
            assert!(needs_requeue(&[]));
        }
    }

    #[test]
    fn test_operand_image_reads_first_container() {
        let ds = daemon_set(1, 1, 1);
        assert_eq!(
            operand_image(&ds),
            Some("quay.io/openshift/origin-service-catalog:v4.0")
        );
    }

    #[test]
    fn test_fixed_condition_sets() {
        let unmanaged = unmanaged_conditions();
        assert_eq!(unmanaged[0].status, ConditionStatus::Unknown);
        assert!(unmanaged.iter().all(|c| c.reason == reasons::UNMANAGED));

        let removed = removed_conditions();
        assert_eq!(removed[0].status, ConditionStatus::True);
        assert_eq!(removed[0].message, "the apiserver is in the desired state (Removed).");
        assert!(removed[1..].iter().all(|c| c.status == ConditionStatus::False));
    }
}
