//! Build job status interpretation
//!
//! A Job only counts a failure once a container has started and exited
//! nonzero. Pods that can never start (bad image, missing secret, nowhere to
//! schedule) leave the Job active forever, so the pods and their events are
//! inspected for permanent failures. Checks run in order and the first match
//! wins:
//! 1. Pod phase is `Failed`
//! 2. An init (fetch) container terminated with a nonzero exit code
//! 3. A container is waiting with one of [`FATAL_WAITING_REASONS`]
//! 4. `PodScheduled=False` with reason `Unschedulable`
//! 5. A `Warning` event with reason `FailedMount` for the pod

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};

/// Waiting reasons that never resolve without outside intervention.
pub const FATAL_WAITING_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Terminal outcome reported by the Job itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Active,
    Succeeded,
    Failed(String),
}

pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = job.status.as_ref() else {
        return JobOutcome::Active;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return JobOutcome::Succeeded;
    }
    if status.failed.unwrap_or(0) > 0 {
        let detail = status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "Failed" && c.status == "True")
            .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
            .unwrap_or_else(|| "build container exited with an error".to_string());
        return JobOutcome::Failed(detail);
    }
    JobOutcome::Active
}

/// Checks 1 to 4, which only need the pod object.
pub fn detect_pod_failure(namespace: &str, pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    let pod_name = pod.metadata.name.as_deref().unwrap_or("<unknown>");

    if status.phase.as_deref() == Some("Failed") {
        let reason = status.reason.as_deref().unwrap_or("unknown");
        return Some(match status.message.as_deref() {
            Some(message) => format!("Pod failed: {reason}: {message}"),
            None => format!("Pod failed: {reason}"),
        });
    }

    for init in status.init_container_statuses.iter().flatten() {
        let Some(terminated) = init.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        if terminated.exit_code != 0 {
            let container = &init.name;
            return Some(format!(
                "Init container '{container}' failed (exitCode={}): \
                 kubectl logs -n {namespace} {pod_name} -c {container}",
                terminated.exit_code
            ));
        }
    }

    for container in status.container_statuses.iter().flatten() {
        let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
            continue;
        };
        let Some(reason) = waiting.reason.as_deref() else {
            continue;
        };
        if FATAL_WAITING_REASONS.contains(&reason) {
            return Some(match waiting.message.as_deref() {
                Some(message) => format!("{reason}: {message}"),
                None => reason.to_string(),
            });
        }
    }

    let unschedulable = status.conditions.iter().flatten().find(|c| {
        c.type_ == "PodScheduled"
            && c.status == "False"
            && c.reason.as_deref() == Some("Unschedulable")
    });
    if let Some(condition) = unschedulable {
        return Some(format!(
            "Pod unschedulable: {}",
            condition.message.as_deref().unwrap_or("no message")
        ));
    }

    None
}

/// Check 5, over the events recorded for one pod.
pub fn detect_failed_mount(namespace: &str, pod_name: &str, events: &[Event]) -> Option<String> {
    events
        .iter()
        .find(|e| {
            e.type_.as_deref() == Some("Warning") && e.reason.as_deref() == Some("FailedMount")
        })
        .map(|event| {
            format!(
                "FailedMount: {} (kubectl describe pod {pod_name} -n {namespace})",
                event
                    .message
                    .as_deref()
                    .unwrap_or("a referenced Secret or ConfigMap is missing")
            )
        })
}
