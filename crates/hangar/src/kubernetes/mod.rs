//! Runtime workload reconciliation.

mod manifests;
mod reconciler;

pub use manifests::{
    deployment_manifest, ingress_manifest, service_manifest, workload_labels, APP_NAME_LABEL,
    REPOSITORY_ID_LABEL, SERVICE_PORT,
};
pub use reconciler::{KubernetesReconciler, WorkloadReconciler};
