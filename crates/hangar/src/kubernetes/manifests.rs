//! Desired state for a repository's workload: Deployment, Service and an
//! optional Ingress, all keyed on the app name.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::json;

use crate::error::{PipelineError, Result};
use crate::providers::kaniko::{MANAGED_BY, MANAGED_BY_LABEL};
use crate::types::{DeploymentConfig, RepositoryId};

pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const REPOSITORY_ID_LABEL: &str = "hangar.dev/repository-id";

/// Port the Service and Ingress expose.
pub const SERVICE_PORT: i32 = 80;

fn manifest_error(kind: &str, e: serde_json::Error) -> PipelineError {
    PipelineError::Deploy(format!("invalid {kind} manifest: {e}"))
}

#[must_use]
pub fn workload_labels(app_name: &str, repository_id: RepositoryId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL.to_string(), app_name.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (REPOSITORY_ID_LABEL.to_string(), repository_id.to_string()),
    ])
}

pub fn deployment_manifest(
    namespace: &str,
    app_name: &str,
    image_uri: &str,
    config: &DeploymentConfig,
    image_pull_secret: Option<&str>,
) -> Result<Deployment> {
    let labels = workload_labels(app_name, config.repository_id);
    let env: Vec<_> = config
        .env_vars
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut pod_spec = json!({
        "containers": [{
            "name": app_name,
            "image": image_uri,
            "ports": [{ "containerPort": config.effective_container_port() }],
            "env": env
        }]
    });
    if let Some(secret) = image_pull_secret.filter(|s| !s.is_empty()) {
        pod_spec["imagePullSecrets"] = json!([{ "name": secret }]);
    }

    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": app_name, "namespace": namespace, "labels": labels },
        "spec": {
            "replicas": config.min_replicas,
            "selector": { "matchLabels": { APP_NAME_LABEL: app_name } },
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec
            }
        }
    }))
    .map_err(|e| manifest_error("Deployment", e))
}

pub fn service_manifest(
    namespace: &str,
    app_name: &str,
    config: &DeploymentConfig,
) -> Result<Service> {
    let labels = workload_labels(app_name, config.repository_id);
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": app_name, "namespace": namespace, "labels": labels },
        "spec": {
            "type": "ClusterIP",
            "selector": { APP_NAME_LABEL: app_name },
            "ports": [{
                "port": SERVICE_PORT,
                "targetPort": config.effective_container_port(),
                "protocol": "TCP"
            }]
        }
    }))
    .map_err(|e| manifest_error("Service", e))
}

/// `None` when the config carries no domain.
pub fn ingress_manifest(
    namespace: &str,
    app_name: &str,
    config: &DeploymentConfig,
) -> Result<Option<Ingress>> {
    let Some(host) = config.domain() else {
        return Ok(None);
    };
    let labels = workload_labels(app_name, config.repository_id);
    serde_json::from_value(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": { "name": app_name, "namespace": namespace, "labels": labels },
        "spec": {
            "rules": [{
                "host": host,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": { "name": app_name, "port": { "number": SERVICE_PORT } }
                        }
                    }]
                }
            }]
        }
    }))
    .map(Some)
    .map_err(|e| manifest_error("Ingress", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn config() -> DeploymentConfig {
        DeploymentConfig {
            repository_id: RepositoryId(4),
            min_replicas: 2,
            max_replicas: 5,
            env_vars: BTreeMap::from([
                ("RUST_LOG".to_string(), "info".to_string()),
                ("DATABASE_URL".to_string(), "postgres://db".to_string()),
            ]),
            container_port: 0,
            domain_url: None,
        }
    }

    #[test]
    fn deployment_runs_image_with_env_and_default_port() {
        let d = deployment_manifest(
            "apps",
            "owner-repo",
            "r/owner-repo:latest",
            &config(),
            Some("regcred"),
        )
        .unwrap();
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.unwrap()[APP_NAME_LABEL],
            "owner-repo"
        );

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("r/owner-repo:latest"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
        let env: Vec<_> = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap()))
            .collect();
        assert_eq!(
            env,
            vec![("DATABASE_URL", "postgres://db"), ("RUST_LOG", "info")]
        );
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "regcred");
    }

    #[test]
    fn service_maps_port_80_to_container_port() {
        let mut cfg = config();
        cfg.container_port = 3000;
        let svc = service_manifest("apps", "owner-repo", &cfg).unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(3000)));
        assert_eq!(spec.selector.unwrap()[APP_NAME_LABEL], "owner-repo");
    }

    #[test]
    fn ingress_only_with_domain() {
        assert!(ingress_manifest("apps", "owner-repo", &config()).unwrap().is_none());

        let mut cfg = config();
        cfg.domain_url = Some("app.example.com".to_string());
        let ingress = ingress_manifest("apps", "owner-repo", &cfg).unwrap().unwrap();
        let rule = &ingress.spec.unwrap().rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("app.example.com"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "owner-repo");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
    }

    #[test]
    fn all_resources_share_labels() {
        let mut cfg = config();
        cfg.domain_url = Some("app.example.com".to_string());
        let expected = workload_labels("owner-repo", RepositoryId(4));

        let d = deployment_manifest("apps", "owner-repo", "img", &cfg, None).unwrap();
        let s = service_manifest("apps", "owner-repo", &cfg).unwrap();
        let i = ingress_manifest("apps", "owner-repo", &cfg).unwrap().unwrap();
        assert_eq!(d.metadata.labels.as_ref(), Some(&expected));
        assert_eq!(s.metadata.labels.as_ref(), Some(&expected));
        assert_eq!(i.metadata.labels.as_ref(), Some(&expected));
        assert_eq!(expected[REPOSITORY_ID_LABEL], "4");
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = deployment_manifest("apps", "owner-repo", "img", &config(), None).unwrap();
        let b = deployment_manifest("apps", "owner-repo", "img", &config(), None).unwrap();
        assert_eq!(a, b);
    }
}
