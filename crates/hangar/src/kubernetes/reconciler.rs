use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::manifests::{deployment_manifest, ingress_manifest, service_manifest};
use crate::config::KubernetesConfig;
use crate::error::{PipelineError, Result};
use crate::types::{DeploymentConfig, RepositoryId};

/// Converges the runtime resources of an app.
#[async_trait]
pub trait WorkloadReconciler: Send + Sync {
    /// Upsert Deployment, Service and, when a domain is set, Ingress.
    async fn deploy(
        &self,
        app_name: &str,
        image_uri: &str,
        config: &DeploymentConfig,
        repository_id: RepositoryId,
    ) -> Result<()>;

    /// Set the workload's replica count.
    async fn scale(&self, app_name: &str, replicas: i32) -> Result<()>;
}

/// Server-side apply against the configured namespace.
#[derive(Clone)]
pub struct KubernetesReconciler {
    client: Client,
    namespace: String,
    field_manager: String,
    image_pull_secret: String,
}

impl KubernetesReconciler {
    #[must_use]
    pub fn new(client: Client, config: &KubernetesConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            field_manager: config.field_manager.clone(),
            image_pull_secret: config.image_pull_secret.clone(),
        }
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    async fn apply<K>(&self, api: &Api<K>, kind: &str, name: &str, resource: &K) -> Result<()>
    where
        K: Clone + Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        api.patch(name, &self.apply_params(), &Patch::Apply(resource))
            .await
            .map_err(|e| {
                PipelineError::Deploy(format!("failed to apply {kind} {name}: {e}"))
            })?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadReconciler for KubernetesReconciler {
    async fn deploy(
        &self,
        app_name: &str,
        image_uri: &str,
        config: &DeploymentConfig,
        repository_id: RepositoryId,
    ) -> Result<()> {
        if repository_id != config.repository_id {
            return Err(PipelineError::Deploy(format!(
                "deployment config belongs to repository {}, not {repository_id}",
                config.repository_id
            )));
        }

        let deployment = deployment_manifest(
            &self.namespace,
            app_name,
            image_uri,
            config,
            Some(&self.image_pull_secret),
        )?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        self.apply(&deployments, "Deployment", app_name, &deployment).await?;

        let service = service_manifest(&self.namespace, app_name, config)?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        self.apply(&services, "Service", app_name, &service).await?;

        if let Some(ingress) = ingress_manifest(&self.namespace, app_name, config)? {
            let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);
            self.apply(&ingresses, "Ingress", app_name, &ingress).await?;
        }

        info!(
            app = %app_name,
            namespace = %self.namespace,
            image = %image_uri,
            "Workload reconciled"
        );
        Ok(())
    }

    async fn scale(&self, app_name: &str, replicas: i32) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        deployments
            .patch_scale(app_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| PipelineError::Deploy(format!("failed to scale {app_name}: {e}")))?;

        info!(app = %app_name, replicas, "Scaled workload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DEPLOYMENT_PATH: &str = "/apis/apps/v1/namespaces/apps/deployments/owner-repo";
    const SERVICE_PATH: &str = "/api/v1/namespaces/apps/services/owner-repo";
    const INGRESS_PATH: &str = "/apis/networking.k8s.io/v1/namespaces/apps/ingresses/owner-repo";

    fn reconciler(server: &MockServer) -> KubernetesReconciler {
        let config = kube::Config::new(server.uri().parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let settings = KubernetesConfig {
            namespace: "apps".to_string(),
            ..KubernetesConfig::default()
        };
        KubernetesReconciler::new(client, &settings)
    }

    fn config(domain: Option<&str>) -> DeploymentConfig {
        DeploymentConfig {
            repository_id: RepositoryId(4),
            min_replicas: 2,
            max_replicas: 5,
            env_vars: BTreeMap::new(),
            container_port: 3000,
            domain_url: domain.map(str::to_string),
        }
    }

    fn object(api_version: &str, kind: &str) -> Value {
        json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": "owner-repo", "namespace": "apps" }
        })
    }

    /// Server-side apply of one resource, expected `times` times.
    async fn expect_apply(
        server: &MockServer,
        at: &str,
        kind: &str,
        api_version: &str,
        times: u64,
    ) {
        Mock::given(method("PATCH"))
            .and(path(at))
            .and(query_param("fieldManager", "hangar"))
            .and(query_param("force", "true"))
            .and(header("content-type", "application/apply-patch+yaml"))
            .and(body_partial_json(json!({ "kind": kind })))
            .respond_with(ResponseTemplate::new(200).set_body_json(object(api_version, kind)))
            .expect(times)
            .mount(server)
            .await;
    }

    async fn forbid_create_and_delete(server: &MockServer) {
        for verb in ["POST", "PUT", "DELETE"] {
            Mock::given(method(verb))
                .respond_with(ResponseTemplate::new(500))
                .expect(0)
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn repeated_deploy_converges_through_apply() {
        let server = MockServer::start().await;
        expect_apply(&server, DEPLOYMENT_PATH, "Deployment", "apps/v1", 2).await;
        expect_apply(&server, SERVICE_PATH, "Service", "v1", 2).await;
        expect_apply(&server, INGRESS_PATH, "Ingress", "networking.k8s.io/v1", 2).await;
        forbid_create_and_delete(&server).await;

        let reconciler = reconciler(&server);
        let cfg = config(Some("app.example.com"));
        for _ in 0..2 {
            reconciler
                .deploy("owner-repo", "r.example.com/owner-repo:latest", &cfg, RepositoryId(4))
                .await
                .unwrap();
        }

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 6);
        let first: Value = requests[0].body_json().unwrap();
        assert_eq!(first["spec"]["replicas"], 2);
        assert_eq!(
            first["spec"]["template"]["spec"]["containers"][0]["image"],
            "r.example.com/owner-repo:latest"
        );
    }

    #[tokio::test]
    async fn deploy_without_domain_skips_ingress() {
        let server = MockServer::start().await;
        expect_apply(&server, DEPLOYMENT_PATH, "Deployment", "apps/v1", 1).await;
        expect_apply(&server, SERVICE_PATH, "Service", "v1", 1).await;
        expect_apply(&server, INGRESS_PATH, "Ingress", "networking.k8s.io/v1", 0).await;
        forbid_create_and_delete(&server).await;

        reconciler(&server)
            .deploy("owner-repo", "r.example.com/owner-repo:latest", &config(None), RepositoryId(4))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_apply_is_a_deploy_error() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(DEPLOYMENT_PATH))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "Status",
                "metadata": {},
                "status": "Failure",
                "message": "Deployment.apps \"owner-repo\" is invalid",
                "reason": "Invalid",
                "code": 422
            })))
            .mount(&server)
            .await;

        let err = reconciler(&server)
            .deploy("owner-repo", "image", &config(None), RepositoryId(4))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DEPLOY_FAILED");
        assert!(err.to_string().contains("failed to apply Deployment owner-repo"));
    }

    #[tokio::test]
    async fn config_of_another_repository_is_refused() {
        let server = MockServer::start().await;

        let err = reconciler(&server)
            .deploy("owner-repo", "image", &config(None), RepositoryId(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DEPLOY_FAILED");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scale_patches_the_scale_subresource() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(format!("{DEPLOYMENT_PATH}/scale")))
            .and(header("content-type", "application/merge-patch+json"))
            .and(body_json(json!({ "spec": { "replicas": 3 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "autoscaling/v1",
                "kind": "Scale",
                "metadata": { "name": "owner-repo", "namespace": "apps" },
                "spec": { "replicas": 3 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        reconciler(&server).scale("owner-repo", 3).await.unwrap();
    }
}
