//! Build job construction.
//!
//! One-shot Job with two steps sharing an `emptyDir` workspace: an init
//! container pulls the staged archive from object storage and unpacks it,
//! then kaniko builds from the local directory and pushes the image.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use serde_json::json;

use crate::config::HangarConfig;
use crate::error::{PipelineError, Result};
use crate::types::{Deployment, DeploymentId};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const DEPLOYMENT_ID_LABEL: &str = "hangar.dev/deployment-id";
pub const COMMIT_SHA_LABEL: &str = "hangar.dev/commit-sha";
pub const MANAGED_BY: &str = "hangar";

pub const FETCH_CONTAINER: &str = "source-fetch";
pub const BUILD_CONTAINER: &str = "kaniko";

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";
const DOCKER_CONFIG_PATH: &str = "/kaniko/.docker";
const ARCHIVE_PATH: &str = "/tmp/source.zip";

/// Builds kaniko Jobs from static cluster and storage settings.
#[derive(Debug, Clone)]
pub struct BuildJobBuilder {
    pub namespace: String,
    pub job_name_prefix: String,
    pub kaniko_image: String,
    pub fetcher_image: String,
    pub image_pull_secret: String,
    pub ttl_seconds_after_finished: i32,
    pub bucket: String,
    pub storage_endpoint: String,
    pub storage_region: String,
    pub credentials_secret: String,
}

impl BuildJobBuilder {
    #[must_use]
    pub fn from_config(config: &HangarConfig) -> Self {
        Self {
            namespace: config.kubernetes.namespace.clone(),
            job_name_prefix: config.build.job_name_prefix.clone(),
            kaniko_image: config.build.kaniko_image.clone(),
            fetcher_image: config.build.fetcher_image.clone(),
            image_pull_secret: config.kubernetes.image_pull_secret.clone(),
            ttl_seconds_after_finished: config.build.ttl_seconds_after_finished,
            bucket: config.storage.bucket.clone(),
            storage_endpoint: config.storage.endpoint.clone(),
            storage_region: config.storage.region.clone(),
            credentials_secret: config.storage.credentials_secret.clone(),
        }
    }

    #[must_use]
    pub fn job_name(&self, deployment_id: DeploymentId) -> String {
        format!("{}-{deployment_id}", self.job_name_prefix)
    }

    /// Traceability labels shared by the Job and its pod template.
    #[must_use]
    pub fn labels(deployment: &Deployment) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (DEPLOYMENT_ID_LABEL.to_string(), deployment.id.to_string()),
            (
                COMMIT_SHA_LABEL.to_string(),
                deployment.short_commit().to_string(),
            ),
        ])
    }

    /// Shell pipeline run by the fetch step.
    #[must_use]
    pub fn fetch_command(&self, storage_key: &str) -> String {
        let unzip = format!(
            "import zipfile; zipfile.ZipFile('{ARCHIVE_PATH}').extractall('{WORKSPACE_PATH}')"
        );
        format!(
            "aws s3 cp s3://{bucket}/{storage_key} {ARCHIVE_PATH} --endpoint-url {endpoint} \
             && python3 -c \"{unzip}\" && rm {ARCHIVE_PATH}",
            bucket = self.bucket,
            endpoint = self.storage_endpoint,
        )
    }

    pub fn build(
        &self,
        deployment: &Deployment,
        storage_key: &str,
        image_uri: &str,
    ) -> Result<Job> {
        let job_name = self.job_name(deployment.id);
        let labels = Self::labels(deployment);

        let fetch = json!({
            "name": FETCH_CONTAINER,
            "image": self.fetcher_image,
            "command": ["/bin/sh", "-c"],
            "args": [self.fetch_command(storage_key)],
            "env": [
                {
                    "name": "AWS_ACCESS_KEY_ID",
                    "valueFrom": {
                        "secretKeyRef": { "name": self.credentials_secret, "key": "access-key" }
                    }
                },
                {
                    "name": "AWS_SECRET_ACCESS_KEY",
                    "valueFrom": {
                        "secretKeyRef": { "name": self.credentials_secret, "key": "secret-key" }
                    }
                },
                { "name": "AWS_DEFAULT_REGION", "value": self.storage_region }
            ],
            "volumeMounts": [ { "name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_PATH } ]
        });

        let build = json!({
            "name": BUILD_CONTAINER,
            "image": self.kaniko_image,
            "args": [
                format!("--context=dir://{WORKSPACE_PATH}"),
                format!("--destination={image_uri}"),
                "--compressed-caching=false",
                "--snapshot-mode=redo"
            ],
            "volumeMounts": [
                { "name": DOCKER_CONFIG_VOLUME, "mountPath": DOCKER_CONFIG_PATH },
                { "name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_PATH }
            ]
        });

        let job_spec = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "namespace": self.namespace,
                "labels": labels
            },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": self.ttl_seconds_after_finished,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "initContainers": [fetch],
                        "containers": [build],
                        "volumes": [
                            { "name": WORKSPACE_VOLUME, "emptyDir": {} },
                            {
                                "name": DOCKER_CONFIG_VOLUME,
                                "secret": {
                                    "secretName": self.image_pull_secret,
                                    "items": [
                                        { "key": ".dockerconfigjson", "path": "config.json" }
                                    ]
                                }
                            }
                        ]
                    }
                }
            }
        });

        serde_json::from_value(job_spec)
            .map_err(|e| PipelineError::BuildTrigger(format!("invalid build job spec: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepositoryId;

    fn builder() -> BuildJobBuilder {
        let mut config = HangarConfig::default();
        config.kubernetes.namespace = "builds".to_string();
        config.storage.endpoint = "https://storage.example.com".to_string();
        config.storage.bucket = "sources".to_string();
        BuildJobBuilder::from_config(&config)
    }

    fn deployment() -> Deployment {
        Deployment::new(DeploymentId(17), RepositoryId(3), "main", "abc123def456")
    }

    #[test]
    fn job_is_one_shot_and_garbage_collected() {
        let job = builder()
            .build(&deployment(), "builds/17/source.zip", "registry.example.com/owner-repo:latest")
            .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("hangar-build-17"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("builds"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(pod.containers.len(), 1);
    }

    #[test]
    fn labels_carry_deployment_and_short_commit() {
        let job = builder()
            .build(&deployment(), "builds/17/source.zip", "r/owner-repo:latest")
            .unwrap();
        let labels = job.metadata.labels.unwrap();

        assert_eq!(labels[MANAGED_BY_LABEL], "hangar");
        assert_eq!(labels[DEPLOYMENT_ID_LABEL], "17");
        assert_eq!(labels[COMMIT_SHA_LABEL], "abc123d");
        let template_labels = job.spec.unwrap().template.metadata.unwrap().labels.unwrap();
        assert_eq!(template_labels, labels);
    }

    #[test]
    fn build_step_uses_local_directory_context() {
        let job = builder()
            .build(&deployment(), "builds/17/source.zip", "registry.example.com/owner-repo:latest")
            .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let kaniko = &pod.containers[0];

        let args = kaniko.args.as_ref().unwrap();
        assert!(args.contains(&"--context=dir:///workspace".to_string()));
        assert!(args.contains(&"--destination=registry.example.com/owner-repo:latest".to_string()));

        let mounts: Vec<_> = kaniko
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect();
        assert!(mounts.contains(&("docker-config", "/kaniko/.docker")));
        assert!(mounts.contains(&("workspace", "/workspace")));

        let docker_config = pod
            .volumes
            .unwrap()
            .into_iter()
            .find(|v| v.name == "docker-config")
            .unwrap();
        let secret = docker_config.secret.unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("registry-credentials"));
        assert_eq!(secret.items.unwrap()[0].path, "config.json");
    }

    #[test]
    fn fetch_step_downloads_staged_key_with_secret_credentials() {
        let job = builder()
            .build(&deployment(), "builds/17/source.zip", "r/owner-repo:latest")
            .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let fetch = &pod.init_containers.unwrap()[0];

        assert_eq!(fetch.name, FETCH_CONTAINER);
        let script = &fetch.args.as_ref().unwrap()[0];
        assert!(script.starts_with("aws s3 cp s3://sources/builds/17/source.zip /tmp/source.zip"));
        assert!(script.contains("--endpoint-url https://storage.example.com"));
        assert!(script.contains("extractall('/workspace')"));

        let env = fetch.env.as_ref().unwrap();
        let access = env.iter().find(|e| e.name == "AWS_ACCESS_KEY_ID").unwrap();
        let secret_ref = access
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(secret_ref.name, "hangar-storage-credentials");
        assert!(access.value.is_none());
    }
}
