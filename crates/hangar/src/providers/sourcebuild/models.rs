//! Build-service API payloads.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Image build timeout requested from the service, in seconds.
const BUILD_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub project_name: String,
    pub description: String,
    pub source: Value,
    pub build: Value,
    pub artifact: Value,
}

impl CreateProjectRequest {
    /// Project that builds `image_name:latest` from a staged object and pushes
    /// it to `registry`. The object is overridden on every trigger.
    #[must_use]
    pub fn new(
        project_name: String,
        bucket: &str,
        object_key: &str,
        registry: &str,
        image_name: &str,
    ) -> Self {
        Self {
            project_name,
            description: "hangar managed build project".to_string(),
            source: ObjectSource::new(bucket, object_key).to_value(),
            build: json!({
                "cmd": { "pre": [], "build": [format!("docker build -t {image_name} .")] },
                "timeout": BUILD_TIMEOUT_SECS,
                "env": {}
            }),
            artifact: json!({
                "use": true,
                "type": "ContainerRegistry",
                "config": { "registry": registry, "image": image_name, "tag": "latest" }
            }),
        }
    }
}

/// Object-storage source reference.
#[derive(Debug, Clone)]
pub struct ObjectSource<'a> {
    pub bucket: &'a str,
    pub object: &'a str,
}

impl<'a> ObjectSource<'a> {
    #[must_use]
    pub fn new(bucket: &'a str, object: &'a str) -> Self {
        Self { bucket, object }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "type": "ObjectStorage",
            "config": { "bucket": self.bucket, "object": self.object }
        })
    }
}

/// Body of a build trigger: points the build at this deployment's archive.
#[must_use]
pub fn trigger_request(bucket: &str, object_key: &str) -> Value {
    json!({ "source": ObjectSource::new(bucket, object_key).to_value() })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectResponse {
    pub id: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub build_id: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusResponse {
    pub status: String,
    #[serde(default)]
    pub image_uri: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Ids come back as numbers or strings depending on the endpoint.
#[must_use]
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
