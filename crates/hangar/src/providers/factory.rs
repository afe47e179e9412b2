use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{CloudInfraProvider, KanikoProvider, SourceBuildProvider};
use crate::config::{HangarConfig, VendorBackend};
use crate::error::{PipelineError, Result};
use crate::source::SourceStager;
use crate::types::CloudVendor;

/// Closed mapping from vendor to backend, fixed at startup.
#[derive(Clone, Default)]
pub struct ProviderFactory {
    providers: HashMap<CloudVendor, Arc<dyn CloudInfraProvider>>,
}

impl ProviderFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, vendor: CloudVendor, provider: Arc<dyn CloudInfraProvider>) -> Self {
        self.providers.insert(vendor, provider);
        self
    }

    /// Wire every vendor listed under `vendors` to its backend. Backends are
    /// built once and shared between vendors that map to the same one.
    pub fn from_config(
        config: &HangarConfig,
        client: kube::Client,
        stager: SourceStager,
    ) -> Result<Self> {
        let mut kaniko: Option<Arc<dyn CloudInfraProvider>> = None;
        let mut source_build: Option<Arc<dyn CloudInfraProvider>> = None;
        let mut factory = Self::new();

        for (tag, backend) in &config.vendors {
            let vendor: CloudVendor = tag.parse()?;
            let provider = match backend {
                VendorBackend::Kaniko => kaniko
                    .get_or_insert_with(|| {
                        let provider = KanikoProvider::new(client.clone(), config, stager.clone());
                        Arc::new(provider) as Arc<dyn CloudInfraProvider>
                    })
                    .clone(),
                VendorBackend::SourceBuild => {
                    if source_build.is_none() {
                        let settings = config.source_build.as_ref().ok_or_else(|| {
                            PipelineError::Configuration(
                                "sourceBuild section is required by the configured vendors"
                                    .to_string(),
                            )
                        })?;
                        source_build = Some(Arc::new(SourceBuildProvider::new(
                            settings,
                            &config.build.registry_endpoint,
                            stager.clone(),
                        )?));
                    }
                    source_build.clone().ok_or_else(|| {
                        PipelineError::Configuration("source-build backend unavailable".to_string())
                    })?
                }
            };
            info!(vendor = %vendor, backend = provider.name(), "Registered build backend");
            factory = factory.register(vendor, provider);
        }
        Ok(factory)
    }

    /// Backend for a vendor; vendors without one are a configuration error.
    pub fn get(&self, vendor: CloudVendor) -> Result<Arc<dyn CloudInfraProvider>> {
        self.providers.get(&vendor).cloned().ok_or_else(|| {
            PipelineError::Configuration(format!("no build backend registered for vendor {vendor}"))
        })
    }

    /// Backend for a raw vendor tag.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn CloudInfraProvider>> {
        self.get(tag.parse()?)
    }
}
