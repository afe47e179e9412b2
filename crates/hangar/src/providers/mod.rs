//! Build vendor abstractions.

mod factory;
pub mod kaniko;
pub mod sourcebuild;
mod traits;

pub use factory::ProviderFactory;
pub use kaniko::KanikoProvider;
pub use sourcebuild::SourceBuildProvider;
pub use traits::CloudInfraProvider;
