//! Source staging shared by every vendor: fetch the commit archive from
//! GitHub, re-root it and put it in object storage.

mod archive;
mod stager;

pub use archive::strip_top_level_dir;
pub use stager::SourceStager;
