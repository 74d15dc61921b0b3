//! Format-agnostic pipeline plumbing shared by every plug-in and the
//! `diskmorph` binary: the plug-in ABI is defined in `diskmorph-abi`,
//! everything else (caching, fingerprinting, the worker pool, the
//! registry, and the pipeline builder that ties it all together) lives
//! here.

pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod image;
pub mod io_util;
pub mod lru;
pub mod pipeline;
pub mod registry;
pub mod worker;

pub use error::{DiskMorphError, Result};
pub use image::Image;
pub use pipeline::{InputSpec, Pipeline, PipelineConfig};
pub use registry::Registry;
