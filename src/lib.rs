//! Audio-reactive visuals from pre-analyzed stems and MIDI.
//!
//! Two paths share one feature index: a live path that packs every feature
//! series into a texture the effect shader samples directly, and an export
//! path that precomputes exact per-frame values and hands them to a
//! single-flight job queue.

pub mod audio;
pub mod config;
pub mod effects;
pub mod encode;
pub mod error;
pub mod export;
pub mod features;
pub mod render;
pub mod session;

pub use error::{Error, Result};
pub use export::config::ExportConfiguration;
pub use export::job::{ExportJob, JobEvent, JobId, JobStatus};
pub use export::precompute::{precompute, FrameRecord};
pub use features::index::{FeatureIndex, FeatureIndexEntry};
pub use features::sampler::{FeatureSampler, SamplerKind};
pub use session::{Studio, StudioConfig};
