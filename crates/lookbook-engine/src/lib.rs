pub mod batch;
pub mod canvas;
pub mod config;
pub mod data_url;
pub mod editor;
pub mod gallery;
pub mod gemini;
pub mod pricing;
pub mod prompts;
pub mod provider;
pub mod studio;
mod util;

pub use config::StudioConfig;
pub use data_url::DataUrl;
pub use editor::{EditReply, EditSession};
pub use gallery::{GalleryEntry, GalleryStore};
pub use provider::{GenerationProvider, ProviderRegistry};
pub use studio::{CostLatencyMetrics, GenerationFailure, OpOptions, Studio, StudioOutput};
