//! Product catalog side of the batch pipeline: grouping uploads by SKU,
//! looking up metadata rows, and resolving per-item settings.

mod settings;
mod sheet;
mod sku;

pub use settings::{
    resolve_settings, BatchOperation, ItemSettings, ResolvedSettings, SettingSource,
    MAX_VARIATIONS,
};
pub use sheet::{MetadataSheet, SheetRow, SKU_COLUMNS};
pub use sku::{group_products, infer_sku, is_supported_image, Grouping, Product};
