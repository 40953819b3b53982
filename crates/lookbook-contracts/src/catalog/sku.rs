use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const VIEW_TOKENS: &[&str] = &[
    "front", "back", "side", "detail", "flat", "flatlay", "closeup", "close", "main", "alt",
    "model", "lay", "top", "bottom", "left", "right", "full", "zoom",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub sku: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grouping {
    pub products: Vec<Product>,
    pub skipped: Vec<PathBuf>,
}

impl Grouping {
    pub fn product(&self, sku: &str) -> Option<&Product> {
        self.products.iter().find(|product| product.sku == sku)
    }
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|ext| {
            let lowered = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lowered.as_str())
        })
        .unwrap_or(false)
}

/// Derives a SKU from a file name by peeling trailing view suffixes such as
/// `_front`, `-2` or ` (1)` off the stem and uppercasing what remains.
pub fn infer_sku(file_name: &str) -> Option<String> {
    let base = Path::new(file_name.trim())
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(file_name)
        .to_string();
    let stem = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains(' ') => stem.to_string(),
        _ => base,
    };
    let mut current = stem.trim().to_string();

    loop {
        let trimmed = current.trim_end_matches(is_separator).to_string();
        let Some(idx) = trimmed.rfind(is_separator) else {
            current = trimmed;
            break;
        };
        let tail = &trimmed[idx + 1..];
        let head = trimmed[..idx].trim_end_matches(is_separator);
        if head.is_empty() || !is_view_suffix(tail) {
            current = trimmed;
            break;
        }
        current = head.to_string();
    }

    let sku = current.trim().to_ascii_uppercase();
    if sku.is_empty() {
        return None;
    }
    Some(sku)
}

/// Groups files into products ordered by SKU, files ordered by name.
pub fn group_products<P: AsRef<Path>>(files: &[P]) -> Grouping {
    let mut by_sku: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut skipped = Vec::new();
    for file in files {
        let path = file.as_ref();
        if !is_supported_image(path) {
            skipped.push(path.to_path_buf());
            continue;
        }
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or_default();
        match infer_sku(name) {
            Some(sku) => by_sku.entry(sku).or_default().push(path.to_path_buf()),
            None => skipped.push(path.to_path_buf()),
        }
    }
    let products = by_sku
        .into_iter()
        .map(|(sku, mut files)| {
            files.sort_by(|left, right| left.file_name().cmp(&right.file_name()));
            Product { sku, files }
        })
        .collect();
    Grouping { products, skipped }
}

fn is_separator(ch: char) -> bool {
    matches!(ch, '_' | '-' | ' ' | '.')
}

fn is_view_suffix(token: &str) -> bool {
    let lowered = token.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return false;
    }
    if VIEW_TOKENS.contains(&lowered.as_str()) {
        return true;
    }
    if lowered.len() <= 3 && lowered.chars().all(|ch| ch.is_ascii_digit()) {
        return true;
    }
    if let Some(inner) = lowered.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
        return !inner.is_empty() && inner.chars().all(|ch| ch.is_ascii_digit());
    }
    false
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{group_products, infer_sku};

    #[test]
    fn strips_view_suffixes() {
        assert_eq!(infer_sku("ts1001_front.jpg").as_deref(), Some("TS1001"));
        assert_eq!(infer_sku("TS-1001-back.png").as_deref(), Some("TS-1001"));
        assert_eq!(infer_sku("TS-1001_detail_2.webp").as_deref(), Some("TS-1001"));
        assert_eq!(infer_sku("dress 44 (1).jpeg").as_deref(), Some("DRESS"));
        assert_eq!(infer_sku("SKU88.png").as_deref(), Some("SKU88"));
    }

    #[test]
    fn keeps_meaningful_tokens() {
        assert_eq!(infer_sku("JKT-2024-blue_front.jpg").as_deref(), Some("JKT-2024-BLUE"));
        assert_eq!(infer_sku("front.jpg").as_deref(), Some("FRONT"));
        assert_eq!(infer_sku("/uploads/a/b/ab12_side.png").as_deref(), Some("AB12"));
        assert!(infer_sku("   ").is_none());
    }

    #[test]
    fn groups_by_sku_and_skips_unsupported() {
        let files = vec![
            PathBuf::from("in/TS1001_back.jpg"),
            PathBuf::from("in/TS1001_front.jpg"),
            PathBuf::from("in/AB-7.png"),
            PathBuf::from("in/notes.txt"),
        ];
        let grouping = group_products(&files);
        let skus: Vec<&str> = grouping.products.iter().map(|p| p.sku.as_str()).collect();
        assert_eq!(skus, vec!["AB", "TS1001"]);
        assert_eq!(
            grouping.product("TS1001").map(|p| p.files.clone()),
            Some(vec![
                PathBuf::from("in/TS1001_back.jpg"),
                PathBuf::from("in/TS1001_front.jpg"),
            ])
        );
        assert_eq!(grouping.skipped, vec![PathBuf::from("in/notes.txt")]);
    }
}
