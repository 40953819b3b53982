use indexmap::IndexMap;

pub const CAPABILITY_GENERATE: &str = "image";
pub const CAPABILITY_EDIT: &str = "edit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub max_input_images: u32,
    pub pricing_key: Option<String>,
    pub latency_key: Option<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    pub fn is_dryrun(&self) -> bool {
        self.provider == "dryrun"
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, max_input_images: u32, pricing_key: &str| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: vec![
                    CAPABILITY_GENERATE.to_string(),
                    CAPABILITY_EDIT.to_string(),
                ],
                max_input_images,
                pricing_key: Some(pricing_key.to_string()),
                latency_key: Some(pricing_key.to_string()),
            },
        );
    };

    insert(
        "gemini-2.5-flash-image",
        "gemini",
        3,
        "google-gemini-2.5-flash-image",
    );
    insert(
        "gemini-3-pro-image-preview",
        "gemini",
        14,
        "google-gemini-3-pro-image-preview",
    );
    insert("dryrun-image-1", "dryrun", 16, "dryrun-image");

    map
}
