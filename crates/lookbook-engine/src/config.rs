use std::env;
use std::path::PathBuf;

use crate::gemini::DEFAULT_GEMINI_API_BASE;
use crate::util::non_empty_env;

pub const DEFAULT_BATCH_CONCURRENCY: usize = 3;
pub const MAX_BATCH_CONCURRENCY: usize = 16;

/// Runtime settings read from the environment. CLI flags override fields
/// after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct StudioConfig {
    pub home: PathBuf,
    pub api_base: String,
    pub api_key: Option<String>,
    pub image_model: Option<String>,
    pub batch_concurrency: usize,
    pub token: Option<String>,
}

impl StudioConfig {
    pub fn from_env() -> Self {
        let home = non_empty_env("LOOKBOOK_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".lookbook")))
            .unwrap_or_else(|| PathBuf::from(".lookbook"));
        Self {
            home,
            api_base: non_empty_env("GEMINI_API_BASE")
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            image_model: non_empty_env("LOOKBOOK_IMAGE_MODEL"),
            batch_concurrency: non_empty_env("LOOKBOOK_BATCH_CONCURRENCY")
                .and_then(|raw| raw.parse::<usize>().ok())
                .map(clamp_concurrency)
                .unwrap_or(DEFAULT_BATCH_CONCURRENCY),
            token: non_empty_env("LOOKBOOK_TOKEN"),
        }
    }

    /// Config rooted at `home` with no credentials, for offline use.
    pub fn local(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            api_key: None,
            image_model: None,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            token: None,
        }
    }

    pub fn pricing_overrides_path(&self) -> PathBuf {
        self.home.join("pricing_overrides.json")
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.home.join("tokens.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.home.join("ledger.jsonl")
    }

    pub fn events_path(&self) -> PathBuf {
        self.home.join("events.jsonl")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.home.join("outputs")
    }

    pub fn gallery_root(&self, user_id: &str) -> PathBuf {
        self.home.join("gallery").join(sanitize_user_dir(user_id))
    }

    pub fn has_token_table(&self) -> bool {
        self.tokens_path().is_file()
    }
}

pub fn clamp_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_BATCH_CONCURRENCY)
}

fn sanitize_user_dir(user_id: &str) -> String {
    let cleaned: String = user_id
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        return "_".to_string();
    }
    cleaned
}
