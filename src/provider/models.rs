//! Static model registry.

use super::types::ModelInfo;

pub const DEFAULT_MODEL_ID: &str = "claude-3-5-sonnet-20241022";

/// Models that accept the prompt-caching beta header.
///
/// Membership is checked by exact id, never by prefix.
pub const PROMPT_CACHING_MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-haiku-20240307",
];

pub const MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-3-5-sonnet-20241022",
        max_tokens: 8192,
        context_window: 200_000,
        supports_images: true,
        supports_prompt_cache: true,
        input_price: 0.864,
        output_price: 4.32,
        cache_writes_price: 1.08,
        cache_reads_price: 0.0864,
    },
    ModelInfo {
        id: "claude-3-5-haiku-20241022",
        max_tokens: 8192,
        context_window: 200_000,
        supports_images: false,
        supports_prompt_cache: true,
        input_price: 0.288,
        output_price: 1.44,
        cache_writes_price: 0.36,
        cache_reads_price: 0.0288,
    },
    ModelInfo {
        id: "claude-3-opus-20240229",
        max_tokens: 4096,
        context_window: 200_000,
        supports_images: true,
        supports_prompt_cache: true,
        input_price: 4.32,
        output_price: 21.60,
        cache_writes_price: 5.40,
        cache_reads_price: 0.432,
    },
    ModelInfo {
        id: "claude-3-haiku-20240307",
        max_tokens: 4096,
        context_window: 200_000,
        supports_images: true,
        supports_prompt_cache: true,
        input_price: 0.072,
        output_price: 0.36,
        cache_writes_price: 0.09,
        cache_reads_price: 0.0072,
    },
];

/// Look up a model by exact id.
#[must_use]
pub fn find(id: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.id == id)
}

/// Resolve a model selection, falling back to the default for missing or unknown ids.
#[must_use]
pub fn resolve(selected: Option<&str>) -> &'static ModelInfo {
    selected
        .and_then(find)
        .or_else(|| find(DEFAULT_MODEL_ID))
        .unwrap_or(&MODELS[0])
}

#[must_use]
pub fn supports_prompt_caching(model_id: &str) -> bool {
    PROMPT_CACHING_MODELS.contains(&model_id)
}
