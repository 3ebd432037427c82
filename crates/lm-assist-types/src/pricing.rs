use crate::usage::TokenUsage;

/// Model family for pricing, matched in precedence order so that a newer
/// family id never falls through to a legacy rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Opus45,
    OpusLegacy,
    Haiku45,
    Haiku35,
    Haiku3,
    Sonnet,
}

/// Per-million-token USD rates.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_creation: f64,
}

impl ModelFamily {
    /// Classify a model id. Families with versioned ids are checked before
    /// their bare-name fallbacks.
    pub fn from_model_id(model: &str) -> Self {
        let id = model.to_lowercase();

        if id.contains("opus-4-5")
            || id.contains("opus-4.5")
            || id.contains("opus-4-6")
            || id.contains("opus-4.6")
        {
            return ModelFamily::Opus45;
        }
        if id.contains("opus") {
            return ModelFamily::OpusLegacy;
        }
        if id.contains("haiku-4-5") || id.contains("haiku-4.5") {
            return ModelFamily::Haiku45;
        }
        if id.contains("haiku-3-5")
            || id.contains("haiku-3.5")
            || id.contains("3-5-haiku")
            || id.contains("3.5-haiku")
        {
            return ModelFamily::Haiku35;
        }
        if id.contains("haiku") {
            return ModelFamily::Haiku3;
        }
        ModelFamily::Sonnet
    }

    pub fn pricing(&self) -> ModelPricing {
        match self {
            ModelFamily::Opus45 => ModelPricing {
                input: 5.0,
                output: 25.0,
                cache_read: 0.5,
                cache_creation: 6.25,
            },
            ModelFamily::OpusLegacy => ModelPricing {
                input: 15.0,
                output: 75.0,
                cache_read: 1.5,
                cache_creation: 18.75,
            },
            ModelFamily::Haiku45 => ModelPricing {
                input: 1.0,
                output: 5.0,
                cache_read: 0.1,
                cache_creation: 1.25,
            },
            ModelFamily::Haiku35 => ModelPricing {
                input: 0.8,
                output: 4.0,
                cache_read: 0.08,
                cache_creation: 1.0,
            },
            ModelFamily::Haiku3 => ModelPricing {
                input: 0.25,
                output: 1.25,
                cache_read: 0.03,
                cache_creation: 0.30,
            },
            ModelFamily::Sonnet => ModelPricing {
                input: 3.0,
                output: 15.0,
                cache_read: 0.3,
                cache_creation: 3.75,
            },
        }
    }
}

/// Estimate the USD cost of a usage block; used when no `result` record
/// carried an authoritative `total_cost_usd`.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let rates = ModelFamily::from_model_id(model).pricing();
    let per_million = 1_000_000.0;

    usage.input_tokens as f64 * rates.input / per_million
        + usage.output_tokens as f64 * rates.output / per_million
        + usage.cache_read_input_tokens as f64 * rates.cache_read / per_million
        + usage.cache_creation_input_tokens as f64 * rates.cache_creation / per_million
}
