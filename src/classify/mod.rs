//! Visual vehicle classification.
//!
//! Used when the registry cannot attribute a vehicle. The classifier embeds
//! the vehicle crop and compares it against precomputed prompt embeddings:
//! two category prompts (EV / plug-in hybrid) and one prompt per known
//! brand/model pair. When its resources are missing it degrades to
//! [`UnavailableClassifier`], which always answers `indeterminado`.

mod encoder;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};

use crate::frame::Frame;
use crate::{round_score, Category};

pub use encoder::ImageEncoder;
#[cfg(feature = "backend-tract")]
pub use encoder::TractImageEncoder;

pub const EV_PROMPT: &str = "a photo of an electric vehicle";
pub const PHEV_PROMPT: &str = "a photo of a plug-in hybrid vehicle";

const MODEL_WEIGHT: f64 = 0.6;
const CATEGORY_WEIGHT: f64 = 0.4;

/// Brand/model pairs used when `CAR_PROMPTS_JSON` is not set.
pub const DEFAULT_MODEL_PAIRS: &[(&str, &str)] = &[
    ("Tesla", "Model 3"),
    ("Tesla", "Model Y"),
    ("Kia", "EV6"),
    ("BMW", "330e"),
    ("BYD", "Dolphin"),
    ("Hyundai", "Ioniq 5"),
    ("Renault", "Megane E-Tech"),
];

/// Classifier verdict for one crop.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub score: f64,
    pub brand: Option<String>,
    pub model: Option<String>,
}

impl Classification {
    pub fn unavailable() -> Self {
        Self {
            category: Category::Indeterminado,
            score: 0.0,
            brand: None,
            model: None,
        }
    }
}

pub trait VisualClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Never fails; internal errors produce [`Classification::unavailable`].
    fn classify(&self, crop: &Frame) -> Classification;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableClassifier;

impl VisualClassifier for UnavailableClassifier {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn classify(&self, _crop: &Frame) -> Classification {
        Classification::unavailable()
    }
}

pub fn model_prompt(brand: &str, model: &str) -> String {
    format!("a photo of a {} {}", brand, model)
}

/// Parse `[["Brand", "Model"], ...]`.
pub fn parse_model_pairs(json: &str) -> Result<Vec<(String, String)>> {
    let pairs: Vec<(String, String)> =
        serde_json::from_str(json).context("model prompts must be [[brand, model], ...]")?;
    if pairs.is_empty() {
        return Err(anyhow!("model prompt list is empty"));
    }
    Ok(pairs)
}

pub fn default_model_pairs() -> Vec<(String, String)> {
    DEFAULT_MODEL_PAIRS
        .iter()
        .map(|(b, m)| (b.to_string(), m.to_string()))
        .collect()
}

/// Prompt → embedding table, stored as a JSON object of float arrays.
pub fn load_text_embeddings(path: &Path) -> Result<HashMap<String, Vec<f32>>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read text embeddings {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parse text embeddings {}", path.display()))
}

/// Zero-shot classifier over prompt embeddings.
pub struct PromptClassifier {
    encoder: Box<dyn ImageEncoder>,
    pairs: Vec<(String, String)>,
    model_embeds: Vec<Vec<f32>>,
    category_embeds: [Vec<f32>; 2],
}

impl PromptClassifier {
    /// Every prompt must have an embedding of the encoder's dimension.
    pub fn new(
        encoder: Box<dyn ImageEncoder>,
        pairs: Vec<(String, String)>,
        embeddings: &HashMap<String, Vec<f32>>,
    ) -> Result<Self> {
        let lookup = |prompt: &str| -> Result<Vec<f32>> {
            let embed = embeddings
                .get(prompt)
                .ok_or_else(|| anyhow!("no text embedding for prompt '{}'", prompt))?;
            if embed.len() != encoder.dimension() {
                return Err(anyhow!(
                    "embedding for '{}' has {} dims, encoder produces {}",
                    prompt,
                    embed.len(),
                    encoder.dimension()
                ));
            }
            Ok(l2_normalized(embed))
        };
        let model_embeds = pairs
            .iter()
            .map(|(b, m)| lookup(&model_prompt(b, m)))
            .collect::<Result<Vec<_>>>()?;
        let category_embeds = [lookup(EV_PROMPT)?, lookup(PHEV_PROMPT)?];
        Ok(Self {
            encoder,
            pairs,
            model_embeds,
            category_embeds,
        })
    }

    fn try_classify(&self, crop: &Frame) -> Result<Classification> {
        let image = l2_normalized(&self.encoder.encode(crop)?);
        let (mi, model_sim) = argmax(self.model_embeds.iter().map(|t| dot(&image, t)))
            .ok_or_else(|| anyhow!("no model prompts"))?;
        let (ci, category_sim) = argmax(self.category_embeds.iter().map(|t| dot(&image, t)))
            .ok_or_else(|| anyhow!("no category prompts"))?;
        let (brand, model) = self.pairs[mi].clone();
        Ok(Classification {
            category: if ci == 0 { Category::Ev } else { Category::Phev },
            score: round_score(MODEL_WEIGHT * model_sim + CATEGORY_WEIGHT * category_sim),
            brand: Some(brand),
            model: Some(model),
        })
    }
}

impl VisualClassifier for PromptClassifier {
    fn name(&self) -> &'static str {
        "prompt"
    }

    fn classify(&self, crop: &Frame) -> Classification {
        self.try_classify(crop).unwrap_or_else(|err| {
            debug!("classifier: {:#}", err);
            Classification::unavailable()
        })
    }
}

/// Where the classifier's resources live.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifierSettings {
    pub image_encoder: Option<PathBuf>,
    pub text_embeddings: Option<PathBuf>,
    /// `CAR_PROMPTS_JSON` override of the brand/model list.
    pub model_pairs_json: Option<String>,
}

/// Build the configured classifier, degrading to [`UnavailableClassifier`].
pub fn classifier_from_settings(settings: &ClassifierSettings) -> Arc<dyn VisualClassifier> {
    match try_build(settings) {
        Ok(Some(classifier)) => {
            info!("classifier: prompt classifier ready");
            classifier
        }
        Ok(None) => {
            info!("classifier: resources not configured, visual fallback disabled");
            Arc::new(UnavailableClassifier)
        }
        Err(err) => {
            warn!("classifier: disabled: {:#}", err);
            Arc::new(UnavailableClassifier)
        }
    }
}

fn try_build(settings: &ClassifierSettings) -> Result<Option<Arc<dyn VisualClassifier>>> {
    let (Some(encoder_path), Some(embeddings_path)) =
        (settings.image_encoder.as_ref(), settings.text_embeddings.as_ref())
    else {
        return Ok(None);
    };
    let pairs = match settings.model_pairs_json.as_deref() {
        Some(json) if !json.trim().is_empty() => parse_model_pairs(json)?,
        _ => default_model_pairs(),
    };
    let embeddings = load_text_embeddings(embeddings_path)?;
    let encoder = encoder::load_image_encoder(encoder_path)?;
    Ok(Some(Arc::new(PromptClassifier::new(encoder, pairs, &embeddings)?)))
}

fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt() + 1e-9;
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

/// Index and value of the maximum; the first one wins ties.
fn argmax(values: impl Iterator<Item = f64>) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.enumerate() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder(Vec<f32>);

    impl ImageEncoder for FixedEncoder {
        fn dimension(&self) -> usize {
            self.0.len()
        }

        fn encode(&self, _image: &Frame) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn embeddings() -> HashMap<String, Vec<f32>> {
        HashMap::from([
            (model_prompt("Tesla", "Model 3"), vec![1.0, 0.0, 0.0]),
            (model_prompt("Kia", "EV6"), vec![0.0, 1.0, 0.0]),
            (EV_PROMPT.to_string(), vec![0.6, 0.8, 0.0]),
            (PHEV_PROMPT.to_string(), vec![0.0, 0.0, 1.0]),
        ])
    }

    fn pairs() -> Vec<(String, String)> {
        vec![
            ("Tesla".to_string(), "Model 3".to_string()),
            ("Kia".to_string(), "EV6".to_string()),
        ]
    }

    #[test]
    fn blends_model_and_category_similarity() -> Result<()> {
        let classifier = PromptClassifier::new(
            Box::new(FixedEncoder(vec![2.0, 0.0, 0.0])),
            pairs(),
            &embeddings(),
        )?;
        let verdict = classifier.classify(&Frame::filled(32, 32, [0, 0, 0]));
        assert_eq!(verdict.category, Category::Ev);
        assert_eq!(verdict.brand.as_deref(), Some("Tesla"));
        assert_eq!(verdict.model.as_deref(), Some("Model 3"));
        assert_eq!(verdict.score, 0.84);
        Ok(())
    }

    #[test]
    fn phev_prompt_can_win() -> Result<()> {
        let classifier = PromptClassifier::new(
            Box::new(FixedEncoder(vec![0.0, 0.6, 0.8])),
            pairs(),
            &embeddings(),
        )?;
        let verdict = classifier.classify(&Frame::filled(32, 32, [0, 0, 0]));
        assert_eq!(verdict.category, Category::Phev);
        assert_eq!(verdict.brand.as_deref(), Some("Kia"));
        assert_eq!(verdict.score, 0.68);
        Ok(())
    }

    #[test]
    fn missing_prompt_embedding_is_rejected() {
        let mut partial = embeddings();
        partial.remove(PHEV_PROMPT);
        assert!(PromptClassifier::new(Box::new(FixedEncoder(vec![1.0, 0.0, 0.0])), pairs(), &partial).is_err());
        assert!(PromptClassifier::new(Box::new(FixedEncoder(vec![1.0, 0.0])), pairs(), &embeddings()).is_err());
    }

    #[test]
    fn unconfigured_settings_disable_classifier() {
        let classifier = classifier_from_settings(&ClassifierSettings::default());
        assert_eq!(classifier.name(), "unavailable");
        assert_eq!(
            classifier.classify(&Frame::filled(8, 8, [0, 0, 0])),
            Classification::unavailable()
        );
    }

    #[test]
    fn model_pairs_parse_and_default() {
        let pairs = parse_model_pairs(r#"[["Nissan","Leaf"],["MG","4"]]"#).unwrap();
        assert_eq!(pairs[1], ("MG".to_string(), "4".to_string()));
        assert!(parse_model_pairs("[]").is_err());
        assert!(parse_model_pairs(r#"[["solo"]]"#).is_err());
        assert_eq!(default_model_pairs().len(), 7);
        assert_eq!(model_prompt("BYD", "Dolphin"), "a photo of a BYD Dolphin");
    }
}
