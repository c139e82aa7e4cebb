use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::frame::Frame;

/// One OCR text line with its recognition score.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateCandidate {
    pub text: String,
    pub score: f64,
}

/// Plate OCR capability. Shared by every worker.
pub trait PlateReader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Text candidates found in a vehicle crop, in reader order.
    fn read(&self, crop: &Frame) -> Result<Vec<PlateCandidate>>;
}

/// Reader used when no OCR service is configured. Finds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPlateReader;

impl PlateReader for NullPlateReader {
    fn name(&self) -> &'static str {
        "null"
    }

    fn read(&self, _crop: &Frame) -> Result<Vec<PlateCandidate>> {
        Ok(Vec::new())
    }
}

const OCR_JPEG_QUALITY: u8 = 95;

/// OCR sidecar over HTTP.
///
/// POSTs the crop as `image/jpeg` and expects
/// `{"rec_texts": [...], "rec_scores": [...]}`, or a list of such objects.
pub struct HttpPlateReader {
    url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Default, Deserialize)]
struct OcrResult {
    #[serde(default)]
    rec_texts: Vec<String>,
    #[serde(default)]
    rec_scores: Vec<f64>,
}

impl HttpPlateReader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl PlateReader for HttpPlateReader {
    fn name(&self) -> &'static str {
        "http-ocr"
    }

    fn read(&self, crop: &Frame) -> Result<Vec<PlateCandidate>> {
        let jpeg = crop.encode_jpeg(OCR_JPEG_QUALITY)?;
        let body = self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .map_err(|err| anyhow!("ocr request failed: {}", err))?
            .into_string()
            .context("read ocr response")?;
        parse_ocr_response(&body)
    }
}

/// Flatten an OCR response into candidates, pairing texts with scores.
pub fn parse_ocr_response(body: &str) -> Result<Vec<PlateCandidate>> {
    let value: Value = serde_json::from_str(body).context("ocr response is not JSON")?;
    let results: Vec<OcrResult> = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()
            .context("malformed ocr result")?,
        Value::Object(_) => vec![serde_json::from_value(value).context("malformed ocr result")?],
        Value::Null => Vec::new(),
        other => return Err(anyhow!("unexpected ocr response: {}", other)),
    };
    Ok(results
        .into_iter()
        .flat_map(|r| {
            r.rec_texts
                .into_iter()
                .zip(r.rec_scores)
                .map(|(text, score)| PlateCandidate { text, score })
        })
        .collect())
}
