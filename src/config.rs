use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::api::DEFAULT_ZONE;
use crate::classify::ClassifierSettings;
use crate::detect::{DetectorSettings, DEFAULT_IMGSZ};
use crate::ingest::{rtsp_url_from_env, ReconnectPolicy};
use crate::plate::{
    HttpPlateReader, HttpRegistryClient, NullPlateReader, NullRegistryClient, PlateReader,
    PlateResolver, RegistryClient,
};
use crate::worker::WorkerSettings;
use crate::zone::Zone;
use crate::Clock;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OCR_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 1800;
const DEFAULT_DETECT_EVERY: u32 = 1;
const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 2;

#[derive(Debug, Deserialize, Default)]
struct EntrydConfigFile {
    api: Option<ApiConfigFile>,
    registry: Option<RegistryConfigFile>,
    ocr: Option<OcrConfigFile>,
    cache: Option<CacheConfigFile>,
    detector: Option<DetectorConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    sources: Option<Vec<SourceConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistryConfigFile {
    plate_url: Option<String>,
    bearer_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OcrConfigFile {
    url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CacheConfigFile {
    ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    detect_every: Option<u32>,
    weights: Option<PathBuf>,
    imgsz: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    image_encoder: Option<PathBuf>,
    text_embeddings: Option<PathBuf>,
    model_pairs: Option<Vec<(String, String)>>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    url: String,
    rois: Option<Vec<[f64; 4]>>,
}

#[derive(Debug, Clone)]
pub struct EntrydConfig {
    pub api_addr: String,
    pub registry: RegistrySettings,
    pub ocr_url: Option<String>,
    pub ocr_timeout: Duration,
    pub cache_ttl: Duration,
    pub detect_every: u32,
    pub detector: DetectorSettings,
    pub classifier: ClassifierSettings,
    pub reconnect_backoff: Duration,
    pub sources: Vec<SourceSettings>,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub plate_url: Option<String>,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
}

/// A source started when the daemon boots.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub url: String,
    pub zones: Vec<Zone>,
}

impl EntrydConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ENTRY_CONFIG").ok().filter(|p| !p.trim().is_empty());
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EntrydConfigFile) -> Result<Self> {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let registry_file = file.registry.unwrap_or_default();
        let registry = RegistrySettings {
            plate_url: registry_file.plate_url,
            bearer_token: registry_file.bearer_token,
            timeout: Duration::from_secs(
                registry_file
                    .timeout_secs
                    .unwrap_or(DEFAULT_REGISTRY_TIMEOUT_SECS),
            ),
        };
        let ocr_file = file.ocr.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let classifier_file = file.classifier.unwrap_or_default();
        let model_pairs_json = match classifier_file.model_pairs {
            Some(pairs) => Some(serde_json::to_string(&pairs)?),
            None => None,
        };

        let mut sources = Vec::new();
        for (i, source) in file.sources.unwrap_or_default().into_iter().enumerate() {
            let zones = match source.rois {
                Some(rois) => rois
                    .iter()
                    .map(|[x0, y0, x1, y1]| Zone::clamped(*x0, *y0, *x1, *y1))
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| anyhow!("sources[{}]: invalid rois: {}", i, e))?,
                None => vec![default_zone()?],
            };
            sources.push(SourceSettings {
                url: source.url,
                zones,
            });
        }

        Ok(Self {
            api_addr,
            registry,
            ocr_url: ocr_file.url,
            ocr_timeout: Duration::from_millis(ocr_file.timeout_ms.unwrap_or(DEFAULT_OCR_TIMEOUT_MS)),
            cache_ttl: Duration::from_secs(
                file.cache
                    .and_then(|cache| cache.ttl_secs)
                    .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
            detect_every: detector_file.detect_every.unwrap_or(DEFAULT_DETECT_EVERY),
            detector: DetectorSettings {
                weights: detector_file.weights,
                imgsz: detector_file.imgsz.unwrap_or(DEFAULT_IMGSZ),
            },
            classifier: ClassifierSettings {
                image_encoder: classifier_file.image_encoder,
                text_embeddings: classifier_file.text_embeddings,
                model_pairs_json,
            },
            reconnect_backoff: Duration::from_secs(
                file.reconnect
                    .and_then(|reconnect| reconnect.backoff_secs)
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_SECS),
            ),
            sources,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("ENTRY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_string("ETECNIC_PLATE_URL") {
            self.registry.plate_url = Some(url);
        }
        if let Some(token) = env_string("ETECNIC_BEARER_TOKEN") {
            self.registry.bearer_token = Some(token);
        }
        if let Some(secs) = env_number::<u64>("ETECNIC_TIMEOUT")? {
            self.registry.timeout = Duration::from_secs(secs);
        }
        if let Some(url) = env_string("PLATE_OCR_URL") {
            self.ocr_url = Some(url);
        }
        if let Some(ms) = env_number::<u64>("PLATE_OCR_TIMEOUT_MS")? {
            self.ocr_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_number::<u64>("PLATE_CACHE_TTL")? {
            self.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(every) = env_number::<u32>("DETECT_EVERY")? {
            self.detect_every = every;
        }
        if let Some(weights) = env_string("YOLO_WEIGHTS") {
            self.detector.weights = Some(PathBuf::from(weights));
        }
        if let Some(imgsz) = env_number::<u32>("YOLO_IMGSZ")? {
            self.detector.imgsz = imgsz;
        }
        if let Some(path) = env_string("CLIP_IMAGE_ENCODER") {
            self.classifier.image_encoder = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("CLIP_TEXT_EMBEDDINGS") {
            self.classifier.text_embeddings = Some(PathBuf::from(path));
        }
        if let Some(json) = env_string("CAR_PROMPTS_JSON") {
            self.classifier.model_pairs_json = Some(json);
        }
        if self.sources.is_empty() && env_string("CAMERA_HOST").is_some() {
            self.sources.push(SourceSettings {
                url: rtsp_url_from_env()?,
                zones: vec![default_zone()?],
            });
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' is not a socket address", self.api_addr))?;
        if self.cache_ttl.as_secs() == 0 {
            return Err(anyhow!("plate cache ttl must be greater than zero"));
        }
        if self.detect_every == 0 {
            return Err(anyhow!("detect_every must be at least 1"));
        }
        if self.detector.imgsz == 0 || self.detector.imgsz % 32 != 0 {
            return Err(anyhow!("detector imgsz must be a positive multiple of 32"));
        }
        if self.reconnect_backoff.as_secs() < 1 {
            return Err(anyhow!("reconnect backoff must be at least 1 second"));
        }
        if self.registry.timeout.as_secs() == 0 {
            return Err(anyhow!("registry timeout must be greater than zero"));
        }
        if self.ocr_timeout.is_zero() {
            return Err(anyhow!("ocr timeout must be greater than zero"));
        }
        if let Some(json) = &self.classifier.model_pairs_json {
            crate::classify::parse_model_pairs(json)
                .map_err(|e| anyhow!("invalid model pairs: {}", e))?;
        }
        for source in &self.sources {
            if source.url.trim().is_empty() {
                return Err(anyhow!("source url must not be empty"));
            }
        }
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            detect_every: self.detect_every,
            reconnect: ReconnectPolicy {
                reconnect_backoff: self.reconnect_backoff,
                ..ReconnectPolicy::default()
            },
            ..WorkerSettings::default()
        }
    }

    /// Plate resolver over the configured OCR service and registry. Missing
    /// endpoints degrade to readers/clients that never find anything.
    pub fn plate_resolver(&self, clock: Arc<dyn Clock>) -> Result<PlateResolver> {
        let reader: Arc<dyn PlateReader> = match &self.ocr_url {
            Some(url) => Arc::new(HttpPlateReader::new(url.clone(), self.ocr_timeout)),
            None => {
                log::warn!("PLATE_OCR_URL not set; plates will not be read");
                Arc::new(NullPlateReader)
            }
        };
        let registry: Arc<dyn RegistryClient> = match &self.registry.plate_url {
            Some(url) => Arc::new(HttpRegistryClient::new(
                url,
                self.registry.bearer_token.clone(),
                self.registry.timeout,
            )?),
            None => {
                log::warn!("ETECNIC_PLATE_URL not set; every plate resolves as not found");
                Arc::new(NullRegistryClient)
            }
        };
        Ok(PlateResolver::new(
            reader,
            registry,
            self.cache_ttl.as_secs_f64(),
            clock,
        ))
    }
}

fn default_zone() -> Result<Zone> {
    let [x0, y0, x1, y1] = DEFAULT_ZONE;
    Zone::new(x0, y0, x1, y1)
}

fn read_config_file(path: &Path) -> Result<EntrydConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// Non-empty, trimmed value of an environment variable.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
        None => Ok(None),
    }
}
