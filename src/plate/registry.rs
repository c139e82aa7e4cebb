//! Vehicle registry client and payload interpretation.
//!
//! The registry answers a plate with loosely structured JSON. Vehicle data
//! can sit under `vehicle_info`, `vehicle`, an `info` list, or a top-level
//! list, and field names vary between deployments; `extract_vehicle_info`
//! walks those shapes and picks the first non-empty value of each field.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde_json::{Map, Value};
use url::Url;

use crate::Category;

const BRAND_KEYS: &[&str] = &["vehicle_brand", "vehicle_brand_name", "brand", "marca"];
const MODEL_KEYS: &[&str] = &["vehicle_model", "vehicle_model_name", "model", "modelo"];
const CATEGORY_KEYS: &[&str] = &[
    "vehicle_type",
    "vehicle_type_name",
    "type_vehicle",
    "type",
    "tipo_vehiculo",
    "tipo_tecnologia",
    "technology",
];

pub trait RegistryClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw registry payload for a normalized plate; `None` when unknown.
    fn lookup_by_plate(&self, plate: &str) -> Result<Option<Value>>;
}

/// Registry stand-in when none is configured: every plate is unknown.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRegistryClient;

impl RegistryClient for NullRegistryClient {
    fn name(&self) -> &'static str {
        "null"
    }

    fn lookup_by_plate(&self, _plate: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// `GET {plate_url}/{PLATE}` with a bearer token.
pub struct HttpRegistryClient {
    plate_url: Url,
    bearer_token: Option<String>,
    agent: ureq::Agent,
}

impl HttpRegistryClient {
    pub fn new(plate_url: &str, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let plate_url = Url::parse(plate_url).context("parse registry plate url")?;
        if plate_url.cannot_be_a_base() {
            return Err(anyhow!("registry plate url cannot take path segments"));
        }
        Ok(Self {
            plate_url,
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        })
    }

    /// Lookup URL with the plate appended as a percent-encoded path segment.
    pub fn plate_endpoint(&self, plate: &str) -> Result<Url> {
        let mut url = self.plate_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("registry plate url cannot take path segments"))?
            .pop_if_empty()
            .push(plate);
        Ok(url)
    }
}

impl RegistryClient for HttpRegistryClient {
    fn name(&self) -> &'static str {
        "etecnic"
    }

    fn lookup_by_plate(&self, plate: &str) -> Result<Option<Value>> {
        let url = self.plate_endpoint(plate)?;
        let mut request = self.agent.get(url.as_str()).set("Accept", "application/json");
        if let Some(token) = &self.bearer_token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => {
                debug!("registry: plate {} not found", plate);
                return Ok(None);
            }
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("registry returned HTTP {}", code));
            }
            Err(err) => return Err(anyhow!("registry request failed: {}", err)),
        };
        let body = response.into_string().context("read registry response")?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let payload = serde_json::from_str(&body).context("registry response is not JSON")?;
        Ok(Some(payload))
    }
}

/// Raw vehicle fields pulled out of a registry payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VehicleInfo {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
}

/// Cached interpretation of a registry answer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryLookup {
    pub found: bool,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub category: Option<Category>,
}

impl RegistryLookup {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn from_payload(payload: Option<&Value>) -> Self {
        match payload.and_then(extract_vehicle_info) {
            Some(info) => Self {
                found: true,
                brand: sanitize(info.brand),
                model: sanitize(info.model),
                category: normalize_category(info.category.as_deref()),
            },
            None => Self::not_found(),
        }
    }
}

/// Locate the vehicle record in a registry payload.
///
/// Any non-empty object that does not nest a known wrapper counts as a
/// record, even when none of the known fields are present.
pub fn extract_vehicle_info(data: &Value) -> Option<VehicleInfo> {
    if !is_truthy(data) {
        return None;
    }
    match data {
        Value::Object(map) => {
            if let Some(inner) = map.get("vehicle_info") {
                return extract_vehicle_info(inner);
            }
            if let Some(inner) = map.get("vehicle") {
                return extract_vehicle_info(inner);
            }
            if let Some(Value::Array(items)) = map.get("info") {
                if let Some(info) = items.iter().find_map(extract_vehicle_info) {
                    return Some(info);
                }
            }
            Some(VehicleInfo {
                brand: first_truthy(map, BRAND_KEYS),
                model: first_truthy(map, MODEL_KEYS),
                category: first_truthy(map, CATEGORY_KEYS),
            })
        }
        Value::Array(items) => items.iter().find_map(extract_vehicle_info),
        _ => None,
    }
}

/// Map a free-form registry category onto EV / PHEV.
///
/// Plug-in markers are checked before electric ones ("plug-in electric" is
/// a PHEV); plain hybrids are folded into PHEV.
pub fn normalize_category(raw: Option<&str>) -> Option<Category> {
    let value = raw?.to_lowercase();
    if value.is_empty() {
        return None;
    }
    let has = |tokens: &[&str]| tokens.iter().any(|t| value.contains(t));
    if has(&["phev", "enchuf", "plug-in", "plug in"]) {
        return Some(Category::Phev);
    }
    if has(&["bev", "eléctr", "electr", "ev"]) {
        return Some(Category::Ev);
    }
    if has(&["hybrid", "híbrido"]) {
        return Some(Category::Phev);
    }
    None
}

fn sanitize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn first_truthy(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| is_truthy(v))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
