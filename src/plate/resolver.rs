use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};

use crate::frame::{Frame, OCR_MIN_SIDE};
use crate::plate::cache::PlateCache;
use crate::plate::reader::PlateReader;
use crate::plate::registry::{RegistryClient, RegistryLookup};
use crate::plate::{best_plate, PlateMatch, MIN_PLATE_SCORE};
use crate::{Clock, Origin};

/// Turns a vehicle crop into a plate attribution.
///
/// Shared by every worker through an `Arc`; the cache is the only mutable
/// state and carries its own lock.
pub struct PlateResolver {
    reader: Arc<dyn PlateReader>,
    registry: Arc<dyn RegistryClient>,
    cache: PlateCache,
    clock: Arc<dyn Clock>,
}

impl PlateResolver {
    pub fn new(
        reader: Arc<dyn PlateReader>,
        registry: Arc<dyn RegistryClient>,
        cache_ttl_secs: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reader,
            registry,
            cache: PlateCache::new(cache_ttl_secs),
            clock,
        }
    }

    pub fn cache(&self) -> &PlateCache {
        &self.cache
    }

    /// Best plate text in the crop, upscaling small crops first.
    pub fn read_plate(&self, crop: &Frame) -> Option<(String, f64)> {
        if crop.width() == 0 || crop.height() == 0 {
            return None;
        }
        let input = crop.upscaled_to_min_side(OCR_MIN_SIDE);
        let candidates = match self.reader.read(&input) {
            Ok(candidates) => candidates,
            Err(err) => {
                debug!("plate: {} reader failed: {:#}", self.reader.name(), err);
                return None;
            }
        };
        best_plate(&candidates, MIN_PLATE_SCORE)
    }

    /// Read the plate and attach registry data. `None` when no plate is read.
    ///
    /// Registry failures degrade to "not found" and are cached like any other
    /// answer; the OCR score of this read is always the one reported.
    pub fn resolve(&self, crop: &Frame) -> Result<Option<PlateMatch>> {
        let Some((plate, score)) = self.read_plate(crop) else {
            return Ok(None);
        };
        let (lookup, cached) = self
            .cache
            .get_or_fetch(&plate, self.clock.as_ref(), || self.fetch(&plate))?;
        debug!(
            "plate: {} found={} ({})",
            plate,
            lookup.found,
            if cached { "cached" } else { "registry" }
        );
        Ok(Some(PlateMatch {
            source: if lookup.found {
                Origin::Etecnic
            } else {
                Origin::PlateOcr
            },
            plate,
            found: lookup.found,
            brand: lookup.brand,
            model: lookup.model,
            category: lookup.category,
            score,
        }))
    }

    fn fetch(&self, plate: &str) -> RegistryLookup {
        match self.registry.lookup_by_plate(plate) {
            Ok(payload) => {
                let lookup = RegistryLookup::from_payload(payload.as_ref());
                if lookup.found {
                    info!("plate: {} resolved by {}", plate, self.registry.name());
                }
                lookup
            }
            Err(err) => {
                debug!("plate: {} lookup for {} failed: {:#}", self.registry.name(), plate, err);
                RegistryLookup::not_found()
            }
        }
    }
}
