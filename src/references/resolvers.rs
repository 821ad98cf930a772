//! Built-in resolvers.

use super::registry::StopPlaceRegistry;
use super::resolver::ReferenceResolver;
use crate::ids::types::IdVersion;

use regex::Regex;
use std::sync::{Arc, LazyLock};

static JOURNEY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(ServiceJourney|DeadRun|VehicleJourney):").expect("valid regex"));

/// Journeys listed inside a `Block` usually live in another dataset.
pub struct BlockJourneyIgnorer;

impl BlockJourneyIgnorer {
    const ELEMENTS: [&'static str; 3] = ["ServiceJourneyRef", "DeadRunRef", "VehicleJourneyRef"];

    pub fn new() -> Self {
        Self
    }
}

impl Default for BlockJourneyIgnorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceResolver for BlockJourneyIgnorer {
    fn name(&self) -> &str {
        "block-journeys"
    }

    fn vouches_for(&self, reference: &IdVersion) -> bool {
        Self::ELEMENTS.contains(&reference.element_name.as_str())
            && reference.has_parent("Block")
            && JOURNEY_ID.is_match(&reference.id)
    }
}

/// The feeder/distributor side of an interchange may belong to another operator.
pub struct InterchangeIgnorer;

impl InterchangeIgnorer {
    const ELEMENTS: [&'static str; 2] = ["FromJourneyRef", "ToJourneyRef"];

    pub fn new() -> Self {
        Self
    }
}

impl Default for InterchangeIgnorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceResolver for InterchangeIgnorer {
    fn name(&self) -> &str {
        "interchange-journeys"
    }

    fn vouches_for(&self, reference: &IdVersion) -> bool {
        Self::ELEMENTS.contains(&reference.element_name.as_str())
            && reference.has_parent("ServiceJourneyInterchange")
    }
}

/// Rolling stock elements are defined by a national registry under a fixed codespace.
pub struct RollingStockResolver {
    prefix: String,
}

impl RollingStockResolver {
    const ELEMENTS: [&'static str; 4] = [
        "VehicleTypeRef",
        "DeckPlanRef",
        "VehicleRef",
        "VehicleModelRef",
    ];

    pub fn new(codespace: &str) -> Self {
        Self {
            prefix: format!("{}:", codespace),
        }
    }
}

impl ReferenceResolver for RollingStockResolver {
    fn name(&self) -> &str {
        "rolling-stock"
    }

    fn vouches_for(&self, reference: &IdVersion) -> bool {
        Self::ELEMENTS.contains(&reference.element_name.as_str())
            && reference.id.starts_with(&self.prefix)
    }
}

/// Checks stop place and quay references against the loaded registry snapshot.
pub struct StopPlaceRegistryResolver {
    registry: Arc<StopPlaceRegistry>,
}

impl StopPlaceRegistryResolver {
    pub fn new(registry: Arc<StopPlaceRegistry>) -> Self {
        Self { registry }
    }
}

impl ReferenceResolver for StopPlaceRegistryResolver {
    fn name(&self) -> &str {
        "stop-place-registry"
    }

    fn vouches_for(&self, reference: &IdVersion) -> bool {
        match reference.element_name.as_str() {
            "QuayRef" => self.registry.has_quay(&reference.id),
            "StopPlaceRef" => self.registry.has_stop_place(&reference.id),
            _ => false,
        }
    }
}
