use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    MappingProvider,
    BookingProvider,
    ReviewSite,
    UserInput,
    LlmGenerated,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MappingProvider => "mapping_provider",
            Self::BookingProvider => "booking_provider",
            Self::ReviewSite => "review_site",
            Self::UserInput => "user_input",
            Self::LlmGenerated => "llm_generated",
        }
    }

    /// Fixed authority table callers use when stamping candidates.
    pub fn default_authority(&self) -> f64 {
        match self {
            Self::MappingProvider => 0.95,
            Self::BookingProvider => 0.85,
            Self::ReviewSite => 0.7,
            Self::UserInput => 0.6,
            Self::LlmGenerated => 0.3,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A single observation of a place from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCandidate {
    pub source_type: SourceType,
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    pub authority: f64,
}

impl PlaceCandidate {
    pub fn new(source_type: SourceType, source_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
            name: name.into(),
            coordinates: None,
            address: None,
            category: None,
            types: Vec::new(),
            rating: None,
            authority: source_type.default_authority(),
        }
    }

    pub fn at(mut self, lat: f64, lng: f64) -> Self {
        self.coordinates = Some(Coordinates::new(lat, lng));
        self
    }

    pub fn source_key(&self) -> String {
        format!("{}:{}", self.source_type, self.source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceSource {
    pub source_type: SourceType,
    pub source_id: String,
    pub authority: f64,
    /// Position this source last reported, kept to measure source disagreement.
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    pub observed_at: DateTime<Utc>,
}

impl PlaceSource {
    pub fn source_key(&self) -> String {
        format!("{}:{}", self.source_type, self.source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPlace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alt_names: BTreeSet<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    /// Accumulated authority behind `coordinates`.
    #[serde(default)]
    pub coordinate_weight: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub alt_addresses: BTreeSet<String>,
    #[serde(default)]
    pub sources: Vec<PlaceSource>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub types: BTreeSet<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub rating_weight: f64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl CanonicalPlace {
    pub fn has_source(&self, source_key: &str) -> bool {
        self.sources.iter().any(|s| s.source_key() == source_key)
    }

    pub fn known_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.alt_names.iter().map(String::as_str))
    }
}
