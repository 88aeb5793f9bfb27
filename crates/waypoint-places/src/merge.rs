//! Pure merge math for canonical places.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use waypoint_schema::{CanonicalPlace, Coordinates, PlaceCandidate, PlaceSource};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// `place_` followed by the first 16 hex chars of SHA-256 over the first source key.
pub fn stable_place_id(source_key: &str) -> String {
    let digest = Sha256::digest(source_key.as_bytes());
    format!("place_{}", &hex::encode(digest)[..16])
}

/// Great-circle distance in metres.
pub fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Fold a longitude (or longitude delta) into `[-180, 180]`.
fn wrap_lng(lng: f64) -> f64 {
    let wrapped = (lng + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lng > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Largest distance between the canonical position and any source's last report.
pub fn source_spread_m(place: &CanonicalPlace) -> f64 {
    let Some(center) = place.coordinates else {
        return 0.0;
    };
    place
        .sources
        .iter()
        .filter_map(|s| s.coordinates)
        .map(|c| haversine_m(center, c))
        .fold(0.0, f64::max)
}

/// Lowercased alphanumerics with single spaces between words.
pub fn normalize_name(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn names_match(place: &CanonicalPlace, name: &str) -> bool {
    let wanted = normalize_name(name);
    !wanted.is_empty() && place.known_names().any(|n| normalize_name(n) == wanted)
}

pub fn validate_candidate(candidate: &PlaceCandidate) -> Result<(), String> {
    if candidate.source_id.trim().is_empty() {
        return Err("source id is empty".into());
    }
    if candidate.name.trim().is_empty() {
        return Err("name is empty".into());
    }
    if !candidate.authority.is_finite() || candidate.authority <= 0.0 || candidate.authority > 1.0 {
        return Err(format!(
            "authority {} outside (0.0, 1.0]",
            candidate.authority
        ));
    }
    if let Some(coords) = candidate.coordinates {
        if !coords.is_valid() {
            return Err(format!(
                "coordinates ({}, {}) out of range",
                coords.lat, coords.lng
            ));
        }
    }
    if let Some(rating) = candidate.rating {
        if !rating.is_finite() || rating < 0.0 {
            return Err(format!("rating {rating} is not a non-negative number"));
        }
    }
    Ok(())
}

pub fn new_place(candidate: &PlaceCandidate, now: DateTime<Utc>) -> CanonicalPlace {
    let mut place = CanonicalPlace {
        id: stable_place_id(&candidate.source_key()),
        name: candidate.name.trim().to_string(),
        alt_names: Default::default(),
        coordinates: None,
        coordinate_weight: 0.0,
        address: None,
        alt_addresses: Default::default(),
        sources: Vec::new(),
        category: None,
        types: Default::default(),
        rating: None,
        rating_weight: 0.0,
        confidence: 1.0,
        created_at: now,
        last_updated: now,
    };
    merge_candidate(&mut place, candidate, now);
    place
}

/// Fold one observation into `place`.
///
/// Coordinates and rating move toward the candidate by
/// `w = authority / (authority + accumulated_authority)`; names, addresses and
/// types accumulate as sets.
pub fn merge_candidate(place: &mut CanonicalPlace, candidate: &PlaceCandidate, now: DateTime<Utc>) {
    let authority = candidate.authority;

    if let Some(observed) = candidate.coordinates {
        place.coordinates = Some(match place.coordinates {
            Some(current) => {
                let w = authority / (authority + place.coordinate_weight);
                Coordinates::new(
                    current.lat * (1.0 - w) + observed.lat * w,
                    wrap_lng(current.lng + wrap_lng(observed.lng - current.lng) * w),
                )
            }
            None => observed,
        });
        place.coordinate_weight += authority;
    }

    if let Some(observed) = candidate.rating {
        place.rating = Some(match place.rating {
            Some(current) => {
                let w = authority / (authority + place.rating_weight);
                current * (1.0 - w) + observed * w
            }
            None => observed,
        });
        place.rating_weight += authority;
    }

    let name = candidate.name.trim();
    if normalize_name(name) != normalize_name(&place.name) {
        place.alt_names.insert(name.to_string());
    }

    if let Some(address) = candidate.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        match &place.address {
            None => place.address = Some(address.to_string()),
            Some(primary) if primary != address => {
                place.alt_addresses.insert(address.to_string());
            }
            Some(_) => {}
        }
    }

    if place.category.is_none() {
        place.category = candidate.category.clone();
    }
    place.types.extend(candidate.types.iter().cloned());

    let source = PlaceSource {
        source_type: candidate.source_type,
        source_id: candidate.source_id.clone(),
        authority,
        coordinates: candidate.coordinates,
        observed_at: now,
    };
    let key = candidate.source_key();
    match place.sources.iter_mut().find(|s| s.source_key() == key) {
        Some(existing) => *existing = source,
        None => place.sources.push(source),
    }

    place.last_updated = now;
}
