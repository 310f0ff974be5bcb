// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Resolution of opaque place identifiers into canonical place records.
//!
//! The newer v2 endpoint is tried first; when it answers empty or without
//! coordinates we fall back to the older endpoint, whose response embeds
//! coordinates as URL-encoded query parameters inside either a `pic` image
//! reference or, failing that, a `scheme` deep link. A deleted place is a
//! clean "not found", never an error, and writes nothing.
//!
//! Places don't move: every resolution is cached permanently, in memory and
//! in the `places` table, so a second resolve of the same identifier makes
//! zero network requests.

use std::collections::HashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::models::place::{NewPlace, Place};
use crate::session::Session;

const V2_URL: &str = "https://api.weibo.cn/2/place/show?poiid=";
const FALLBACK_URL: &str = "https://m.weibo.cn/p/index?containerid=100101";

/// Image filename fragment marking a place that no longer exists upstream.
const DELETED_PLACE_IMAGE: &str = "place_nonexistent";

/// Coordinates are stored at six decimal places (~0.1 m) so equality
/// comparisons against independently-derived post coordinates stay
/// meaningful.
pub fn round_coord(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Geodesic distance in metres between two (lat, lng) pairs.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lng1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lng2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// A place as parsed from one of the upstream shapes, pre-persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlace {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub resolved_by: &'static str,
}

/// Parse the v2 response body. `Ok(None)` means "ambiguous or empty, try
/// the fallback".
pub fn parse_v2(data: &Value) -> Result<Option<ParsedPlace>> {
    let obj = match data.as_object() {
        Some(o) if !o.is_empty() => o,
        _ => return Ok(None),
    };
    let name = match obj.get("title").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => return Ok(None),
    };
    let lat = coord_field(obj.get("lat"));
    let lng = coord_field(obj.get("lon"));
    let (Some(lat), Some(lng)) = (lat, lng) else {
        debug!("v2 place response without coordinates, falling back");
        return Ok(None);
    };
    Ok(Some(ParsedPlace {
        name,
        latitude: round_coord(lat),
        longitude: round_coord(lng),
        address: obj
            .get("address")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        resolved_by: "v2",
    }))
}

fn coord_field(v: Option<&Value>) -> Option<f64> {
    match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Parse the older endpoint's response. Two sub-shapes: coordinates inside
/// the `pic` image URL, or inside the `scheme` deep link with the same
/// `xy=lng,lat` query convention. `Ok(None)` means the place was deleted.
pub fn parse_fallback(data: &Value) -> Result<Option<ParsedPlace>> {
    let page = data
        .get("pageInfo")
        .or_else(|| data.get("page_info"))
        .ok_or_else(|| ArchiveError::validation("fallback place response without pageInfo"))?;

    let name = page
        .get("title")
        .or_else(|| page.get("nick"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ArchiveError::validation("fallback place response without title"))?
        .to_string();

    let (coords, resolved_by) = match page.get("pic").and_then(Value::as_str) {
        Some(pic) if !pic.is_empty() => {
            if pic.contains(DELETED_PLACE_IMAGE) {
                return Ok(None);
            }
            (embedded_xy(pic)?, "fallback-picture")
        }
        _ => {
            let scheme = page
                .get("scheme")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    ArchiveError::validation("fallback place response with neither pic nor scheme")
                })?;
            (embedded_xy(scheme)?, "fallback-scheme")
        }
    };

    Ok(Some(ParsedPlace {
        name,
        latitude: round_coord(coords.0),
        longitude: round_coord(coords.1),
        address: page
            .get("address")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        resolved_by,
    }))
}

/// Pull `(lat, lng)` out of an `xy=lng,lat` query parameter embedded in an
/// image URL or deep link.
fn embedded_xy(reference: &str) -> Result<(f64, f64)> {
    let parsed = Url::parse(reference)
        .map_err(|e| ArchiveError::validation(format!("unparseable place reference: {e}")))?;
    for (k, v) in parsed.query_pairs() {
        if k == "xy" {
            let (lng, lat) = v
                .split_once(',')
                .ok_or_else(|| ArchiveError::validation(format!("malformed xy parameter {v:?}")))?;
            let lng: f64 = lng.trim().parse().map_err(|_| {
                ArchiveError::validation(format!("non-numeric longitude in xy {v:?}"))
            })?;
            let lat: f64 = lat.trim().parse().map_err(|_| {
                ArchiveError::validation(format!("non-numeric latitude in xy {v:?}"))
            })?;
            return Ok((lat, lng));
        }
    }
    Err(ArchiveError::validation(format!(
        "no xy parameter in place reference {reference:?}"
    )))
}

/// Compare resolved place coordinates against coordinates derived
/// independently from the post itself. Disagreement beyond ~1 m is worth a
/// notice; it is not an error.
pub fn note_divergence(post_id: i64, place: (f64, f64), post: (f64, f64)) {
    let d = haversine_m(place, post);
    if d > 1.0 {
        info!(
            post_id,
            distance_m = format!("{d:.1}"),
            "place coordinates diverge from post coordinates"
        );
    }
}

/// Network side of place resolution. Abstracted so the caching layer can be
/// exercised against a counting fake.
#[allow(async_fn_in_trait)]
pub trait PlaceSource {
    async fn fetch_place(&self, poi_id: &str) -> Result<Option<ParsedPlace>>;
}

impl PlaceSource for Session {
    async fn fetch_place(&self, poi_id: &str) -> Result<Option<ParsedPlace>> {
        let v2_url = format!("{V2_URL}{poi_id}");
        let body = self.get_json(&v2_url).await?;
        if let Some(place) = parse_v2(&body)? {
            return Ok(Some(place));
        }

        let fb_url = format!("{FALLBACK_URL}{}", urlencoding::encode(poi_id));
        let body = self.get_json(&fb_url).await?;
        parse_fallback(&body)
    }
}

/// Persistence side of place resolution.
#[allow(async_fn_in_trait)]
pub trait PlaceStore {
    async fn load(&self, poi_id: &str) -> Result<Option<Place>>;
    async fn save(&self, place: NewPlace) -> Result<Place>;
    /// Returns whether a row changed.
    async fn rename(&self, poi_id: &str, name: &str) -> Result<bool>;
}

impl PlaceStore for Database {
    async fn load(&self, poi_id: &str) -> Result<Option<Place>> {
        Place::get(self, poi_id).await
    }

    async fn save(&self, place: NewPlace) -> Result<Place> {
        place.insert(self).await
    }

    async fn rename(&self, poi_id: &str, name: &str) -> Result<bool> {
        Place::update_name(self, poi_id, name).await
    }
}

/// Idempotent place resolver with a permanent cache.
pub struct LocationResolver {
    /// poi_id -> resolution; `None` records a deleted place so we never
    /// re-ask for it either.
    cache: Mutex<HashMap<String, Option<Place>>>,
}

impl LocationResolver {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a place identifier, hitting the source at most once per
    /// identifier for the lifetime of the store.
    pub async fn resolve<S, D>(&self, source: &S, store: &D, poi_id: &str) -> Result<Option<Place>>
    where
        S: PlaceSource,
        D: PlaceStore,
    {
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(poi_id) {
                return Ok(hit.clone());
            }
        }

        if let Some(stored) = store.load(poi_id).await? {
            let mut cache = self.cache.lock().await;
            cache.insert(poi_id.to_string(), Some(stored.clone()));
            return Ok(Some(stored));
        }

        let resolved = source.fetch_place(poi_id).await?;
        let place = match resolved {
            Some(parsed) => {
                let row = NewPlace {
                    poi_id: poi_id.to_string(),
                    name: parsed.name,
                    latitude: parsed.latitude,
                    longitude: parsed.longitude,
                    address: parsed.address,
                    resolved_by: parsed.resolved_by.to_string(),
                };
                Some(store.save(row).await?)
            }
            None => {
                warn!(poi_id, "place deleted upstream, caching the miss");
                None
            }
        };

        let mut cache = self.cache.lock().await;
        cache.insert(poi_id.to_string(), place.clone());
        Ok(place)
    }

    /// Back-fill a resolved place's name when a post's free-text location
    /// name is more specific. The only mutation a place ever sees.
    pub async fn backfill_name<D: PlaceStore>(
        &self,
        store: &D,
        poi_id: &str,
        name: &str,
    ) -> Result<()> {
        let updated = store.rename(poi_id, name).await?;
        if updated {
            let mut cache = self.cache.lock().await;
            if let Some(Some(place)) = cache.get_mut(poi_id) {
                place.name = name.to_string();
            }
        }
        Ok(())
    }
}

impl Default for LocationResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v2_parses_a_complete_place() {
        let data = json!({
            "poiid": "B2094757D06FA7FB4199",
            "title": "外滩",
            "address": "中山东一路",
            "lat": "31.23369871",
            "lon": 121.49053784,
        });
        let place = parse_v2(&data).unwrap().unwrap();
        assert_eq!(place.name, "外滩");
        // Rounded to six decimals.
        assert_eq!(place.latitude, 31.233699);
        assert_eq!(place.longitude, 121.490538);
        assert_eq!(place.resolved_by, "v2");
    }

    #[test]
    fn v2_without_coordinates_defers_to_fallback() {
        assert_eq!(parse_v2(&json!({})).unwrap(), None);
        assert_eq!(parse_v2(&json!({"title": "某地"})).unwrap(), None);
    }

    #[test]
    fn fallback_reads_coordinates_from_picture() {
        let data = json!({
            "pageInfo": {
                "title": "外滩",
                "pic": "https://img.example.com/map/center.png?xy=121.490538%2C31.233699&zoom=15",
            }
        });
        let place = parse_fallback(&data).unwrap().unwrap();
        assert_eq!(place.resolved_by, "fallback-picture");
        assert_eq!(place.latitude, 31.233699);
        assert_eq!(place.longitude, 121.490538);
    }

    #[test]
    fn fallback_reads_coordinates_from_scheme() {
        let data = json!({
            "pageInfo": {
                "title": "外滩",
                "pic": "",
                "scheme": "sinaweibo://map?xy=121.490538,31.233699&poiid=B2094",
            }
        });
        let place = parse_fallback(&data).unwrap().unwrap();
        assert_eq!(place.resolved_by, "fallback-scheme");
        assert_eq!(place.latitude, 31.233699);
    }

    #[test]
    fn deleted_place_is_a_clean_miss() {
        let data = json!({
            "pageInfo": {
                "title": "曾经的店",
                "pic": "https://img.example.com/place_nonexistent_default.png",
            }
        });
        assert_eq!(parse_fallback(&data).unwrap(), None);
    }

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingSource {
        hits: AtomicUsize,
        answer: Option<ParsedPlace>,
    }

    impl CountingSource {
        fn new(answer: Option<ParsedPlace>) -> Self {
            Self {
                hits: AtomicUsize::new(0),
                answer,
            }
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl PlaceSource for CountingSource {
        async fn fetch_place(&self, _poi_id: &str) -> Result<Option<ParsedPlace>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        rows: StdMutex<HashMap<String, Place>>,
    }

    impl PlaceStore for MemoryStore {
        async fn load(&self, poi_id: &str) -> Result<Option<Place>> {
            Ok(self.rows.lock().unwrap().get(poi_id).cloned())
        }

        async fn save(&self, place: NewPlace) -> Result<Place> {
            let row = Place {
                poi_id: place.poi_id.clone(),
                name: place.name,
                latitude: place.latitude,
                longitude: place.longitude,
                address: place.address,
                resolved_by: place.resolved_by,
                created_at: chrono::Utc::now(),
            };
            self.rows
                .lock()
                .unwrap()
                .insert(place.poi_id, row.clone());
            Ok(row)
        }

        async fn rename(&self, poi_id: &str, name: &str) -> Result<bool> {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(poi_id) {
                Some(row) if row.name != name => {
                    row.name = name.to_string();
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    fn bund() -> ParsedPlace {
        ParsedPlace {
            name: "外滩".into(),
            latitude: 31.233699,
            longitude: 121.490538,
            address: None,
            resolved_by: "v2",
        }
    }

    #[test_log::test(tokio::test)]
    async fn second_resolve_makes_no_requests() {
        let resolver = LocationResolver::new();
        let source = CountingSource::new(Some(bund()));
        let store = MemoryStore::default();

        let first = resolver.resolve(&source, &store, "B2094").await.unwrap().unwrap();
        assert_eq!(source.hits(), 1);

        let second = resolver.resolve(&source, &store, "B2094").await.unwrap().unwrap();
        assert_eq!(source.hits(), 1);
        assert_eq!(first, second);
        assert_eq!(second.latitude, 31.233699);
    }

    #[test_log::test(tokio::test)]
    async fn deleted_places_cache_the_miss() {
        let resolver = LocationResolver::new();
        let source = CountingSource::new(None);
        let store = MemoryStore::default();

        assert!(resolver.resolve(&source, &store, "B2094").await.unwrap().is_none());
        assert!(resolver.resolve(&source, &store, "B2094").await.unwrap().is_none());
        assert_eq!(source.hits(), 1);
        // A miss writes nothing.
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn stored_rows_preempt_the_source() {
        let resolver = LocationResolver::new();
        let source = CountingSource::new(Some(bund()));
        let store = MemoryStore::default();
        store
            .save(NewPlace {
                poi_id: "B2094".into(),
                name: "外滩".into(),
                latitude: 31.233699,
                longitude: 121.490538,
                address: None,
                resolved_by: "v2".into(),
            })
            .await
            .unwrap();

        let place = resolver.resolve(&source, &store, "B2094").await.unwrap().unwrap();
        assert_eq!(source.hits(), 0);
        assert_eq!(place.name, "外滩");
    }

    #[test_log::test(tokio::test)]
    async fn backfill_updates_store_and_cache() {
        let resolver = LocationResolver::new();
        let source = CountingSource::new(Some(bund()));
        let store = MemoryStore::default();

        resolver.resolve(&source, &store, "B2094").await.unwrap();
        resolver
            .backfill_name(&store, "B2094", "外滩·陈毅广场")
            .await
            .unwrap();

        let cached = resolver.resolve(&source, &store, "B2094").await.unwrap().unwrap();
        assert_eq!(cached.name, "外滩·陈毅广场");
        assert_eq!(source.hits(), 1);
    }

    #[test]
    fn haversine_is_near_zero_for_identical_points() {
        let p = (31.233699, 121.490538);
        assert!(haversine_m(p, p) < 1e-6);
        // Sixth-decimal jiggle stays near a decimetre.
        let q = (31.233700, 121.490538);
        let d = haversine_m(p, q);
        assert!(d > 0.05 && d < 0.2, "distance was {d}");
    }

    #[test]
    fn rounding_is_stable() {
        let v = 31.23369871234;
        assert_eq!(round_coord(v), round_coord(round_coord(v)));
    }
}
