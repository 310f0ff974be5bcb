// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Edit-history reconciliation.
//!
//! An edited post leaves a chain of snapshots, oldest to newest. Photos are
//! accumulated across the chain in first-seen order and never dropped once
//! seen; location candidates compete on information density; region names
//! may disagree across edits, which is worth a warning but never blocks the
//! merge.

use tracing::warn;

use crate::cards::{GeoHint, PhotoRef, PostRecord};
use crate::error::ArchiveError;
use crate::transcript::Transcript;

/// Merged view over a post's edit chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryMerge {
    pub photos: Vec<PhotoRef>,
    pub location: Option<GeoHint>,
    pub region_name: Option<String>,
    /// Snapshots that failed to parse and were skipped.
    pub skipped: usize,
}

/// Merge an ordered chain of snapshot parse results (oldest first).
///
/// Individual snapshots may fail to parse — an edit can cross-reference a
/// post that has since been deleted — and such snapshots are skipped with a
/// warning rather than failing the whole merge. Region-name disagreements
/// between snapshots land in the transcript as conflicts.
pub fn reconcile(
    post_id: i64,
    snapshots: Vec<Result<PostRecord, ArchiveError>>,
    tx: &mut Transcript,
) -> HistoryMerge {
    let mut merge = HistoryMerge::default();

    // (b) fallback: the first coords-only candidate seen, kept while we
    // continue scanning for a (a) name-and-coords winner.
    let mut coords_fallback: Option<GeoHint> = None;
    let mut named_winner: Option<GeoHint> = None;

    for (i, snapshot) in snapshots.into_iter().enumerate() {
        let snapshot = match snapshot {
            Ok(s) => s,
            Err(e) => {
                warn!(post_id, snapshot = i, error = %e, "skipping unparseable edit snapshot");
                merge.skipped += 1;
                continue;
            }
        };

        for photo in &snapshot.photos {
            if !merge.photos.contains(photo) {
                merge.photos.push(photo.clone());
            }
        }

        let geo = &snapshot.geo;
        let has_name = geo.name.is_some() || snapshot.location_chip.is_some();
        let has_coords = geo.coordinates.is_some();
        if has_name && has_coords && named_winner.is_none() {
            let mut winner = geo.clone();
            if winner.name.is_none() {
                winner.name = snapshot.location_chip.clone();
            }
            named_winner = Some(winner);
        } else if has_coords && !has_name && coords_fallback.is_none() {
            coords_fallback = Some(geo.clone());
        }

        if let Some(region) = &snapshot.region_name {
            if let Some(prev) = &merge.region_name {
                if prev != region {
                    warn!(
                        post_id,
                        old = %prev,
                        new = %region,
                        "edit snapshots disagree on region name"
                    );
                    tx.conflict(&format!("post {post_id}"), "region_name", prev, region);
                }
            }
            merge.region_name = Some(region.clone());
        }
    }

    merge.location = named_winner.or(coords_fallback);
    merge
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{AuthorRecord, Provenance};
    use chrono::DateTime;

    fn snapshot(photos: &[&str], geo: GeoHint, region: Option<&str>) -> PostRecord {
        PostRecord {
            id: 7,
            bid: crate::shortid::encode(7),
            author: AuthorRecord {
                id: 1,
                screen_name: "author".into(),
                avatar_url: None,
                following: false,
                follow_me: false,
                verified: false,
                gender: None,
                description: None,
                followers_count: None,
                follow_count: None,
                statuses_count: None,
            },
            created_at: DateTime::parse_from_str(
                "Thu Aug 20 14:01:02 +0800 2026",
                "%a %b %d %H:%M:%S %z %Y",
            )
            .unwrap(),
            text: None,
            mentions: vec![],
            hashtags: vec![],
            location_chip: None,
            region_name: region.map(Into::into),
            geo,
            photos: photos.iter().map(|p| PhotoRef::still(*p)).collect(),
            declared_photo_count: None,
            video_url: None,
            video_duration: None,
            reposts_count: None,
            comments_count: None,
            attitudes_count: None,
            pinned: false,
            edit_count: 0,
            provenance: Provenance::Weico,
            raw: serde_json::Value::Null,
        }
    }

    fn coords(lat: f64, lng: f64) -> GeoHint {
        GeoHint {
            coordinates: Some((lat, lng)),
            ..Default::default()
        }
    }

    fn named_coords(name: &str, lat: f64, lng: f64) -> GeoHint {
        GeoHint {
            name: Some(name.into()),
            coordinates: Some((lat, lng)),
            ..Default::default()
        }
    }

    #[test]
    fn photos_accumulate_in_first_seen_order() {
        let chain = vec![
            Ok(snapshot(&["a", "b"], GeoHint::default(), None)),
            Ok(snapshot(&["b", "c"], GeoHint::default(), None)),
            Ok(snapshot(&["c"], GeoHint::default(), None)),
        ];
        let merged = reconcile(7, chain, &mut Transcript::new());
        let urls: Vec<_> = merged.photos.iter().map(|p| p.still_url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn photo_list_is_monotone_across_prefixes() {
        let chains = [
            vec![&["a"][..], &["b"][..], &["a", "c"][..]],
            vec![&["x", "y"][..], &[][..], &["y"][..]],
        ];
        for chain in chains {
            let mut last_len = 0;
            let mut last_urls: Vec<String> = vec![];
            for prefix_len in 1..=chain.len() {
                let snaps = chain[..prefix_len]
                    .iter()
                    .map(|p| Ok(snapshot(p, GeoHint::default(), None)))
                    .collect();
                let merged = reconcile(7, snaps, &mut Transcript::new());
                assert!(merged.photos.len() >= last_len);
                // Previously-seen photos never reorder.
                let urls: Vec<String> =
                    merged.photos.iter().map(|p| p.still_url.clone()).collect();
                assert_eq!(&urls[..last_urls.len()], &last_urls[..]);
                last_len = merged.photos.len();
                last_urls = urls;
            }
        }
    }

    #[test]
    fn named_location_beats_coords_only() {
        let chain = vec![
            Ok(snapshot(&[], coords(31.1, 121.2), None)),
            Ok(snapshot(&[], named_coords("外滩", 31.2, 121.5), None)),
        ];
        let merged = reconcile(7, chain, &mut Transcript::new());
        let loc = merged.location.unwrap();
        assert_eq!(loc.name.as_deref(), Some("外滩"));
        assert_eq!(loc.coordinates, Some((31.2, 121.5)));
    }

    #[test]
    fn coords_only_fallback_is_first_seen() {
        let chain = vec![
            Ok(snapshot(&[], coords(31.1, 121.2), None)),
            Ok(snapshot(&[], coords(39.9, 116.4), None)),
        ];
        let merged = reconcile(7, chain, &mut Transcript::new());
        assert_eq!(merged.location.unwrap().coordinates, Some((31.1, 121.2)));
    }

    #[test]
    fn no_location_data_means_no_location() {
        let chain = vec![Ok(snapshot(&["a"], GeoHint::default(), None))];
        assert!(reconcile(7, chain, &mut Transcript::new()).location.is_none());
    }

    #[test]
    fn region_conflicts_resolve_to_last_seen() {
        let chain = vec![
            Ok(snapshot(&[], GeoHint::default(), Some("上海"))),
            Ok(snapshot(&[], GeoHint::default(), None)),
            Ok(snapshot(&[], GeoHint::default(), Some("北京"))),
        ];
        let merged = reconcile(7, chain, &mut Transcript::new());
        assert_eq!(merged.region_name.as_deref(), Some("北京"));
    }

    #[test]
    fn region_disagreements_are_recorded_as_conflicts() {
        let chain = vec![
            Ok(snapshot(&[], GeoHint::default(), Some("上海"))),
            Ok(snapshot(&[], GeoHint::default(), Some("北京"))),
        ];
        let mut tx = Transcript::new();
        let merged = reconcile(7, chain, &mut tx);
        assert_eq!(merged.region_name.as_deref(), Some("北京"));
        let conflicts: Vec<_> = tx
            .entries()
            .iter()
            .filter(|e| e.kind == crate::transcript::Kind::Conflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity, "post 7");
        assert!(conflicts[0].detail.contains("上海"));
        assert!(conflicts[0].detail.contains("北京"));
    }

    #[test]
    fn broken_snapshots_are_skipped_not_fatal() {
        let chain = vec![
            Ok(snapshot(&["a"], GeoHint::default(), None)),
            Err(ArchiveError::NotFound {
                reason: "引用的微博已删除".into(),
                url: "http://x".into(),
            }),
            Ok(snapshot(&["b"], GeoHint::default(), None)),
        ];
        let merged = reconcile(7, chain, &mut Transcript::new());
        assert_eq!(merged.skipped, 1);
        assert_eq!(merged.photos.len(), 2);
    }
}
