// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cards::{PhotoRef, PostRecord, Provenance};
use crate::config::SourcePrecedence;
use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::location::round_coord;
use crate::models::merge::{merge_clearable, merge_count, merge_field, Writable};
use crate::schema::{post_caches, posts};
use crate::transcript::Transcript;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = posts)]
pub struct Post {
    pub id: i64,
    pub bid: String,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
    pub text: Option<String>,
    pub mentions: Option<String>,
    pub hashtags: Option<String>,
    pub region_name: Option<String>,
    pub location_name: Option<String>,
    pub location_poi: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub photos: Option<String>,
    pub declared_photo_count: Option<i32>,
    pub has_extra_photos: bool,
    pub video_url: Option<String>,
    pub video_duration: Option<f64>,
    pub reposts_count: Option<i64>,
    pub comments_count: Option<i64>,
    pub attitudes_count: Option<i64>,
    pub pinned: bool,
    pub edit_count: i32,
    pub source_kind: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = posts)]
#[diesel(treat_none_as_null = true)]
pub struct NewPost {
    pub id: i64,
    pub bid: String,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
    pub text: Option<String>,
    pub mentions: Option<String>,
    pub hashtags: Option<String>,
    pub region_name: Option<String>,
    pub location_name: Option<String>,
    pub location_poi: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub photos: Option<String>,
    pub declared_photo_count: Option<i32>,
    pub has_extra_photos: bool,
    pub video_url: Option<String>,
    pub video_duration: Option<f64>,
    pub reposts_count: Option<i64>,
    pub comments_count: Option<i64>,
    pub attitudes_count: Option<i64>,
    pub pinned: bool,
    pub edit_count: i32,
    pub source_kind: String,
    pub fetched_at: DateTime<Utc>,
}

impl Post {
    /// Stored photo references, decoded.
    pub fn photo_refs(&self) -> Vec<PhotoRef> {
        self.photos
            .as_deref()
            .map(|s| s.lines().map(PhotoRef::from_stored).collect())
            .unwrap_or_default()
    }
}

/// Join photo references into the stored newline-separated form.
pub fn photos_stored(photos: &[PhotoRef]) -> Option<String> {
    if photos.is_empty() {
        None
    } else {
        Some(
            photos
                .iter()
                .map(PhotoRef::to_stored)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

pub fn join_lines(items: &[String]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        Some(items.join("\n"))
    }
}

/// Rank a snapshot source under the configured precedence. A higher rank may
/// overwrite fields written by a lower one even without an edit-count bump.
fn source_rank(precedence: SourcePrecedence, source: &str) -> u8 {
    match (precedence, source) {
        // Full-detail mobile cards outrank both summary shapes.
        (_, "mobile") => 3,
        (SourcePrecedence::WebFirst, "web") => 2,
        (SourcePrecedence::WeicoFirst, "weico") => 2,
        _ => 1,
    }
}

/// Whether a stored field may be overwritten by this parse. Unset fields are
/// always fillable; set fields only move when the edit counter advanced or
/// the incoming source outranks the one that wrote the row.
fn unlocked(
    precedence: SourcePrecedence,
    stored: Option<&Post>,
    incoming: &PostRecord,
) -> bool {
    match stored {
        None => true,
        Some(s) => {
            incoming.edit_count > s.edit_count
                || source_rank(precedence, incoming.provenance.as_str())
                    > source_rank(precedence, &s.source_kind)
        }
    }
}

/// One field under the edit-counter gate: locked and set means the stored
/// value stands, otherwise normal merge semantics apply.
fn gated<T>(
    tx: &mut Transcript,
    entity: &str,
    field: &str,
    stored: Option<T>,
    incoming: Option<T>,
    open: bool,
) -> Result<Option<T>>
where
    T: PartialEq + std::fmt::Display + Writable,
{
    if open || stored.is_none() {
        merge_field(tx, entity, field, stored, incoming)
    } else {
        Ok(stored)
    }
}

fn gated_clearable<T>(
    tx: &mut Transcript,
    entity: &str,
    field: &str,
    stored: Option<T>,
    incoming: Option<T>,
    open: bool,
    full_refresh: bool,
) -> Result<Option<T>>
where
    T: PartialEq + std::fmt::Display + Writable,
{
    if open {
        merge_clearable(tx, entity, field, stored, incoming, full_refresh)
    } else if stored.is_none() {
        merge_field(tx, entity, field, None, incoming)
    } else {
        Ok(stored)
    }
}

impl Post {
    pub async fn get(db: &Database, id: i64) -> Result<Option<Post>> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = posts::table
            .find(id)
            .first::<Post>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    /// Merge a parsed record into the stored post and persist the result.
    ///
    /// The edit-counter gate keeps a re-parse of the same generation from
    /// flapping fields between sources; the configured source precedence
    /// breaks ties when two shapes of the same generation disagree.
    pub async fn upsert(
        db: &Database,
        tx: &mut Transcript,
        rec: &PostRecord,
        precedence: SourcePrecedence,
        full_refresh: bool,
    ) -> Result<Post> {
        let stored = Post::get(db, rec.id).await?;
        let entity = format!("post {}", rec.id);
        let open = unlocked(precedence, stored.as_ref(), rec);

        let text = gated(
            tx,
            &entity,
            "text",
            stored.as_ref().and_then(|s| s.text.clone()),
            rec.text.clone(),
            open,
        )?;
        let mentions = gated(
            tx,
            &entity,
            "mentions",
            stored.as_ref().and_then(|s| s.mentions.clone()),
            join_lines(&rec.mentions),
            open,
        )?;
        let hashtags = gated(
            tx,
            &entity,
            "hashtags",
            stored.as_ref().and_then(|s| s.hashtags.clone()),
            join_lines(&rec.hashtags),
            open,
        )?;
        let region_name = gated(
            tx,
            &entity,
            "region_name",
            stored.as_ref().and_then(|s| s.region_name.clone()),
            rec.region_name.clone(),
            open,
        )?;

        let incoming_location_name = rec.geo.name.clone().or_else(|| rec.location_chip.clone());
        let location_name = gated_clearable(
            tx,
            &entity,
            "location_name",
            stored.as_ref().and_then(|s| s.location_name.clone()),
            incoming_location_name,
            open,
            full_refresh,
        )?;
        let location_poi = gated_clearable(
            tx,
            &entity,
            "location_poi",
            stored.as_ref().and_then(|s| s.location_poi.clone()),
            rec.geo.poi_id.clone(),
            open,
            full_refresh,
        )?;
        let latitude = gated_clearable(
            tx,
            &entity,
            "latitude",
            stored.as_ref().and_then(|s| s.latitude),
            rec.geo.coordinates.map(|c| round_coord(c.0)),
            open,
            full_refresh,
        )?;
        let longitude = gated_clearable(
            tx,
            &entity,
            "longitude",
            stored.as_ref().and_then(|s| s.longitude),
            rec.geo.coordinates.map(|c| round_coord(c.1)),
            open,
            full_refresh,
        )?;

        let photos = gated(
            tx,
            &entity,
            "photos",
            stored.as_ref().and_then(|s| s.photos.clone()),
            photos_stored(&rec.photos),
            open,
        )?;
        let video_url = gated_clearable(
            tx,
            &entity,
            "video_url",
            stored.as_ref().and_then(|s| s.video_url.clone()),
            rec.video_url.clone(),
            open,
            full_refresh,
        )?;
        let video_duration = if open {
            rec.video_duration
                .or_else(|| stored.as_ref().and_then(|s| s.video_duration))
        } else {
            stored
                .as_ref()
                .and_then(|s| s.video_duration)
                .or(rec.video_duration)
        };

        let declared_photo_count = rec
            .declared_photo_count
            .or_else(|| stored.as_ref().and_then(|s| s.declared_photo_count));
        let stored_photo_len = photos
            .as_deref()
            .map(|p| p.lines().count())
            .unwrap_or(0);
        let has_extra_photos = declared_photo_count
            .map(|d| d as usize > stored_photo_len)
            .unwrap_or(false);

        let row = NewPost {
            id: rec.id,
            bid: rec.bid.clone(),
            author_id: rec.author.id,
            created_at: rec.created_at.with_timezone(&Utc),
            text,
            mentions,
            hashtags,
            region_name,
            location_name,
            location_poi,
            latitude,
            longitude,
            photos,
            declared_photo_count,
            has_extra_photos,
            video_url,
            video_duration,
            reposts_count: merge_count(
                stored.as_ref().and_then(|s| s.reposts_count),
                rec.reposts_count,
            ),
            comments_count: merge_count(
                stored.as_ref().and_then(|s| s.comments_count),
                rec.comments_count,
            ),
            attitudes_count: merge_count(
                stored.as_ref().and_then(|s| s.attitudes_count),
                rec.attitudes_count,
            ),
            pinned: rec.pinned,
            edit_count: stored
                .as_ref()
                .map(|s| s.edit_count.max(rec.edit_count))
                .unwrap_or(rec.edit_count),
            source_kind: if open {
                rec.provenance.as_str().to_string()
            } else {
                stored
                    .as_ref()
                    .map(|s| s.source_kind.clone())
                    .unwrap_or_else(|| rec.provenance.as_str().to_string())
            },
            fetched_at: Utc::now(),
        };

        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let saved = diesel::insert_into(posts::table)
            .values(&row)
            .on_conflict(posts::id)
            .do_update()
            .set(&row)
            .returning(Post::as_returning())
            .get_result::<Post>(&mut conn)
            .await?;
        Ok(saved)
    }
}

// ---------------------------------------------------------------------------
// Raw-snapshot side table
// ---------------------------------------------------------------------------

/// One row per post: the latest raw card per provenance, overwritten in
/// place, plus the computed edit-history blob.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = post_caches)]
pub struct PostCache {
    pub post_id: i64,
    pub web_snapshot: Option<Value>,
    pub mobile_snapshot: Option<Value>,
    pub weico_snapshot: Option<Value>,
    pub edit_history: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl PostCache {
    pub async fn get(db: &Database, post_id: i64) -> Result<Option<PostCache>> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = post_caches::table
            .find(post_id)
            .first::<PostCache>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    /// Overwrite the snapshot slot for one provenance.
    pub async fn store_snapshot(
        db: &Database,
        post_id: i64,
        provenance: Provenance,
        raw: &Value,
    ) -> Result<()> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let now = Utc::now();
        match provenance {
            Provenance::Web => {
                diesel::insert_into(post_caches::table)
                    .values((
                        post_caches::post_id.eq(post_id),
                        post_caches::web_snapshot.eq(Some(raw)),
                        post_caches::updated_at.eq(now),
                    ))
                    .on_conflict(post_caches::post_id)
                    .do_update()
                    .set((
                        post_caches::web_snapshot.eq(Some(raw)),
                        post_caches::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?;
            }
            Provenance::Mobile => {
                diesel::insert_into(post_caches::table)
                    .values((
                        post_caches::post_id.eq(post_id),
                        post_caches::mobile_snapshot.eq(Some(raw)),
                        post_caches::updated_at.eq(now),
                    ))
                    .on_conflict(post_caches::post_id)
                    .do_update()
                    .set((
                        post_caches::mobile_snapshot.eq(Some(raw)),
                        post_caches::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?;
            }
            Provenance::Weico => {
                diesel::insert_into(post_caches::table)
                    .values((
                        post_caches::post_id.eq(post_id),
                        post_caches::weico_snapshot.eq(Some(raw)),
                        post_caches::updated_at.eq(now),
                    ))
                    .on_conflict(post_caches::post_id)
                    .do_update()
                    .set((
                        post_caches::weico_snapshot.eq(Some(raw)),
                        post_caches::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Overwrite the computed edit-history blob.
    pub async fn store_edit_history(db: &Database, post_id: i64, history: &Value) -> Result<()> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let now = Utc::now();
        diesel::insert_into(post_caches::table)
            .values((
                post_caches::post_id.eq(post_id),
                post_caches::edit_history.eq(Some(history)),
                post_caches::updated_at.eq(now),
            ))
            .on_conflict(post_caches::post_id)
            .do_update()
            .set((
                post_caches::edit_history.eq(Some(history)),
                post_caches::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{AuthorRecord, GeoHint};
    use crate::cards::parse_created_at;

    fn author() -> AuthorRecord {
        AuthorRecord {
            id: 42,
            screen_name: "某人".into(),
            avatar_url: None,
            following: true,
            follow_me: false,
            verified: false,
            gender: None,
            description: None,
            followers_count: None,
            follow_count: None,
            statuses_count: None,
        }
    }

    fn record(provenance: Provenance, edit_count: i32) -> PostRecord {
        PostRecord {
            id: 4_263_292_843_436_447,
            bid: crate::shortid::encode(4_263_292_843_436_447),
            author: author(),
            created_at: parse_created_at("Thu Aug 20 14:01:02 +0800 2026").unwrap(),
            text: Some("今天天气不错".into()),
            mentions: vec![],
            hashtags: vec![],
            location_chip: None,
            region_name: None,
            geo: GeoHint::default(),
            photos: vec![PhotoRef::still("http://p/1.jpg")],
            declared_photo_count: Some(1),
            video_url: None,
            video_duration: None,
            reposts_count: Some(0),
            comments_count: Some(2),
            attitudes_count: Some(5),
            pinned: false,
            edit_count,
            provenance,
            raw: serde_json::json!({}),
        }
    }

    fn stored_from(rec: &PostRecord, source_kind: &str) -> Post {
        Post {
            id: rec.id,
            bid: rec.bid.clone(),
            author_id: rec.author.id,
            created_at: rec.created_at.with_timezone(&Utc),
            text: rec.text.clone(),
            mentions: None,
            hashtags: None,
            region_name: None,
            location_name: None,
            location_poi: None,
            latitude: None,
            longitude: None,
            photos: photos_stored(&rec.photos),
            declared_photo_count: rec.declared_photo_count,
            has_extra_photos: false,
            video_url: None,
            video_duration: None,
            reposts_count: rec.reposts_count,
            comments_count: rec.comments_count,
            attitudes_count: rec.attitudes_count,
            pinned: rec.pinned,
            edit_count: rec.edit_count,
            source_kind: source_kind.to_string(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn same_generation_lower_rank_is_locked() {
        let rec = record(Provenance::Weico, 0);
        let stored = stored_from(&rec, "web");
        assert!(!unlocked(SourcePrecedence::WebFirst, Some(&stored), &rec));
        assert!(unlocked(SourcePrecedence::WeicoFirst, Some(&stored), &rec));
    }

    #[test]
    fn edit_bump_unlocks_everything() {
        let rec = record(Provenance::Weico, 1);
        let stored = stored_from(&record(Provenance::Weico, 0), "web");
        assert!(unlocked(SourcePrecedence::WebFirst, Some(&stored), &rec));
    }

    #[test]
    fn detail_cards_outrank_summaries() {
        let rec = record(Provenance::Mobile, 0);
        let stored = stored_from(&rec, "web");
        assert!(unlocked(SourcePrecedence::WebFirst, Some(&stored), &rec));
    }

    #[test]
    fn locked_rows_still_fill_unset_fields() {
        let mut tx = Transcript::new();
        let merged = gated(
            &mut tx,
            "post 1",
            "region_name",
            None,
            Some("发布于 上海".to_string()),
            false,
        )
        .unwrap();
        assert_eq!(merged.as_deref(), Some("发布于 上海"));
        assert_eq!(tx.diff_len(), 1);

        // But a set field stays put without an unlock.
        let mut tx = Transcript::new();
        let merged = gated(
            &mut tx,
            "post 1",
            "text",
            Some("old".to_string()),
            Some("new".to_string()),
            false,
        )
        .unwrap();
        assert_eq!(merged.as_deref(), Some("old"));
        assert_eq!(tx.diff_len(), 0);
    }

    #[test]
    fn photo_storage_round_trips() {
        let photos = vec![
            PhotoRef {
                still_url: "http://p/1.jpg".into(),
                live_video_url: Some("http://p/1.mov".into()),
            },
            PhotoRef::still("http://p/2.jpg"),
        ];
        let stored = photos_stored(&photos).unwrap();
        let decoded: Vec<PhotoRef> = stored.lines().map(PhotoRef::from_stored).collect();
        assert_eq!(decoded, photos);
        assert_eq!(photos_stored(&[]), None);
    }
}
