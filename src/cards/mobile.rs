// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Parser for m.weibo.cn mobile-API cards.
//!
//! Timeline responses wrap each post in a `card` object with a `mblog`
//! payload; detail responses return the `mblog` body directly. Counts may
//! arrive as numbers or strings, photos live in the `pics` array with
//! optional `videoSrc` live-photo companions.

use serde_json::Value;
use tracing::debug;

use crate::cards::{
    clean_text, confirm_bid, parse_author, parse_count, parse_created_at, GeoHint, PhotoRef,
    PostRecord, Provenance,
};
use crate::error::{ArchiveError, Result};

/// Parse one timeline container card. Only `card_type == 9` carries a post.
pub fn parse_card(card: &Value) -> Result<Option<PostRecord>> {
    let card_type = card.get("card_type").and_then(Value::as_i64).unwrap_or(0);
    if card_type != 9 {
        debug!(card_type, "skipping non-post card");
        return Ok(None);
    }
    let mblog = card
        .get("mblog")
        .ok_or_else(|| ArchiveError::validation("card_type 9 without mblog body"))?;
    parse_mblog(mblog).map(Some)
}

/// Parse a bare `mblog` body (timeline entry or detail response).
pub fn parse_mblog(mblog: &Value) -> Result<PostRecord> {
    let id: i64 = match mblog.get("id") {
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| ArchiveError::validation(format!("non-numeric mblog id {s:?}")))?,
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ArchiveError::validation("mblog id out of range"))?,
        _ => return Err(ArchiveError::validation("mblog without id")),
    };
    let bid = confirm_bid(id, mblog.get("bid").and_then(Value::as_str))?;

    let created_at = parse_created_at(
        mblog
            .get("created_at")
            .and_then(Value::as_str)
            .ok_or_else(|| ArchiveError::validation(format!("post {id} without created_at")))?,
    )?;

    let author = parse_author(
        mblog
            .get("user")
            .ok_or_else(|| ArchiveError::validation(format!("post {id} without user block")))?,
    )?;

    let cleaned = clean_text(mblog.get("text").and_then(Value::as_str).unwrap_or(""));

    let photos = parse_pics(mblog)?;
    let declared_photo_count = mblog
        .get("pic_num")
        .and_then(Value::as_i64)
        .map(|n| n as i32);

    let (video_url, video_duration) = match mblog.get("page_info") {
        Some(page) if page.get("type").and_then(Value::as_str) == Some("video") => {
            let media = page.get("media_info").ok_or_else(|| {
                ArchiveError::PartialData(format!("post {id} video page without media_info"))
            })?;
            let url = super::resolve_video_url(media, id)?;
            let duration = media.get("duration").and_then(Value::as_f64);
            (Some(url), duration)
        }
        _ => (None, None),
    };

    let geo = parse_geo(mblog);
    let region_name = mblog
        .get("region_name")
        .and_then(Value::as_str)
        .map(strip_region_prefix)
        .filter(|s| !s.is_empty());

    Ok(PostRecord {
        id,
        bid,
        author,
        created_at,
        text: cleaned.text,
        mentions: cleaned.mentions,
        hashtags: cleaned.hashtags,
        location_chip: cleaned.location_chip,
        region_name,
        geo,
        photos,
        declared_photo_count,
        video_url,
        video_duration,
        reposts_count: count_field(mblog, "reposts_count")?,
        comments_count: count_field(mblog, "comments_count")?,
        attitudes_count: count_field(mblog, "attitudes_count")?,
        pinned: mblog.get("isTop").and_then(Value::as_i64) == Some(1),
        edit_count: mblog.get("edit_count").and_then(Value::as_i64).unwrap_or(0) as i32,
        provenance: Provenance::Mobile,
        raw: mblog.clone(),
    })
}

fn count_field(mblog: &Value, key: &str) -> Result<Option<i64>> {
    match mblog.get(key) {
        Some(Value::Null) | None => Ok(None),
        Some(v) => parse_count(v).map(Some),
    }
}

fn parse_pics(mblog: &Value) -> Result<Vec<PhotoRef>> {
    let Some(pics) = mblog.get("pics").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(pics.len());
    for pic in pics {
        let still = pic
            .get("large")
            .and_then(|l| l.get("url"))
            .or_else(|| pic.get("url"))
            .and_then(Value::as_str)
            .ok_or_else(|| ArchiveError::validation("pics entry without a usable url"))?;
        let live = pic
            .get("videoSrc")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        out.push(PhotoRef {
            still_url: still.to_string(),
            live_video_url: live,
        });
    }
    Ok(out)
}

fn parse_geo(mblog: &Value) -> GeoHint {
    let mut hint = GeoHint::default();
    if let Some(geo) = mblog.get("geo") {
        // Point coordinates arrive latitude-first on this API.
        if let Some(coords) = geo.get("coordinates").and_then(Value::as_array) {
            if let (Some(lat), Some(lng)) = (
                coords.first().and_then(Value::as_f64),
                coords.get(1).and_then(Value::as_f64),
            ) {
                hint.coordinates = Some((lat, lng));
            }
        }
    }
    if let Some(annotations) = mblog.get("annotations").and_then(Value::as_array) {
        for a in annotations {
            if let Some(place) = a.get("place") {
                hint.poi_id = place
                    .get("poiid")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                hint.name = place
                    .get("title")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }
        }
    }
    hint
}

/// `region_name` arrives as "发布于 上海"; store just the region.
fn strip_region_prefix(raw: &str) -> String {
    raw.trim_start_matches("发布于").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_mblog() -> Value {
        json!({
            "id": "4263292843436447",
            "bid": crate::shortid::encode(4_263_292_843_436_447),
            "created_at": "Thu Aug 20 14:01:02 +0800 2026",
            "text": "今天真好 <a href='/n/某人'>@某人</a>",
            "user": {
                "id": 1273725432i64,
                "screen_name": "测试用户",
                "avatar_hd": "http://a/hd.jpg",
                "following": true,
                "follow_me": false,
                "verified": false,
            },
            "pic_num": 2,
            "pics": [
                {"url": "http://p/t1.jpg", "large": {"url": "http://p/1.jpg"}},
                {"url": "http://p/t2.jpg", "large": {"url": "http://p/2.jpg"},
                 "videoSrc": "http://p/2.mov"},
            ],
            "reposts_count": 3,
            "comments_count": "100万+",
            "attitudes_count": 5,
            "isTop": 1,
            "edit_count": 2,
            "region_name": "发布于 上海",
        })
    }

    #[test]
    fn parses_a_summary_card() {
        let rec = parse_mblog(&base_mblog()).unwrap();
        assert_eq!(rec.id, 4_263_292_843_436_447);
        assert_eq!(rec.author.screen_name, "测试用户");
        assert_eq!(rec.comments_count, Some(1_000_000));
        assert_eq!(rec.photos.len(), 2);
        assert_eq!(
            rec.photos[1].live_video_url.as_deref(),
            Some("http://p/2.mov")
        );
        assert_eq!(rec.region_name.as_deref(), Some("上海"));
        assert!(rec.pinned);
        assert_eq!(rec.edit_count, 2);
        assert_eq!(rec.mentions, vec!["某人"]);
        assert!(!rec.needs_detail_refetch());
    }

    #[test]
    fn declared_count_beyond_inline_photos_requests_refetch() {
        let mut mblog = base_mblog();
        mblog["pic_num"] = json!(12);
        let rec = parse_mblog(&mblog).unwrap();
        assert!(rec.needs_detail_refetch());
    }

    #[test]
    fn photo_count_matches_declared_for_small_posts() {
        let rec = parse_mblog(&base_mblog()).unwrap();
        assert_eq!(
            rec.photos.len() as i32,
            rec.declared_photo_count.unwrap()
        );
    }

    #[test]
    fn video_post_without_playable_url_is_partial_data() {
        let mut mblog = base_mblog();
        mblog["page_info"] = json!({"type": "video", "media_info": {"unknown_key": "x"}});
        assert!(matches!(
            parse_mblog(&mblog),
            Err(ArchiveError::PartialData(_))
        ));
    }

    #[test]
    fn video_post_resolves_best_quality() {
        let mut mblog = base_mblog();
        mblog["page_info"] = json!({
            "type": "video",
            "media_info": {
                "stream_url": "http://v/ld.mp4",
                "mp4_hd_mp4": "http://v/hd.mp4",
                "duration": 31.5,
            }
        });
        let rec = parse_mblog(&mblog).unwrap();
        assert_eq!(rec.video_url.as_deref(), Some("http://v/hd.mp4"));
        assert_eq!(rec.video_duration, Some(31.5));
    }

    #[test]
    fn non_post_cards_are_skipped() {
        let card = json!({"card_type": 11, "card_group": []});
        assert!(parse_card(&card).unwrap().is_none());
    }
}
