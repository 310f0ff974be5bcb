// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Parser for the alternate "weico" client cards (api.weibo.cn).
//!
//! Mostly the mobile shape with a different accent: numeric ids, photo
//! details under `pic_infos` keyed by `pic_ids`, and live-photo videos
//! carried out-of-band in a `pic_video` index map (`"0:url,3:url"`).

use serde_json::Value;

use crate::cards::{
    clean_text, confirm_bid, parse_author, parse_count, parse_created_at, GeoHint, PhotoRef,
    PostRecord, Provenance,
};
use crate::error::{ArchiveError, Result};

pub fn parse_status(status: &Value) -> Result<PostRecord> {
    let id = status
        .get("id")
        .and_then(Value::as_i64)
        .or_else(|| {
            status
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        })
        .ok_or_else(|| ArchiveError::validation("weico status without id"))?;
    let bid = confirm_bid(id, status.get("bid").and_then(Value::as_str))?;

    let created_at = parse_created_at(
        status
            .get("created_at")
            .and_then(Value::as_str)
            .ok_or_else(|| ArchiveError::validation(format!("post {id} without created_at")))?,
    )?;

    let author = parse_author(
        status
            .get("user")
            .ok_or_else(|| ArchiveError::validation(format!("post {id} without user block")))?,
    )?;

    let cleaned = clean_text(status.get("text").and_then(Value::as_str).unwrap_or(""));

    let photos = parse_photos(status)?;
    let declared_photo_count = status
        .get("pic_num")
        .and_then(Value::as_i64)
        .map(|n| n as i32);

    let (video_url, video_duration) = match status.get("page_info") {
        Some(page)
            if matches!(
                page.get("type").and_then(Value::as_str),
                Some("video") | Some("11")
            ) =>
        {
            let media = page.get("media_info").ok_or_else(|| {
                ArchiveError::PartialData(format!("post {id} video page without media_info"))
            })?;
            let url = super::resolve_video_url(media, id)?;
            (Some(url), media.get("duration").and_then(Value::as_f64))
        }
        _ => (None, None),
    };

    let mut geo = GeoHint::default();
    if let Some(g) = status.get("geo") {
        if let Some(coords) = g.get("coordinates").and_then(Value::as_array) {
            if let (Some(lat), Some(lng)) = (
                coords.first().and_then(Value::as_f64),
                coords.get(1).and_then(Value::as_f64),
            ) {
                geo.coordinates = Some((lat, lng));
            }
        }
    }
    if let Some(annotations) = status.get("annotations").and_then(Value::as_array) {
        for a in annotations {
            if let Some(place) = a.get("place") {
                geo.poi_id = place
                    .get("poiid")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                geo.name = place
                    .get("title")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }
        }
    }

    let count = |key: &str| -> Result<Option<i64>> {
        match status.get(key) {
            Some(Value::Null) | None => Ok(None),
            Some(v) => parse_count(v).map(Some),
        }
    };

    Ok(PostRecord {
        id,
        bid,
        author,
        created_at,
        text: cleaned.text,
        mentions: cleaned.mentions,
        hashtags: cleaned.hashtags,
        location_chip: cleaned.location_chip,
        region_name: status
            .get("region_name")
            .and_then(Value::as_str)
            .map(|s| s.trim_start_matches("发布于").trim().to_string())
            .filter(|s| !s.is_empty()),
        geo,
        photos,
        declared_photo_count,
        video_url,
        video_duration,
        reposts_count: count("reposts_count")?,
        comments_count: count("comments_count")?,
        attitudes_count: count("attitudes_count")?,
        pinned: status.get("isTop").and_then(Value::as_i64) == Some(1),
        edit_count: status
            .get("edit_count")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
        provenance: Provenance::Weico,
        raw: status.clone(),
    })
}

fn parse_photos(status: &Value) -> Result<Vec<PhotoRef>> {
    let Some(ids) = status.get("pic_ids").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let infos = status.get("pic_infos");
    let live_by_index = parse_pic_video(status.get("pic_video").and_then(Value::as_str));

    let mut out = Vec::with_capacity(ids.len());
    for (i, pid) in ids.iter().enumerate() {
        let pid = pid
            .as_str()
            .ok_or_else(|| ArchiveError::validation("non-string pic_id"))?;
        let Some(info) = infos.and_then(|m| m.get(pid)) else {
            continue;
        };
        let still = info
            .get("original")
            .and_then(|o| o.get("url"))
            .or_else(|| info.get("largest").and_then(|l| l.get("url")))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ArchiveError::validation(format!("pic_infos[{pid}] without an original url"))
            })?;
        out.push(PhotoRef {
            still_url: still.to_string(),
            live_video_url: live_by_index.get(&i).cloned(),
        });
    }
    Ok(out)
}

/// `pic_video` pairs photo indices with live-photo video URLs:
/// `"0:https://v/a.mov,3:https://v/b.mov"`.
fn parse_pic_video(raw: Option<&str>) -> std::collections::HashMap<usize, String> {
    let mut map = std::collections::HashMap::new();
    let Some(raw) = raw else { return map };
    for pair in raw.split(',') {
        if let Some((idx, url)) = pair.split_once(':') {
            if let Ok(idx) = idx.trim().parse::<usize>() {
                if !url.is_empty() {
                    map.insert(idx, url.to_string());
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_status() -> Value {
        json!({
            "id": 4_263_292_843_436_447i64,
            "bid": crate::shortid::encode(4_263_292_843_436_447),
            "created_at": "Thu Aug 20 14:01:02 +0800 2026",
            "text": "山里拍的",
            "user": {
                "id": 1273725432i64,
                "screen_name": "测试用户",
                "avatar_hd": "http://a/hd.jpg",
            },
            "pic_num": 2,
            "pic_ids": ["a", "b"],
            "pic_infos": {
                "a": {"original": {"url": "http://p/a.jpg"}},
                "b": {"original": {"url": "http://p/b.jpg"}},
            },
            "pic_video": "1:http://v/b.mov",
            "annotations": [
                {"place": {"poiid": "B2094757D06FA7FB4199", "title": "黄山风景区"}}
            ],
            "reposts_count": 0,
            "comments_count": 0,
            "attitudes_count": 9,
        })
    }

    #[test]
    fn parses_a_weico_status() {
        let rec = parse_status(&base_status()).unwrap();
        assert_eq!(rec.provenance, Provenance::Weico);
        assert_eq!(rec.photos.len(), 2);
        assert_eq!(rec.photos[0].live_video_url, None);
        assert_eq!(
            rec.photos[1].live_video_url.as_deref(),
            Some("http://v/b.mov")
        );
        assert_eq!(rec.geo.poi_id.as_deref(), Some("B2094757D06FA7FB4199"));
        assert_eq!(rec.geo.name.as_deref(), Some("黄山风景区"));
    }

    #[test]
    fn pic_video_index_map_parses() {
        let map = parse_pic_video(Some("0:http://v/a.mov,3:http://v/b.mov"));
        assert_eq!(map.get(&0).unwrap(), "http://v/a.mov");
        assert_eq!(map.get(&3).unwrap(), "http://v/b.mov");
        assert!(parse_pic_video(None).is_empty());
        assert!(parse_pic_video(Some("garbage")).is_empty());
    }

    #[test]
    fn counters_of_zero_are_kept() {
        let rec = parse_status(&base_status()).unwrap();
        assert_eq!(rec.reposts_count, Some(0));
        assert_eq!(rec.attitudes_count, Some(9));
    }
}
