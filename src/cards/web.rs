// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Parser for the desktop/web timeline shape.
//!
//! Detail pages embed the post JSON in a `$render_data` script variable; the
//! blob is located by bounded string search and a balanced-brace scan, never
//! by parsing the whole document as a DOM. Web cards name their fields
//! differently from the mobile API: the short ID lives in `mblogid`, photos
//! in a `pic_ids` list keyed into a `pic_infos` map.

use serde_json::Value;

use crate::cards::{
    clean_text, confirm_bid, parse_author, parse_count, parse_created_at, GeoHint, PhotoRef,
    PostRecord, Provenance, GONE_MARKERS,
};
use crate::error::{ArchiveError, Result};

const RENDER_DATA_MARKER: &str = "$render_data";
/// How far past the marker we are willing to look for the opening brace.
const RENDER_DATA_WINDOW: usize = 256;

/// Locate and parse the `$render_data` JSON blob inside a detail page.
pub fn extract_render_data(html: &str, url: &str) -> Result<Value> {
    let Some(marker_at) = html.find(RENDER_DATA_MARKER) else {
        // No blob at all usually means the post page was replaced by an
        // error interstitial.
        if let Some(reason) = GONE_MARKERS.iter().find(|m| html.contains(*m)) {
            return Err(ArchiveError::NotFound {
                reason: (*reason).to_string(),
                url: url.to_string(),
            });
        }
        return Err(ArchiveError::validation(format!(
            "no {RENDER_DATA_MARKER} marker in page at {url}"
        )));
    };

    let window_end = (marker_at + RENDER_DATA_WINDOW).min(html.len());
    let window = &html[marker_at..window_end];
    let open_rel = window
        .find(['{', '['])
        .ok_or_else(|| ArchiveError::validation(format!("no JSON after marker at {url}")))?;
    let start = marker_at + open_rel;

    let blob = balanced_json_slice(&html[start..])
        .ok_or_else(|| ArchiveError::validation(format!("unbalanced render data at {url}")))?;

    let mut value: Value = serde_json::from_str(blob)
        .map_err(|e| ArchiveError::validation(format!("render data is not JSON at {url}: {e}")))?;

    // The page wraps the object in a one-element array (`[{...}][0]`).
    if let Value::Array(mut arr) = value {
        value = arr
            .drain(..)
            .next()
            .ok_or_else(|| ArchiveError::validation(format!("empty render data at {url}")))?;
    }
    Ok(value)
}

/// Return the prefix of `s` that forms one balanced JSON value, honoring
/// string literals and escapes.
fn balanced_json_slice(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let (open, close) = match bytes.first()? {
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse one web-shape status object.
pub fn parse_status(status: &Value) -> Result<PostRecord> {
    let id = status
        .get("id")
        .and_then(Value::as_i64)
        .or_else(|| {
            status
                .get("idstr")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        })
        .ok_or_else(|| ArchiveError::validation("web status without numeric id"))?;
    let bid = confirm_bid(id, status.get("mblogid").and_then(Value::as_str))?;

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

    let cleaned = clean_text(
        status
            .get("text")
            .or_else(|| status.get("text_raw"))
            .and_then(Value::as_str)
            .unwrap_or(""),
    );

    let photos = parse_pic_infos(status)?;
    let declared_photo_count = status
        .get("pic_num")
        .and_then(Value::as_i64)
        .map(|n| n as i32);

    let (video_url, video_duration) = match status.get("page_info") {
        Some(page)
            if matches!(
                page.get("object_type").and_then(Value::as_str),
                Some("video")
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
    geo.name = cleaned.location_chip.clone();

    let region_name = status
        .get("region_name")
        .and_then(Value::as_str)
        .map(|s| s.trim_start_matches("发布于").trim().to_string())
        .filter(|s| !s.is_empty());

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
        region_name,
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
        provenance: Provenance::Web,
        raw: status.clone(),
    })
}

fn parse_pic_infos(status: &Value) -> Result<Vec<PhotoRef>> {
    let Some(ids) = status.get("pic_ids").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let infos = status.get("pic_infos");
    let mut out = Vec::with_capacity(ids.len());
    for pid in ids {
        let pid = pid
            .as_str()
            .ok_or_else(|| ArchiveError::validation("non-string pic_id"))?;
        let Some(info) = infos.and_then(|m| m.get(pid)) else {
            // Summary cards list all IDs but only detail the first nine;
            // the caller notices via the declared-count check.
            continue;
        };
        let still = info
            .get("largest")
            .and_then(|l| l.get("url"))
            .or_else(|| info.get("original").and_then(|o| o.get("url")))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ArchiveError::validation(format!("pic_infos[{pid}] without a largest url"))
            })?;
        let live = (info.get("type").and_then(Value::as_str) == Some("live_photo"))
            .then(|| info.get("video").and_then(Value::as_str))
            .flatten()
            .map(str::to_string);
        out.push(PhotoRef {
            still_url: still.to_string(),
            live_video_url: live,
        });
    }
    Ok(out)
}
