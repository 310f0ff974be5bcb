// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Raw-card parsers: one per upstream wire shape.
//!
//! Each parser turns one upstream JSON card into a [`PostRecord`], the
//! loosely-normalized intermediate that the reconciler and the upsert layer
//! consume. A record only carries fields the card actually had; absent or
//! empty upstream values stay `None` rather than becoming empty strings.

pub mod mobile;
pub mod web;
pub mod weico;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::error::{ArchiveError, Result};
use crate::shortid;

/// Separator between a still-image URL and its companion live-photo video
/// URL inside one photo entry. Private-use codepoint so it can never occur
/// in a real URL.
pub const LIVE_PHOTO_DELIMITER: char = '\u{e000}';

/// Quality keys tried, in order, against the upstream media map when a post
/// carries a video. First match wins; a video post matching none of these is
/// a hard parsing failure.
pub const VIDEO_QUALITY_KEYS: &[&str] = &[
    "mp4_720p_mp4",
    "mp4_hd_mp4",
    "mp4_sd_mp4",
    "mp4_ld_mp4",
    "stream_url_hd",
    "stream_url",
];

/// Upstream sentinel meaning "over one million". Normalized to exactly
/// 1_000_000 so counters stay numeric.
pub const OVER_ONE_MILLION: &str = "100万+";

/// Which upstream source/client produced a raw snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Desktop web timeline, JSON blob embedded in an HTML page.
    Web,
    /// m.weibo.cn mobile JSON API.
    Mobile,
    /// The alternate "weico" client API.
    Weico,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Web => "web",
            Provenance::Mobile => "mobile",
            Provenance::Weico => "weico",
        }
    }
}

/// One photo: the still image plus an optional live-photo video companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRef {
    pub still_url: String,
    pub live_video_url: Option<String>,
}

impl PhotoRef {
    pub fn still(url: impl Into<String>) -> Self {
        PhotoRef {
            still_url: url.into(),
            live_video_url: None,
        }
    }

    /// Render as the stored single-string form.
    pub fn to_stored(&self) -> String {
        match &self.live_video_url {
            Some(video) => format!("{}{}{}", self.still_url, LIVE_PHOTO_DELIMITER, video),
            None => self.still_url.clone(),
        }
    }

    pub fn from_stored(s: &str) -> Self {
        match s.split_once(LIVE_PHOTO_DELIMITER) {
            Some((still, video)) => PhotoRef {
                still_url: still.to_string(),
                live_video_url: Some(video.to_string()),
            },
            None => PhotoRef::still(s),
        }
    }
}

/// Location hints as a card carries them, before resolution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoHint {
    pub name: Option<String>,
    pub poi_id: Option<String>,
    pub coordinates: Option<(f64, f64)>,
}

impl GeoHint {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.poi_id.is_none() && self.coordinates.is_none()
    }
}

/// Author block as attached to a card.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorRecord {
    pub id: i64,
    pub screen_name: String,
    pub avatar_url: Option<String>,
    pub following: bool,
    pub follow_me: bool,
    pub verified: bool,
    pub gender: Option<String>,
    pub description: Option<String>,
    pub followers_count: Option<i64>,
    pub follow_count: Option<i64>,
    pub statuses_count: Option<i64>,
}

/// Loosely-normalized post record: parsed, not yet reconciled against edit
/// history and not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub id: i64,
    pub bid: String,
    pub author: AuthorRecord,
    pub created_at: DateTime<FixedOffset>,
    pub text: Option<String>,
    pub mentions: Vec<String>,
    pub hashtags: Vec<String>,
    pub location_chip: Option<String>,
    pub region_name: Option<String>,
    pub geo: GeoHint,
    pub photos: Vec<PhotoRef>,
    pub declared_photo_count: Option<i32>,
    pub video_url: Option<String>,
    pub video_duration: Option<f64>,
    pub reposts_count: Option<i64>,
    pub comments_count: Option<i64>,
    pub attitudes_count: Option<i64>,
    pub pinned: bool,
    pub edit_count: i32,
    pub provenance: Provenance,
    /// Raw upstream card, kept for the cache side-table.
    pub raw: Value,
}

impl PostRecord {
    /// Whether the summary card declares more photos than it actually
    /// contains. Summary cards cap inline photo detail at nine; anything
    /// beyond that needs a full-detail re-fetch.
    pub fn needs_detail_refetch(&self) -> bool {
        match self.declared_photo_count {
            Some(declared) => declared as usize > self.photos.len(),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared extraction helpers
// ---------------------------------------------------------------------------

/// Parse the fixed-format locale timestamp (`Thu Aug 20 14:01:02 +0800 2026`)
/// and verify the offset is the network's local one.
pub fn parse_created_at(raw: &str) -> Result<DateTime<FixedOffset>> {
    let parsed = DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y")
        .map_err(|e| ArchiveError::validation(format!("bad created_at {raw:?}: {e}")))?;
    if parsed.offset().local_minus_utc() != 8 * 3600 {
        return Err(ArchiveError::validation(format!(
            "created_at {raw:?} is not in +08:00 local time"
        )));
    }
    Ok(parsed)
}

/// Normalize an engagement counter. Accepts plain numbers, numeric strings,
/// and the `100万+` over-one-million sentinel.
pub fn parse_count(value: &Value) -> Result<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(s) = value.as_str() {
        if s == OVER_ONE_MILLION {
            return Ok(1_000_000);
        }
        if let Ok(n) = s.parse::<i64>() {
            return Ok(n);
        }
        if let Some(wan) = s.strip_suffix('万') {
            if let Ok(f) = wan.parse::<f64>() {
                return Ok((f * 10_000.0) as i64);
            }
        }
    }
    Err(ArchiveError::validation(format!(
        "unparseable engagement counter {value:?}"
    )))
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static BR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<br\s*/?>").expect("static regex"));
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([\w一-鿿\-]+)").expect("static regex"));
static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([^#\s]{1,64})#").expect("static regex"));
static LOCATION_CHIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    // The "2" map-pin icon span followed by the place name anchor text.
    Regex::new(r#"<span class="url-icon">.*?</span><span class="surl-text">([^<]+)</span>"#)
        .expect("static regex")
});

/// Output of [`clean_text`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanedText {
    pub text: Option<String>,
    pub mentions: Vec<String>,
    pub hashtags: Vec<String>,
    pub location_chip: Option<String>,
}

/// Strip the HTML wrapping from a card's text body and pull embedded
/// at-mentions, hashtags and location chips out into structured fields.
pub fn clean_text(raw: &str) -> CleanedText {
    let mut out = CleanedText::default();

    if let Some(cap) = LOCATION_CHIP_RE.captures(raw) {
        out.location_chip = Some(cap[1].trim().to_string());
    }

    let with_newlines = BR_RE.replace_all(raw, "\n");
    let mut text = TAG_RE.replace_all(&with_newlines, "").to_string();

    for cap in MENTION_RE.captures_iter(&text) {
        out.mentions.push(cap[1].to_string());
    }
    for cap in HASHTAG_RE.captures_iter(&text) {
        out.hashtags.push(cap[1].to_string());
    }

    text = MENTION_RE.replace_all(&text, "").to_string();
    text = HASHTAG_RE.replace_all(&text, "").to_string();
    if let Some(chip) = &out.location_chip {
        text = text.replace(chip.as_str(), "");
    }

    let text = text.trim().to_string();
    if !text.is_empty() {
        out.text = Some(text);
    }
    out
}

/// Resolve the post-level video URL out of an upstream media map by trying
/// the preference-ordered quality keys. A media map with none of them is a
/// hard failure, not a silent skip.
pub fn resolve_video_url(media_info: &Value, post_id: i64) -> Result<String> {
    for key in VIDEO_QUALITY_KEYS {
        if let Some(url) = media_info.get(key).and_then(Value::as_str) {
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
    }
    Err(ArchiveError::PartialData(format!(
        "post {post_id} has a video but no known quality key in its media map"
    )))
}

/// Verify the short ID against the numeric one; compute it when missing.
/// An upstream bid that disagrees with the computed one is a validation
/// failure, not something to trust.
pub fn confirm_bid(id: i64, upstream_bid: Option<&str>) -> Result<String> {
    let computed = shortid::encode(id as u64);
    match upstream_bid {
        Some(bid) if !bid.is_empty() => {
            if bid != computed {
                return Err(ArchiveError::validation(format!(
                    "post {id}: upstream bid {bid:?} disagrees with computed {computed:?}"
                )));
            }
            Ok(computed)
        }
        _ => Ok(computed),
    }
}

/// Parse the `user` block attached to a card. The three sources agree on
/// the core fields; avatar naming drifts between them.
pub fn parse_author(user: &Value) -> Result<AuthorRecord> {
    let id = match user.get("id") {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ArchiveError::validation("user id out of range"))?,
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| ArchiveError::validation(format!("non-numeric user id {s:?}")))?,
        _ => return Err(ArchiveError::validation("user block without id")),
    };
    let screen_name = user
        .get("screen_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ArchiveError::validation(format!("user {id} without screen_name")))?
        .to_string();
    let avatar_url = ["avatar_hd", "avatar_large", "profile_image_url"]
        .iter()
        .find_map(|k| user.get(k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let opt_count = |key: &str| -> Result<Option<i64>> {
        match user.get(key) {
            Some(Value::Null) | None => Ok(None),
            Some(v) => parse_count(v).map(Some),
        }
    };

    Ok(AuthorRecord {
        id,
        screen_name,
        avatar_url,
        following: user.get("following").and_then(Value::as_bool).unwrap_or(false),
        follow_me: user.get("follow_me").and_then(Value::as_bool).unwrap_or(false),
        verified: user.get("verified").and_then(Value::as_bool).unwrap_or(false),
        gender: user
            .get("gender")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        description: user
            .get("description")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        followers_count: opt_count("followers_count")?,
        follow_count: opt_count("follow_count")?.or(opt_count("friends_count")?),
        statuses_count: opt_count("statuses_count")?,
    })
}

/// Markers in upstream error messages that mean "gone", not "try again".
/// Kept verbatim as a fallback for responses without a usable error code.
pub const GONE_MARKERS: &[&str] = &[
    "微博不存在或暂无查看权限",
    "这条微博不存在",
    "该账号因被投诉违反法律法规和《微博举报投诉操作细则》的相关规定",
    "用户不存在",
    "已删除",
];

/// Check a JSON API envelope for the "gone" condition and unwrap its data.
pub fn unwrap_envelope(body: Value, url: &str) -> Result<Value> {
    let ok = body.get("ok").and_then(Value::as_i64).unwrap_or(1);
    if ok == 1 {
        return Ok(body.get("data").cloned().unwrap_or(body));
    }
    let msg = body
        .get("msg")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if GONE_MARKERS.iter().any(|m| msg.contains(m)) {
        return Err(ArchiveError::NotFound {
            reason: msg,
            url: url.to_string(),
        });
    }
    Err(ArchiveError::Transient(format!(
        "upstream envelope not ok ({msg:?}) at {url}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_accept_numbers_and_sentinels() {
        assert_eq!(parse_count(&json!(42)).unwrap(), 42);
        assert_eq!(parse_count(&json!("42")).unwrap(), 42);
        assert_eq!(parse_count(&json!("100万+")).unwrap(), 1_000_000);
        assert_eq!(parse_count(&json!("3万")).unwrap(), 30_000);
        assert!(parse_count(&json!("soon")).is_err());
    }

    #[test]
    fn created_at_must_be_local_time() {
        let ok = parse_created_at("Thu Aug 20 14:01:02 +0800 2026").unwrap();
        assert_eq!(ok.timezone().local_minus_utc(), 8 * 3600);
        assert!(parse_created_at("Thu Aug 20 14:01:02 +0000 2026").is_err());
        assert!(parse_created_at("2026-08-20 14:01:02").is_err());
    }

    #[test]
    fn text_cleanup_extracts_markup() {
        let raw = r#"出发啦 <a href="/n/小伙伴">@小伙伴</a> #环游# <br/>明天见<span class="url-icon"><img src="pin.png"></span><span class="surl-text">外滩</span>"#;
        let cleaned = clean_text(raw);
        assert_eq!(cleaned.mentions, vec!["小伙伴"]);
        assert_eq!(cleaned.hashtags, vec!["环游"]);
        assert_eq!(cleaned.location_chip.as_deref(), Some("外滩"));
        let text = cleaned.text.unwrap();
        assert!(text.starts_with("出发啦"));
        assert!(text.contains("明天见"));
        assert!(!text.contains('<'));
        assert!(!text.contains("外滩"));
    }

    #[test]
    fn video_prefers_higher_quality() {
        let media = json!({
            "mp4_ld_mp4": "http://v/ld.mp4",
            "mp4_720p_mp4": "http://v/720.mp4",
        });
        assert_eq!(resolve_video_url(&media, 1).unwrap(), "http://v/720.mp4");

        let none = json!({"unrelated": "x"});
        assert!(matches!(
            resolve_video_url(&none, 1),
            Err(ArchiveError::PartialData(_))
        ));
    }

    #[test]
    fn bid_is_computed_not_trusted() {
        let id = 4_263_292_843_436_447i64;
        let computed = crate::shortid::encode(id as u64);
        assert_eq!(confirm_bid(id, None).unwrap(), computed);
        assert_eq!(confirm_bid(id, Some(&computed)).unwrap(), computed);
        assert!(confirm_bid(id, Some("bogus")).is_err());
    }

    #[test]
    fn envelope_distinguishes_gone_from_transient() {
        let gone = json!({"ok": 0, "msg": "微博不存在或暂无查看权限"});
        match unwrap_envelope(gone, "http://x/1") {
            Err(ArchiveError::NotFound { reason, url }) => {
                assert!(reason.contains("不存在"));
                assert_eq!(url, "http://x/1");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }

        let flaky = json!({"ok": 0, "msg": "系统繁忙"});
        assert!(matches!(
            unwrap_envelope(flaky, "http://x/1"),
            Err(ArchiveError::Transient(_))
        ));

        let fine = json!({"ok": 1, "data": {"k": "v"}});
        assert_eq!(unwrap_envelope(fine, "u").unwrap(), json!({"k": "v"}));
    }

    #[test]
    fn live_photo_round_trips_through_storage() {
        let p = PhotoRef {
            still_url: "http://p/1.jpg".into(),
            live_video_url: Some("http://p/1.mov".into()),
        };
        assert_eq!(PhotoRef::from_stored(&p.to_stored()), p);
        let plain = PhotoRef::still("http://p/2.jpg");
        assert_eq!(PhotoRef::from_stored(&plain.to_stored()), plain);
    }
}
