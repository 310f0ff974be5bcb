// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! The per-author fetch loop.
//!
//! Polling is sequential and naive: walk the timeline pages forward, stop
//! as soon as an in-order post is older than the last-fetch watermark, skip
//! pinned posts instead of treating them as the termination signal. Every
//! per-item failure is logged into the transcript and the walk continues;
//! nothing short of the timeline endpoint itself failing aborts a cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::cards::{mobile, parse_author, web, weico, PostRecord};
use crate::config::Config;
use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::history;
use crate::location::{note_divergence, LocationResolver};
use crate::media::{jobs_for_post, MediaJob, MediaPool, MediaReport};
use crate::models::author::{Author, ProfileDetail};
use crate::models::cursor::FetchCursor;
use crate::models::edge::{NewSocialEdge, SocialEdge};
use crate::models::post::{Post, PostCache};
use crate::session::{Pacer, Session, SessionKind};
use crate::shortid;
use crate::transcript::Transcript;

const TIMELINE_URL: &str = "https://m.weibo.cn/api/container/getIndex?containerid=107603";
const PROFILE_URL: &str = "https://m.weibo.cn/api/container/getIndex?containerid=100505";
const PROFILE_INFO_URL: &str = "https://m.weibo.cn/api/container/getIndex?containerid=230283";
const FANS_URL: &str = "https://m.weibo.cn/api/container/getIndex?containerid=231051_-_fans_-_";
const DETAIL_URL: &str = "https://m.weibo.cn/statuses/show?id=";
const DETAIL_PAGE_URL: &str = "https://m.weibo.cn/detail/";
const EDIT_HISTORY_URL: &str = "https://api.weibo.cn/2/statuses/edit_history?mid=";

pub struct Archiver {
    db: Arc<Database>,
    config: Config,
    session: Arc<Session>,
    /// Alternate identity for posts the primary login cannot see.
    art: Option<Arc<Session>>,
    resolver: LocationResolver,
    pacer: Pacer,
    pub transcript: Transcript,
}

impl Archiver {
    pub fn new(db: Arc<Database>, config: Config) -> Result<Self> {
        let session = Arc::new(Session::new(
            SessionKind::Main,
            &config.session,
            &config.fetch,
        )?);
        let art = match config.session.art_cookie {
            Some(_) => Some(Arc::new(Session::new(
                SessionKind::Art,
                &config.session,
                &config.fetch,
            )?)),
            None => None,
        };
        Ok(Archiver {
            db,
            pacer: Pacer::new(config.fetch.clone()),
            config,
            session,
            art,
            resolver: LocationResolver::new(),
            transcript: Transcript::new(),
        })
    }

    /// Register an author for polling and archive their profile.
    pub async fn add_user(&mut self, uid: i64) -> Result<Author> {
        let url = format!("{PROFILE_URL}{uid}");
        let data = self.session.get_data(&url).await?;
        let user = data
            .get("userInfo")
            .ok_or_else(|| ArchiveError::validation(format!("profile {uid} without userInfo")))?;
        let rec = parse_author(user)?;
        self.pacer.pause().await;

        let detail = self.fetch_profile_detail(uid).await;
        let details = match detail {
            Ok(d) => vec![d],
            Err(e) => {
                warn!(uid, error = %e, "profile detail unavailable, keeping summary only");
                vec![]
            }
        };
        let author = Author::upsert(&self.db, &mut self.transcript, &rec, &details, false).await?;
        FetchCursor::register(&self.db, uid).await?;
        info!(uid, screen_name = %author.screen_name, "author registered");
        Ok(author)
    }

    async fn fetch_profile_detail(&self, uid: i64) -> Result<ProfileDetail> {
        let url = format!("{PROFILE_INFO_URL}{uid}_-_INFO");
        let data = self.session.get_data(&url).await?;
        Ok(parse_profile_items(&data))
    }

    /// One full fetch cycle for one author.
    pub async fn fetch_author(&mut self, uid: i64) -> Result<()> {
        let cursor = match FetchCursor::get(&self.db, uid).await? {
            Some(c) => c,
            None => {
                // First contact: the author row must exist before a cursor
                // can reference it.
                self.add_user(uid).await?;
                FetchCursor::get(&self.db, uid).await?.ok_or_else(|| {
                    ArchiveError::validation(format!("cursor for {uid} vanished after register"))
                })?
            }
        };
        let watermark = cursor.last_fetched_at;
        let cycle_started = Utc::now();
        info!(uid, ?watermark, "fetch cycle starting");

        let mut media_jobs: Vec<MediaJob> = Vec::new();
        let mut page = 1u32;
        'pages: loop {
            let url = format!("{TIMELINE_URL}{uid}&page={page}");
            let data = self.session.get_data(&url).await?;
            self.pacer.pause().await;

            let cards = data
                .get("cards")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if cards.is_empty() {
                debug!(uid, page, "empty timeline page, walk complete");
                break;
            }

            for card in &cards {
                let rec = match mobile::parse_card(card) {
                    Ok(Some(rec)) => rec,
                    Ok(None) => continue,
                    Err(e) => {
                        self.transcript
                            .skipped(&format!("author {uid} timeline page {page}"), &e.to_string());
                        continue;
                    }
                };

                if let Some(mark) = watermark {
                    if rec.created_at.with_timezone(&Utc) <= mark {
                        if rec.pinned {
                            debug!(post = rec.id, "pinned post older than watermark, skipping");
                            continue;
                        }
                        debug!(post = rec.id, "reached the watermark, stopping the walk");
                        break 'pages;
                    }
                }

                let entity = format!("post {}", rec.id);
                match self.process_record(rec, false).await {
                    Ok(jobs) => media_jobs.extend(jobs),
                    Err(e @ ArchiveError::NotFound { .. }) => {
                        self.transcript.skipped(&entity, &e.to_string());
                    }
                    Err(e) => {
                        self.transcript.skipped(&entity, &e.to_string());
                        warn!(entity, error = %e, "item failed, continuing the batch");
                    }
                }
            }
            page += 1;
        }

        let report = self.download_media(media_jobs).await;
        self.refresh_social_graph(uid).await?;
        FetchCursor::complete_cycle(&self.db, uid, cycle_started, None).await?;
        self.transcript.note(
            &format!("author {uid}"),
            &format!(
                "cycle complete: {} downloaded, {} skipped, {} failed",
                report.downloaded, report.skipped, report.failed
            ),
        );
        Ok(())
    }

    /// Archive a single post given its numeric or short ID.
    pub async fn fetch_single_post(&mut self, ident: &str) -> Result<()> {
        let id: i64 = match ident.parse() {
            Ok(n) => n,
            Err(_) => shortid::decode(ident)? as i64,
        };

        let rec = self.fetch_detail(id).await?;
        let jobs = self.process_record(rec, true).await?;
        self.pacer.pause().await;

        // The web page carries fields the mobile card omits; its parse is
        // best-effort on top of the detail fetch.
        match self.fetch_web_status(id).await {
            Ok(Some(rec)) => {
                self.process_record(rec, false).await?;
            }
            Ok(None) => {}
            Err(e) => warn!(post = id, error = %e, "web snapshot unavailable"),
        }

        self.download_media(jobs).await;
        Ok(())
    }

    /// Continuous mode: poll every enabled author, then sleep. Any keypress
    /// shortcuts the sleep, best effort.
    ///
    /// Each cycle's transcript is flushed to its own HTML file next to
    /// `transcript_base` and drained, so a long-running watch never
    /// accumulates entries in memory.
    pub async fn watch(&mut self, transcript_base: &Path) -> Result<()> {
        loop {
            let cursors = FetchCursor::enabled(&self.db).await?;
            if cursors.is_empty() {
                warn!("no enabled authors to watch");
            }
            for cursor in cursors {
                if let Err(e) = self.fetch_author(cursor.author_id).await {
                    warn!(author = cursor.author_id, error = %e, "cycle failed, moving on");
                    self.transcript
                        .skipped(&format!("author {}", cursor.author_id), &e.to_string());
                }
            }
            self.flush_transcript(transcript_base);
            let delay = Duration::from_millis(self.pacer.next_delay().as_millis() as u64 * 10);
            info!(delay_secs = delay.as_secs(), "watch cycle complete, sleeping");
            wait_or_keypress(delay).await;
        }
    }

    /// Write the accumulated transcript to a per-cycle file and empty it.
    /// A failed write keeps the entries for the next attempt.
    fn flush_transcript(&mut self, base: &Path) {
        if self.transcript.is_empty() {
            return;
        }
        let now = Utc::now();
        let path = cycle_transcript_path(base, now);
        let title = format!("watch cycle {}", now.format("%Y-%m-%d %H:%M:%S"));
        match self.transcript.write_html(&path, &title) {
            Ok(()) => {
                let flushed = self.transcript.drain().len();
                info!(path = %path.display(), entries = flushed, "transcript flushed");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e,
                      "transcript flush failed, keeping entries in memory");
            }
        }
    }

    pub async fn prune_edges(&self, uid: i64, gender: &str) -> Result<usize> {
        SocialEdge::prune_by_gender(&self.db, uid, gender).await
    }

    /// Take an author out of the polling rotation without touching their
    /// archived data. Returns whether a cursor existed.
    pub async fn disable_user(&self, uid: i64) -> Result<bool> {
        FetchCursor::disable(&self.db, uid).await
    }

    /// Normalize, reconcile, and persist one parsed record. Returns the
    /// media jobs its photos and video imply.
    async fn process_record(
        &mut self,
        mut rec: PostRecord,
        full_refresh: bool,
    ) -> Result<Vec<MediaJob>> {
        let mut full_refresh = full_refresh;

        // Summary cards cap inline photos at nine; one detail re-fetch
        // replaces the summary before anything is persisted.
        if rec.needs_detail_refetch() {
            match self.fetch_detail(rec.id).await {
                Ok(detail) => {
                    debug!(post = rec.id, "detail re-fetch replaced the summary card");
                    rec = detail;
                    full_refresh = true;
                }
                Err(e) => {
                    warn!(post = rec.id, error = %e, "detail re-fetch failed, keeping summary");
                }
            }
            self.pacer.pause().await;
        }

        let stored = Post::get(&self.db, rec.id).await?;
        if rec.edit_count > stored.as_ref().map(|s| s.edit_count).unwrap_or(0) {
            if let Err(e) = self.merge_edit_history(&mut rec).await {
                warn!(post = rec.id, error = %e, "edit history unavailable");
            }
        }

        self.resolve_location(&mut rec).await?;

        Author::upsert(&self.db, &mut self.transcript, &rec.author, &[], false).await?;
        Post::upsert(
            &self.db,
            &mut self.transcript,
            &rec,
            self.config.fetch.source_precedence,
            full_refresh,
        )
        .await?;
        PostCache::store_snapshot(&self.db, rec.id, rec.provenance, &rec.raw).await?;

        Ok(jobs_for_post(
            &self.config.media.download_dir,
            &rec.author.screen_name,
            &rec,
        ))
    }

    /// Full-detail fetch, falling back to the art identity when the primary
    /// login is not allowed to see the post.
    async fn fetch_detail(&self, id: i64) -> Result<PostRecord> {
        let url = format!("{DETAIL_URL}{id}");
        match self.session.get_data(&url).await {
            Ok(data) => mobile::parse_mblog(&data),
            Err(ArchiveError::NotFound { reason, url }) => {
                let Some(art) = &self.art else {
                    return Err(ArchiveError::NotFound { reason, url });
                };
                debug!(post = id, "primary identity denied, retrying as art");
                let data = art.get_data(&url).await?;
                mobile::parse_mblog(&data)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_web_status(&self, id: i64) -> Result<Option<PostRecord>> {
        let url = format!("{DETAIL_PAGE_URL}{id}");
        let html = self.session.get_text(&url).await?;
        let render = web::extract_render_data(&html, &url)?;
        let status = match render.get("status") {
            Some(s) => s,
            None => return Ok(None),
        };
        web::parse_status(status).map(Some)
    }

    /// Fetch the edit chain and fold it into the record. The raw chain is
    /// kept in the cache side table; the merged photos, location, and region
    /// replace the record's own before the upsert sees it.
    async fn merge_edit_history(&mut self, rec: &mut PostRecord) -> Result<()> {
        let mut url = format!("{EDIT_HISTORY_URL}{}", rec.id);
        for (k, v) in self.session.kind.signature() {
            url.push_str(&format!("&{k}={v}"));
        }
        let data = self.session.get_data(&url).await?;
        let raw_chain = data
            .get("statuses")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if raw_chain.is_empty() {
            return Ok(());
        }

        // The endpoint returns newest first; the reconciler wants oldest.
        let mut snapshots: Vec<Result<PostRecord>> = raw_chain
            .iter()
            .rev()
            .map(weico::parse_status)
            .collect();
        snapshots.push(Ok(rec.clone()));
        let merged = history::reconcile(rec.id, snapshots, &mut self.transcript);
        if merged.skipped > 0 {
            self.transcript.note(
                &format!("post {}", rec.id),
                &format!("{} edit snapshots were unparseable", merged.skipped),
            );
        }

        rec.photos = merged.photos;
        if let Some(geo) = merged.location {
            rec.geo = geo;
        }
        if merged.region_name.is_some() {
            rec.region_name = merged.region_name;
        }

        PostCache::store_edit_history(&self.db, rec.id, &Value::Array(raw_chain)).await?;
        Ok(())
    }

    /// Resolve the record's place identifier and reconcile its coordinates
    /// with the ones the card itself carried.
    async fn resolve_location(&mut self, rec: &mut PostRecord) -> Result<()> {
        let Some(poi) = rec.geo.poi_id.clone() else {
            return Ok(());
        };
        let place = match self.resolver.resolve(&*self.session, &*self.db, &poi).await {
            Ok(Some(place)) => place,
            Ok(None) => {
                self.transcript
                    .note(&format!("post {}", rec.id), &format!("place {poi} deleted upstream"));
                return Ok(());
            }
            Err(e) => {
                warn!(post = rec.id, poi, error = %e, "place resolution failed");
                return Ok(());
            }
        };

        if let Some(own) = rec.geo.coordinates {
            note_divergence(rec.id, (place.latitude, place.longitude), own);
        } else {
            rec.geo.coordinates = Some((place.latitude, place.longitude));
        }
        if rec.geo.name.is_none() {
            rec.geo.name = Some(place.name.clone());
        } else if let Some(name) = &rec.geo.name {
            // A longer free-text name containing the stored one is more
            // specific; back-fill it.
            if name.contains(&place.name) && name.len() > place.name.len() {
                self.resolver.backfill_name(&*self.db, &poi, name).await?;
            }
        }
        Ok(())
    }

    async fn refresh_social_graph(&mut self, uid: i64) -> Result<()> {
        let url = format!("{FANS_URL}{uid}");
        let data = match self.session.get_data(&url).await {
            Ok(d) => d,
            Err(e) => {
                warn!(uid, error = %e, "follower list unavailable");
                return Ok(());
            }
        };
        self.pacer.pause().await;

        let mut seen = 0usize;
        for card in data
            .get("cards")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            for item in card
                .get("card_group")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(user) = item.get("user") else { continue };
                let friend = match parse_author(user) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(uid, error = %e, "skipping unparseable follower entry");
                        continue;
                    }
                };
                SocialEdge::upsert(
                    &self.db,
                    NewSocialEdge {
                        subject_id: uid,
                        friend_id: friend.id,
                        bi_follow: friend.following && friend.follow_me,
                        gender: friend.gender.clone(),
                        profile_snapshot: Some(user.clone()),
                    },
                )
                .await?;
                seen += 1;
            }
        }
        debug!(uid, seen, "social graph refreshed");
        Ok(())
    }

    async fn download_media(&self, jobs: Vec<MediaJob>) -> MediaReport {
        if jobs.is_empty() {
            return MediaReport::default();
        }
        let pool = MediaPool::new(Arc::clone(&self.session), self.config.media.clone());
        pool.run(jobs).await
    }
}

/// Sibling path for one watch cycle's transcript: `transcript.html`
/// becomes `transcript-20260826T120000.html`.
fn cycle_transcript_path(base: &Path, at: DateTime<Utc>) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("transcript");
    let ext = base
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("html");
    base.with_file_name(format!("{stem}-{}.{ext}", at.format("%Y%m%dT%H%M%S")))
}

/// Sleep for `delay`, returning early on any stdin byte. Best effort: a
/// detached stdin just means the full sleep happens.
async fn wait_or_keypress(delay: Duration) {
    let mut buf = [0u8; 1];
    let mut stdin = tokio::io::stdin();
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        read = stdin.read(&mut buf) => {
            if matches!(read, Ok(n) if n > 0) {
                info!("keypress, skipping the rest of the sleep");
            }
        }
    }
}

/// Parse the item list of a profile-info container into profile fields.
/// Items are `item_name`/`item_content` pairs with Chinese labels.
pub fn parse_profile_items(data: &Value) -> ProfileDetail {
    let mut detail = ProfileDetail {
        source: "profile-info",
        ..Default::default()
    };
    for card in data
        .get("cards")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for item in card
            .get("card_group")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(name), Some(content)) = (
                item.get("item_name").and_then(Value::as_str),
                item.get("item_content").and_then(Value::as_str),
            ) else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            match name {
                "生日" => detail.birthday = Some(content.to_string()),
                "所在地" => detail.location = Some(content.to_string()),
                "家乡" => detail.hometown = Some(content.to_string()),
                "简介" => detail.description = Some(content.to_string()),
                "性别" => detail.gender = Some(content.to_string()),
                "昵称备注" => detail.remark = Some(content.to_string()),
                "大学" | "高中" | "公司" => detail.education.push(content.to_string()),
                _ => debug!(item = name, "ignoring unknown profile item"),
            }
        }
    }
    detail
}
