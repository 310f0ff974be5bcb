// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Bounded media download pool.
//!
//! Media URLs are independent of one another, so they download concurrently
//! under a semaphore once the owning batch has been persisted. Every target
//! path is skip-if-exists, which makes a re-run of the same batch free.
//!
//! When enabled, provenance (author, source URL, creation time, sequence
//! number) is embedded into each downloaded file by an external `exiftool`
//! child process. exiftool leaves a `<file>_original` sidecar behind; it is
//! removed whether the embed succeeded or not.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cards::{PhotoRef, PostRecord};
use crate::config::MediaConfig;
use crate::error::{ArchiveError, Result};
use crate::session::Session;

/// Provenance embedded into a downloaded file.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub author: String,
    pub source_url: String,
    pub created_at: DateTime<FixedOffset>,
    pub sequence: u32,
}

#[derive(Debug, Clone)]
pub struct MediaJob {
    pub url: String,
    pub path: PathBuf,
    pub provenance: Provenance,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MediaReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// File extension from a media URL, defaulting to jpg for extensionless
/// CDN paths.
fn url_extension(url: &str) -> String {
    url.split('?')
        .next()
        .and_then(|p| p.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 4)
        .unwrap_or_else(|| "jpg".to_string())
}

/// Target path for one media file: `<dir>/<author>/<post-id>_<seq>.<ext>`.
pub fn target_path(dir: &Path, author: &str, post_id: i64, sequence: u32, url: &str) -> PathBuf {
    dir.join(author)
        .join(format!("{post_id}_{sequence:02}.{}", url_extension(url)))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push("_original");
    PathBuf::from(s)
}

/// Expand a parsed post into its media jobs: every still, every live-photo
/// companion, and the post video, in stable sequence order.
pub fn jobs_for_post(dir: &Path, author: &str, rec: &PostRecord) -> Vec<MediaJob> {
    let mut jobs = Vec::new();
    let mut seq = 0u32;
    let mut push = |url: &str| {
        jobs.push(MediaJob {
            url: url.to_string(),
            path: target_path(dir, author, rec.id, seq, url),
            provenance: Provenance {
                author: author.to_string(),
                source_url: url.to_string(),
                created_at: rec.created_at,
                sequence: seq,
            },
        });
        seq += 1;
    };
    for PhotoRef {
        still_url,
        live_video_url,
    } in &rec.photos
    {
        push(still_url);
        if let Some(video) = live_video_url {
            push(video);
        }
    }
    if let Some(video) = &rec.video_url {
        push(video);
    }
    jobs
}

pub struct MediaPool {
    session: Arc<Session>,
    config: MediaConfig,
}

impl MediaPool {
    pub fn new(session: Arc<Session>, config: MediaConfig) -> Self {
        MediaPool { session, config }
    }

    /// Run all jobs to completion. Individual failures are logged and
    /// counted, never propagated; one bad CDN URL must not sink a batch.
    pub async fn run(&self, jobs: Vec<MediaJob>) -> MediaReport {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut report = MediaReport::default();

        for job in jobs {
            if job.path.exists() {
                debug!(path = %job.path.display(), "media already on disk, skipping");
                report.skipped += 1;
                continue;
            }
            let session = Arc::clone(&self.session);
            let semaphore = Arc::clone(&semaphore);
            let embed = self.config.embed_provenance;
            let exiftool = self.config.exiftool_path.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                fetch_one(&session, &job, embed, &exiftool).await.map_err(|e| (job, e))
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => report.downloaded += 1,
                Ok(Err((job, e))) => {
                    warn!(url = job.url, path = %job.path.display(), error = %e,
                          "media download failed");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "media task panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            "media batch finished"
        );
        report
    }
}

async fn fetch_one(session: &Session, job: &MediaJob, embed: bool, exiftool: &str) -> Result<()> {
    session.download(&job.url, &job.path).await?;
    if embed {
        embed_provenance(exiftool, &job.path, &job.provenance).await?;
    }
    Ok(())
}

/// Tag the file via exiftool. The `_original` sidecar is removed on every
/// path out of here, including failure.
async fn embed_provenance(exiftool: &str, path: &Path, prov: &Provenance) -> Result<()> {
    let status = Command::new(exiftool)
        .arg(format!("-Artist={}", prov.author))
        .arg(format!("-Source={}", prov.source_url))
        .arg(format!(
            "-CreateDate={}",
            prov.created_at.format("%Y:%m:%d %H:%M:%S%z")
        ))
        .arg(format!("-Comment=sequence {}", prov.sequence))
        .arg(path)
        .status()
        .await;

    let sidecar = sidecar_path(path);
    if let Err(e) = tokio::fs::remove_file(&sidecar).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %sidecar.display(), error = %e, "failed to remove exiftool sidecar");
        }
    }

    let status = status?;
    if !status.success() {
        return Err(ArchiveError::validation(format!(
            "exiftool exited with {status} for {}",
            path.display()
        )));
    }
    Ok(())
}
