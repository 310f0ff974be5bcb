// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Authenticated HTTP sessions against the upstream endpoints.
//!
//! Two logical identities exist: the primary login and an alternate "art"
//! account used to read posts the primary one is not allowed to see. The
//! identity is an explicit value on every [`Session`], never ambient state.
//!
//! Transient network failures and rate limits are retried forever with a
//! fixed cooldown; a 404 or an upstream "gone" marker is terminal for the
//! item and surfaces as [`ArchiveError::NotFound`].

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cards::unwrap_envelope;
use crate::config::{FetchConfig, SessionConfig};
use crate::error::{ArchiveError, Result};

/// Which login identity a session speaks as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Main,
    Art,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Main => "main",
            SessionKind::Art => "art",
        }
    }

    /// Client-signature query parameters the weico-shaped endpoints expect.
    pub fn signature(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            SessionKind::Main => &[("from", "10DA193010"), ("c", "weicoabroad")],
            SessionKind::Art => &[("from", "10DA093010"), ("c", "weicoabroad")],
        }
    }
}

#[derive(Debug)]
pub struct Session {
    client: Client,
    cookie: String,
    pub kind: SessionKind,
    cooldown: Duration,
}

impl Session {
    pub fn new(kind: SessionKind, session: &SessionConfig, fetch: &FetchConfig) -> Result<Session> {
        let cookie = match kind {
            SessionKind::Main => session.main_cookie.clone(),
            SessionKind::Art => session.art_cookie.clone().ok_or_else(|| {
                ArchiveError::validation("art session requested but ART_COOKIE is not set")
            })?,
        };
        let client = Client::builder()
            .user_agent(session.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Session {
            client,
            cookie,
            kind,
            cooldown: Duration::from_secs(fetch.cooldown_secs),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        loop {
            let sent = self
                .client
                .get(url)
                .header(reqwest::header::COOKIE, &self.cookie)
                .send()
                .await;
            let resp = match sent {
                Ok(r) => r,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(url, error = %e, cooldown_secs = self.cooldown.as_secs(),
                          "network error, cooling down");
                    tokio::time::sleep(self.cooldown).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match resp.status() {
                StatusCode::NOT_FOUND => {
                    return Err(ArchiveError::NotFound {
                        reason: "http 404".to_string(),
                        url: url.to_string(),
                    });
                }
                s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                    warn!(url, status = %s, cooldown_secs = self.cooldown.as_secs(),
                          "rate limited or upstream error, cooling down");
                    tokio::time::sleep(self.cooldown).await;
                    continue;
                }
                // 401/403 and the like mean a broken or expired login,
                // terminal for the request.
                s if !s.is_success() => {
                    return Err(ArchiveError::validation(format!(
                        "unexpected http status {s} at {url}"
                    )));
                }
                _ => return Ok(resp),
            }
        }
    }

    /// GET a JSON body. Retries network-level trouble forever; leaves
    /// envelope interpretation to the caller.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self.get(url).await?;
        debug!(url, kind = self.kind.as_str(), "fetched json");
        Ok(resp.json().await?)
    }

    /// GET a JSON API envelope and unwrap its `data`, retrying envelope
    /// errors classified as transient.
    pub async fn get_data(&self, url: &str) -> Result<Value> {
        loop {
            let body = self.get_json(url).await?;
            match unwrap_envelope(body, url) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => {
                    warn!(url, error = %e, cooldown_secs = self.cooldown.as_secs(),
                          "transient envelope, cooling down");
                    tokio::time::sleep(self.cooldown).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self.get(url).await?;
        debug!(url, kind = self.kind.as_str(), "fetched page");
        Ok(resp.text().await?)
    }

    /// Download a file to `path`, creating parent directories.
    pub async fn download(&self, url: &str, path: &Path) -> Result<()> {
        let resp = self.get(url).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = resp.bytes().await?;
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Which sleep tier a visit lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Short,
    Break,
    Long,
}

/// Tiered randomized pacing between successive fetches. Every fetch takes a
/// short pause; every `break_every`-th a longer one; every `long_every`-th
/// the longest.
pub struct Pacer {
    cfg: FetchConfig,
    visits: u32,
}

impl Pacer {
    pub fn new(cfg: FetchConfig) -> Self {
        Pacer { cfg, visits: 0 }
    }

    fn tier(&self, visit: u32) -> Tier {
        if visit > 0 && self.cfg.long_every > 0 && visit % self.cfg.long_every == 0 {
            Tier::Long
        } else if visit > 0 && self.cfg.break_every > 0 && visit % self.cfg.break_every == 0 {
            Tier::Break
        } else {
            Tier::Short
        }
    }

    /// Pick the next pause duration and advance the visit counter.
    pub fn next_delay(&mut self) -> Duration {
        self.visits += 1;
        let (min, max) = match self.tier(self.visits) {
            Tier::Short => self.cfg.short_sleep_ms,
            Tier::Break => self.cfg.break_sleep_ms,
            Tier::Long => self.cfg.long_sleep_ms,
        };
        let ms = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    pub async fn pause(&mut self) {
        let delay = self.next_delay();
        debug!(visits = self.visits, delay_ms = delay.as_millis() as u64, "pacing");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourcePrecedence;

    fn cfg() -> FetchConfig {
        FetchConfig {
            short_sleep_ms: (10, 20),
            break_sleep_ms: (100, 200),
            break_every: 5,
            long_sleep_ms: (1000, 2000),
            long_every: 10,
            cooldown_secs: 1,
            source_precedence: SourcePrecedence::WebFirst,
        }
    }

    #[test]
    fn tiers_follow_the_visit_counter() {
        let p = Pacer::new(cfg());
        assert_eq!(p.tier(1), Tier::Short);
        assert_eq!(p.tier(4), Tier::Short);
        assert_eq!(p.tier(5), Tier::Break);
        assert_eq!(p.tier(10), Tier::Long);
        assert_eq!(p.tier(15), Tier::Break);
        assert_eq!(p.tier(20), Tier::Long);
    }

    #[test]
    fn delays_fall_inside_the_tier_range() {
        let mut p = Pacer::new(cfg());
        for _ in 0..4 {
            let d = p.next_delay().as_millis() as u64;
            assert!((10..=20).contains(&d), "short delay {d}");
        }
        let d = p.next_delay().as_millis() as u64;
        assert!((100..=200).contains(&d), "break delay {d}");
    }

    /// Serve one canned HTTP response on a loopback port and return a URL
    /// pointing at it.
    async fn serve_once(status_line: &'static str) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let resp =
                    format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{addr}/x")
    }

    fn session() -> Session {
        let config = SessionConfig {
            main_cookie: "SUB=abc".into(),
            art_cookie: None,
            user_agent: "test".into(),
        };
        Session::new(SessionKind::Main, &config, &cfg()).unwrap()
    }

    #[tokio::test]
    async fn rejected_logins_are_terminal_not_retried() {
        let url = serve_once("HTTP/1.1 403 Forbidden").await;
        let err = session().get_json(&url).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Validation(_)), "got {err:?}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_pages_surface_as_not_found() {
        let url = serve_once("HTTP/1.1 404 Not Found").await;
        let err = session().get_json(&url).await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound { .. }), "got {err:?}");
    }

    #[test]
    fn art_session_requires_its_cookie() {
        let session = SessionConfig {
            main_cookie: "SUB=abc".into(),
            art_cookie: None,
            user_agent: "test".into(),
        };
        let err = Session::new(SessionKind::Art, &session, &cfg()).unwrap_err();
        assert!(matches!(err, ArchiveError::Validation(_)));
        assert!(Session::new(SessionKind::Main, &session, &cfg()).is_ok());
    }
}
