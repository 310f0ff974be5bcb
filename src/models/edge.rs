// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::schema::social_edges;

/// One observed follow relationship around a watched author. Each
/// re-derivation of the same edge bumps `frequency` instead of inserting a
/// duplicate.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = social_edges)]
pub struct SocialEdge {
    pub id: i32,
    pub subject_id: i64,
    pub friend_id: i64,
    pub bi_follow: bool,
    pub gender: Option<String>,
    pub profile_snapshot: Option<Value>,
    pub frequency: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable, Serialize, Deserialize)]
#[diesel(table_name = social_edges)]
pub struct NewSocialEdge {
    pub subject_id: i64,
    pub friend_id: i64,
    pub bi_follow: bool,
    pub gender: Option<String>,
    pub profile_snapshot: Option<Value>,
}

impl SocialEdge {
    /// Insert the edge or bump its frequency when it was seen before.
    pub async fn upsert(db: &Database, edge: NewSocialEdge) -> Result<SocialEdge> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let now = Utc::now();
        let saved = diesel::insert_into(social_edges::table)
            .values(&edge)
            .on_conflict((social_edges::subject_id, social_edges::friend_id))
            .do_update()
            .set((
                social_edges::frequency.eq(social_edges::frequency + 1),
                social_edges::bi_follow.eq(edge.bi_follow),
                social_edges::gender.eq(&edge.gender),
                social_edges::profile_snapshot.eq(&edge.profile_snapshot),
                social_edges::updated_at.eq(now),
            ))
            .returning(SocialEdge::as_returning())
            .get_result::<SocialEdge>(&mut conn)
            .await?;
        Ok(saved)
    }

    /// Drop every edge of the subject whose friend has the given gender.
    /// Returns the number of rows removed.
    pub async fn prune_by_gender(db: &Database, subject_id: i64, gender: &str) -> Result<usize> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let removed = diesel::delete(
            social_edges::table
                .filter(social_edges::subject_id.eq(subject_id))
                .filter(social_edges::gender.eq(gender)),
        )
        .execute(&mut conn)
        .await?;
        if removed > 0 {
            info!(subject_id, gender, removed, "pruned social edges");
        }
        Ok(removed)
    }
}
