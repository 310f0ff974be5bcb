// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::schema::fetch_cursors;

/// Per-author polling state. `last_fetched_at` is the watermark the page
/// walk terminates against; `visit_count` feeds the tiered sleep pacing.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = fetch_cursors)]
pub struct FetchCursor {
    pub author_id: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub visit_count: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable, Serialize, Deserialize)]
#[diesel(table_name = fetch_cursors)]
pub struct NewFetchCursor {
    pub author_id: i64,
    pub enabled: bool,
}

impl FetchCursor {
    pub async fn get(db: &Database, author_id: i64) -> Result<Option<FetchCursor>> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = fetch_cursors::table
            .find(author_id)
            .first::<FetchCursor>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    pub async fn enabled(db: &Database) -> Result<Vec<FetchCursor>> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let rows = fetch_cursors::table
            .filter(fetch_cursors::enabled.eq(true))
            .order(fetch_cursors::author_id.asc())
            .load::<FetchCursor>(&mut conn)
            .await?;
        Ok(rows)
    }

    /// Register an author for polling; re-registering is a no-op apart from
    /// re-enabling a disabled cursor.
    pub async fn register(db: &Database, author_id: i64) -> Result<FetchCursor> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = NewFetchCursor {
            author_id,
            enabled: true,
        };
        let saved = diesel::insert_into(fetch_cursors::table)
            .values(&row)
            .on_conflict(fetch_cursors::author_id)
            .do_update()
            .set(fetch_cursors::enabled.eq(true))
            .returning(FetchCursor::as_returning())
            .get_result::<FetchCursor>(&mut conn)
            .await?;
        Ok(saved)
    }

    /// Advance the watermark after a completed cycle.
    pub async fn complete_cycle(
        db: &Database,
        author_id: i64,
        fetched_at: DateTime<Utc>,
        next_due_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        diesel::update(fetch_cursors::table.find(author_id))
            .set((
                fetch_cursors::last_fetched_at.eq(Some(fetched_at)),
                fetch_cursors::next_due_at.eq(next_due_at),
                fetch_cursors::visit_count.eq(fetch_cursors::visit_count + 1),
                fetch_cursors::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn disable(db: &Database, author_id: i64) -> Result<bool> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let changed = diesel::update(fetch_cursors::table.find(author_id))
            .set((
                fetch_cursors::enabled.eq(false),
                fetch_cursors::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(changed > 0)
    }
}
