// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::schema::places;

/// A resolved place. Immutable once written, except for name back-fill.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = places)]
pub struct Place {
    pub poi_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub resolved_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable, Serialize, Deserialize)]
#[diesel(table_name = places)]
pub struct NewPlace {
    pub poi_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub resolved_by: String,
}

impl Place {
    pub async fn get(db: &Database, poi: &str) -> Result<Option<Place>> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = places::table
            .find(poi)
            .first::<Place>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    /// Back-fill the name when a post carries a more specific free text.
    /// Returns whether a row changed.
    pub async fn update_name(db: &Database, poi: &str, name: &str) -> Result<bool> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let updated = diesel::update(places::table.find(poi))
            .filter(places::name.ne(name))
            .set(places::name.eq(name))
            .execute(&mut conn)
            .await?;
        if updated > 0 {
            info!(poi, name, "back-filled place name");
        }
        Ok(updated > 0)
    }
}

impl NewPlace {
    pub async fn insert(self, db: &Database) -> Result<Place> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = diesel::insert_into(places::table)
            .values(&self)
            .on_conflict(places::poi_id)
            .do_nothing()
            .returning(Place::as_returning())
            .get_result::<Place>(&mut conn)
            .await
            .optional()?;
        match row {
            Some(row) => Ok(row),
            // Lost a race with a previous insert; the stored row wins.
            None => Place::get(db, &self.poi_id)
                .await?
                .ok_or_else(|| ArchiveError::validation("place vanished during insert")),
        }
    }
}
