// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::cards::AuthorRecord;
use crate::db::Database;
use crate::error::{ArchiveError, Result};
use crate::models::merge::{merge_clearable, merge_count, merge_field, merge_union};
use crate::schema::authors;
use crate::transcript::Transcript;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = authors)]
pub struct Author {
    pub id: i64,
    pub screen_name: String,
    pub remark: Option<String>,
    pub gender: Option<String>,
    pub birthday: Option<String>,
    pub location: Option<String>,
    pub hometown: Option<String>,
    pub description: Option<String>,
    pub education: Option<String>,
    pub followed_by: Option<String>,
    pub avatar_url: Option<String>,
    pub verified: bool,
    pub following: bool,
    pub follow_me: bool,
    pub followers_count: Option<i64>,
    pub follow_count: Option<i64>,
    pub statuses_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = authors)]
#[diesel(treat_none_as_null = true)]
pub struct NewAuthor {
    pub id: i64,
    pub screen_name: String,
    pub remark: Option<String>,
    pub gender: Option<String>,
    pub birthday: Option<String>,
    pub location: Option<String>,
    pub hometown: Option<String>,
    pub description: Option<String>,
    pub education: Option<String>,
    pub followed_by: Option<String>,
    pub avatar_url: Option<String>,
    pub verified: bool,
    pub following: bool,
    pub follow_me: bool,
    pub followers_count: Option<i64>,
    pub follow_count: Option<i64>,
    pub statuses_count: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields as one of the three profile endpoints reports them.
/// Any field present in more than one endpoint must agree; disagreements
/// surface as conflict lines, never as silent drops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileDetail {
    pub source: &'static str,
    pub remark: Option<String>,
    pub gender: Option<String>,
    pub birthday: Option<String>,
    pub location: Option<String>,
    pub hometown: Option<String>,
    pub description: Option<String>,
    pub education: Vec<String>,
    pub followed_by: Vec<String>,
}

impl Author {
    pub async fn get(db: &Database, id: i64) -> Result<Option<Author>> {
        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let row = authors::table
            .find(id)
            .first::<Author>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    /// Merge an incoming author block (plus any profile-endpoint details)
    /// into the stored row and persist the result.
    ///
    /// Callers must serialize upserts per author; this is a read-modify-
    /// write with no transaction, safe only under the single-writer fetch
    /// loop.
    pub async fn upsert(
        db: &Database,
        tx: &mut Transcript,
        rec: &AuthorRecord,
        details: &[ProfileDetail],
        full_refresh: bool,
    ) -> Result<Author> {
        let stored = Author::get(db, rec.id).await?;
        let entity = format!("author {}", rec.id);

        let (mut remark, mut gender, mut birthday, mut location, mut hometown) =
            match &stored {
                Some(s) => (
                    s.remark.clone(),
                    s.gender.clone(),
                    s.birthday.clone(),
                    s.location.clone(),
                    s.hometown.clone(),
                ),
                None => (None, None, None, None, None),
            };
        let mut description = stored.as_ref().and_then(|s| s.description.clone());
        let mut education = stored.as_ref().and_then(|s| s.education.clone());
        let mut followed_by = stored.as_ref().and_then(|s| s.followed_by.clone());

        let screen_name = merge_field(
            &mut *tx,
            &entity,
            "screen_name",
            stored.as_ref().map(|s| s.screen_name.clone()),
            Some(rec.screen_name.clone()),
        )?
        .unwrap_or_else(|| rec.screen_name.clone());

        let avatar_url = merge_field(
            &mut *tx,
            &entity,
            "avatar_url",
            stored.as_ref().and_then(|s| s.avatar_url.clone()),
            rec.avatar_url.clone(),
        )?;
        gender = merge_field(&mut *tx, &entity, "gender", gender, rec.gender.clone())?;
        description = merge_field(
            &mut *tx,
            &entity,
            "description",
            description,
            rec.description.clone(),
        )?;

        // Profile endpoints are merged in fetch order: the most recently
        // fetched source wins a disagreement, and every disagreement is a
        // logged conflict.
        for detail in details {
            remark = merge_field(&mut *tx, &entity, "remark", remark, detail.remark.clone())?;
            gender = merge_field(&mut *tx, &entity, "gender", gender, detail.gender.clone())?;
            birthday = merge_clearable(
                &mut *tx,
                &entity,
                "birthday",
                birthday,
                detail.birthday.clone(),
                full_refresh,
            )?;
            location =
                merge_field(&mut *tx, &entity, "location", location, detail.location.clone())?;
            hometown =
                merge_field(&mut *tx, &entity, "hometown", hometown, detail.hometown.clone())?;
            description = merge_field(
                &mut *tx,
                &entity,
                "description",
                description,
                detail.description.clone(),
            )?;
            education = merge_union(&mut *tx, &entity, "education", education, &detail.education);
            followed_by = merge_union(
                &mut *tx,
                &entity,
                "followed_by",
                followed_by,
                &detail.followed_by,
            );
        }

        let row = NewAuthor {
            id: rec.id,
            screen_name,
            remark,
            gender,
            birthday,
            location,
            hometown,
            description,
            education,
            followed_by,
            avatar_url,
            verified: rec.verified,
            following: rec.following,
            follow_me: rec.follow_me,
            followers_count: merge_count(
                stored.as_ref().and_then(|s| s.followers_count),
                rec.followers_count,
            ),
            follow_count: merge_count(
                stored.as_ref().and_then(|s| s.follow_count),
                rec.follow_count,
            ),
            statuses_count: merge_count(
                stored.as_ref().and_then(|s| s.statuses_count),
                rec.statuses_count,
            ),
            updated_at: Utc::now(),
        };

        let mut conn = db
            .get_connection()
            .await
            .map_err(|e| ArchiveError::Pool(e.to_string()))?;
        let saved = diesel::insert_into(authors::table)
            .values(&row)
            .on_conflict(authors::id)
            .do_update()
            .set(&row)
            .returning(Author::as_returning())
            .get_result::<Author>(&mut conn)
            .await?;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuthorRecord {
        AuthorRecord {
            id: 1273725432,
            screen_name: "测试用户".into(),
            avatar_url: Some("http://a/hd.jpg".into()),
            following: true,
            follow_me: false,
            verified: false,
            gender: None,
            description: None,
            followers_count: Some(120),
            follow_count: Some(80),
            statuses_count: Some(3000),
        }
    }

    // The pure merge flow, exercised without a database: the disagreement
    // scenario from the three profile endpoints.
    #[test]
    fn disagreeing_sources_conflict_and_last_wins() {
        let mut tx = Transcript::new();
        let entity = "author 1273725432";
        let mut hometown: Option<String> = None;

        let sources = [
            ProfileDetail {
                source: "info",
                hometown: Some("上海".into()),
                ..Default::default()
            },
            ProfileDetail {
                source: "detail",
                hometown: Some("北京".into()),
                birthday: Some("1990-01-01".into()),
                ..Default::default()
            },
        ];
        let mut birthday: Option<String> = None;
        for d in &sources {
            hometown = merge_field(&mut tx, entity, "hometown", hometown, d.hometown.clone())
                .unwrap();
            birthday = merge_field(&mut tx, entity, "birthday", birthday, d.birthday.clone())
                .unwrap();
        }
        assert_eq!(hometown.as_deref(), Some("北京"));
        assert_eq!(birthday.as_deref(), Some("1990-01-01"));
        // hometown: added + conflict + removed + added; birthday: one added.
        assert_eq!(tx.diff_len(), 5);
        let conflicts = tx
            .entries()
            .iter()
            .filter(|e| e.kind == crate::transcript::Kind::Conflict)
            .count();
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn record_counts_are_plain_numbers() {
        let rec = record();
        assert_eq!(merge_count(None, rec.followers_count), Some(120));
    }
}
