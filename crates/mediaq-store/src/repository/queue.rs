//! The download queue: one row per requested movie, episode/season, or book.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use super::{Entity, QueryCriteria, Repository, format_timestamp, parse_timestamp};
use crate::connection::Connection;
use crate::errors::{Result, StorageError};

/// Kind of media requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// A feature film.
    Movie,
    /// A TV episode or season pack.
    Tv,
    /// An ebook.
    Book,
}

impl MediaType {
    /// Stored text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Tv => "tv",
            Self::Book => "book",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "movie" => Ok(Self::Movie),
            "tv" => Ok(Self::Tv),
            "book" => Ok(Self::Book),
            other => Err(StorageError::Mapping(format!("unknown media type: {other:?}"))),
        }
    }
}

impl From<MediaType> for Value {
    fn from(t: MediaType) -> Self {
        Value::Text(t.as_str().into())
    }
}

/// Download lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Queued, nothing started.
    NotStarted,
    /// Searching, downloading or unpacking.
    InProgress,
    /// File in place.
    Completed,
    /// Gave up; see the item's error text.
    Error,
}

impl QueueStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::NotStarted, Self::InProgress, Self::Completed, Self::Error];

    /// Stored text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StorageError::Mapping(format!("unknown queue status: {s:?}")))
    }
}

impl From<QueueStatus> for Value {
    fn from(s: QueueStatus) -> Self {
        Value::Text(s.as_str().into())
    }
}

/// A queued request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    /// Row id.
    pub id: i64,
    /// Movie, TV or book.
    #[serde(rename = "type")]
    pub media_type: MediaType,
    /// Display title.
    pub name: String,
    /// Release year.
    pub year: Option<i32>,
    /// Catalog (TMDB) id.
    pub tmdb_id: Option<i64>,
    /// Season number, TV only.
    pub season: Option<i32>,
    /// Episode number; absent for season packs.
    pub episode: Option<i32>,
    /// Whole-season request.
    pub is_pack: bool,
    /// Lifecycle state.
    pub status: QueueStatus,
    /// Info hash of the chosen torrent.
    pub torrent_hash: Option<String>,
    /// Release name of the chosen torrent.
    pub torrent_name: Option<String>,
    /// Magnet URI.
    pub magnet_link: Option<String>,
    /// Id assigned by the debrid service.
    pub debrid_id: Option<String>,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    /// Last failure.
    pub error: Option<String>,
    /// Final location on disk.
    pub file_path: Option<String>,
    /// When queued.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// When it reached [`QueueStatus::Completed`].
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial queue item. `None` leaves a column alone; for nullable columns
/// `Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::option_option)]
pub struct QueueItemPatch {
    /// Movie, TV or book.
    pub media_type: Option<MediaType>,
    /// Display title.
    pub name: Option<String>,
    /// Release year.
    pub year: Option<Option<i32>>,
    /// Catalog id.
    pub tmdb_id: Option<Option<i64>>,
    /// Season number.
    pub season: Option<Option<i32>>,
    /// Episode number.
    pub episode: Option<Option<i32>>,
    /// Whole-season request.
    pub is_pack: Option<bool>,
    /// Lifecycle state.
    pub status: Option<QueueStatus>,
    /// Torrent info hash.
    pub torrent_hash: Option<Option<String>>,
    /// Torrent release name.
    pub torrent_name: Option<Option<String>>,
    /// Magnet URI.
    pub magnet_link: Option<Option<String>>,
    /// Debrid id.
    pub debrid_id: Option<Option<String>>,
    /// Percent complete; clamped to 100 on write.
    pub progress: Option<u8>,
    /// Failure text.
    pub error: Option<Option<String>>,
    /// Final location.
    pub file_path: Option<Option<String>>,
    /// Completion time.
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl QueueItemPatch {
    /// The minimum needed to queue something new.
    pub fn new_item(media_type: MediaType, name: impl Into<String>) -> Self {
        Self {
            media_type: Some(media_type),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the catalog id.
    #[must_use]
    pub fn tmdb_id(mut self, tmdb_id: i64) -> Self {
        self.tmdb_id = Some(Some(tmdb_id));
        self
    }

    /// Set the release year.
    #[must_use]
    pub fn year(mut self, year: i32) -> Self {
        self.year = Some(Some(year));
        self
    }

    /// Target one episode.
    #[must_use]
    pub fn episode(mut self, season: i32, episode: i32) -> Self {
        self.season = Some(Some(season));
        self.episode = Some(Some(episode));
        self.is_pack = Some(false);
        self
    }

    /// Target a whole season.
    #[must_use]
    pub fn season_pack(mut self, season: i32) -> Self {
        self.season = Some(Some(season));
        self.episode = Some(None);
        self.is_pack = Some(true);
        self
    }
}

/// Torrent selection recorded once a release is picked.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Info hash.
    pub hash: String,
    /// Release name.
    pub name: Option<String>,
    /// Magnet URI.
    pub magnet_link: Option<String>,
    /// Debrid id, if already submitted.
    pub debrid_id: Option<String>,
}

impl Entity for QueueItem {
    const TABLE: &'static str = "queue";
    type Id = i64;
    type Patch = QueueItemPatch;

    fn from_row(row: &Row<'_>) -> Result<Self> {
        let media_type: String = row.get("type")?;
        let status: String = row.get("status")?;
        let progress: i64 = row.get("progress")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;
        Ok(Self {
            id: row.get("id")?,
            media_type: media_type.parse()?,
            name: row.get("name")?,
            year: row.get("year")?,
            tmdb_id: row.get("tmdb_id")?,
            season: row.get("season")?,
            episode: row.get("episode")?,
            is_pack: row.get("is_pack")?,
            status: status.parse()?,
            torrent_hash: row.get("torrent_hash")?,
            torrent_name: row.get("torrent_name")?,
            magnet_link: row.get("magnet_link")?,
            debrid_id: row.get("debrid_id")?,
            progress: u8::try_from(progress.clamp(0, 100)).unwrap_or(100),
            error: row.get("error")?,
            file_path: row.get("file_path")?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    fn patch_columns(patch: &QueueItemPatch) -> Vec<(&'static str, Value)> {
        let mut cols: Vec<(&'static str, Value)> = Vec::new();
        if let Some(t) = patch.media_type {
            cols.push(("type", t.into()));
        }
        if let Some(name) = &patch.name {
            cols.push(("name", Value::Text(name.clone())));
        }
        if let Some(year) = patch.year {
            cols.push(("year", year.into()));
        }
        if let Some(tmdb_id) = patch.tmdb_id {
            cols.push(("tmdb_id", tmdb_id.into()));
        }
        if let Some(season) = patch.season {
            cols.push(("season", season.into()));
        }
        if let Some(episode) = patch.episode {
            cols.push(("episode", episode.into()));
        }
        if let Some(is_pack) = patch.is_pack {
            cols.push(("is_pack", is_pack.into()));
        }
        if let Some(status) = patch.status {
            cols.push(("status", status.into()));
        }
        for (column, value) in [
            ("torrent_hash", &patch.torrent_hash),
            ("torrent_name", &patch.torrent_name),
            ("magnet_link", &patch.magnet_link),
            ("debrid_id", &patch.debrid_id),
            ("error", &patch.error),
            ("file_path", &patch.file_path),
        ] {
            if let Some(value) = value {
                cols.push((column, value.clone().into()));
            }
        }
        if let Some(progress) = patch.progress {
            cols.push(("progress", progress.min(100).into()));
        }
        if let Some(completed_at) = &patch.completed_at {
            cols.push(("completed_at", completed_at.as_ref().map(format_timestamp).into()));
        }
        cols
    }
}

/// Queue operations. Generic CRUD plus the lookups the queue views need.
#[derive(Debug)]
pub struct QueueRepo;

type Items = Repository<QueueItem>;

impl QueueRepo {
    /// Queue a new item.
    pub fn create(conn: &mut Connection, patch: &QueueItemPatch) -> Result<QueueItem> {
        Items::create(conn, patch)
    }

    /// Fetch by id.
    pub fn get(conn: &mut Connection, id: i64) -> Result<Option<QueueItem>> {
        Items::find_by_id(conn, &id)
    }

    /// Partial update.
    pub fn update(conn: &mut Connection, id: i64, patch: &QueueItemPatch) -> Result<QueueItem> {
        Items::update(conn, &id, patch)
    }

    /// Remove one item.
    pub fn delete(conn: &mut Connection, id: i64) -> Result<()> {
        Items::delete(conn, &id)
    }

    /// Items matching arbitrary criteria.
    pub fn list(conn: &mut Connection, criteria: &QueryCriteria) -> Result<Vec<QueueItem>> {
        Items::find_all(conn, criteria)
    }

    /// Items in one status, oldest first.
    pub fn find_by_status(conn: &mut Connection, status: QueueStatus) -> Result<Vec<QueueItem>> {
        Items::find_all(conn, &oldest_first().eq("status", status))
    }

    /// Items of one media type, oldest first.
    pub fn find_by_type(conn: &mut Connection, media_type: MediaType) -> Result<Vec<QueueItem>> {
        Items::find_all(conn, &oldest_first().eq("type", media_type))
    }

    /// Every item for a catalog id.
    pub fn find_by_catalog_id(conn: &mut Connection, tmdb_id: i64) -> Result<Vec<QueueItem>> {
        let criteria = QueryCriteria::new()
            .eq("tmdb_id", tmdb_id)
            .order_by("season, episode, id");
        Items::find_all(conn, &criteria)
    }

    /// Every item for one season of a show, pack first, then by episode.
    pub fn find_by_season(conn: &mut Connection, tmdb_id: i64, season: i32) -> Result<Vec<QueueItem>> {
        let criteria = QueryCriteria::new()
            .eq("tmdb_id", tmdb_id)
            .eq("season", season)
            .order_by("is_pack DESC, episode, id");
        Items::find_all(conn, &criteria)
    }

    /// The item for one specific episode, if queued.
    pub fn find_episode(
        conn: &mut Connection,
        tmdb_id: i64,
        season: i32,
        episode: i32,
    ) -> Result<Option<QueueItem>> {
        let criteria = QueryCriteria::new()
            .eq("tmdb_id", tmdb_id)
            .eq("season", season)
            .eq("episode", episode)
            .order_by("id");
        Items::find_one(conn, &criteria)
    }

    /// Everything not yet finished or failed, oldest first.
    pub fn find_active(conn: &mut Connection) -> Result<Vec<QueueItem>> {
        let criteria = oldest_first().any_of(
            "status",
            [QueueStatus::NotStarted, QueueStatus::InProgress],
        );
        Items::find_all(conn, &criteria)
    }

    /// Record download progress, clamped to 0..=100.
    pub fn update_progress(conn: &mut Connection, id: i64, progress: i64) -> Result<QueueItem> {
        let patch = QueueItemPatch {
            progress: Some(u8::try_from(progress.clamp(0, 100)).unwrap_or(100)),
            ..QueueItemPatch::default()
        };
        Items::update(conn, &id, &patch)
    }

    /// Move to `status`. The error text is replaced by `error` (cleared when
    /// `None`); reaching [`QueueStatus::Completed`] stamps `completed_at`.
    pub fn update_status(
        conn: &mut Connection,
        id: i64,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<QueueItem> {
        let mut patch = QueueItemPatch {
            status: Some(status),
            error: Some(error.map(String::from)),
            ..QueueItemPatch::default()
        };
        if status == QueueStatus::Completed {
            patch.completed_at = Some(Some(Utc::now()));
        }
        Items::update(conn, &id, &patch)
    }

    /// Record the chosen torrent.
    pub fn update_torrent_info(conn: &mut Connection, id: i64, info: &TorrentInfo) -> Result<QueueItem> {
        let patch = QueueItemPatch {
            torrent_hash: Some(Some(info.hash.clone())),
            torrent_name: Some(info.name.clone()),
            magnet_link: Some(info.magnet_link.clone()),
            debrid_id: Some(info.debrid_id.clone()),
            ..QueueItemPatch::default()
        };
        Items::update(conn, &id, &patch)
    }

    /// Item count per status; every status is present, zero when empty.
    pub fn count_by_status(conn: &mut Connection) -> Result<BTreeMap<QueueStatus, i64>> {
        let mut counts: BTreeMap<QueueStatus, i64> =
            QueueStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        let rows = conn.query_many(
            "SELECT status, COUNT(*) FROM queue GROUP BY status",
            &[],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        for (status, n) in rows {
            let _ = counts.insert(status.parse()?, n);
        }
        Ok(counts)
    }

    /// Remove every item in `status`. Returns how many were removed.
    pub fn delete_by_status(conn: &mut Connection, status: QueueStatus) -> Result<usize> {
        let result = conn.execute("DELETE FROM queue WHERE status = ?", &[Value::from(status)])?;
        Ok(result.rows_affected)
    }

    /// Total items.
    pub fn count(conn: &mut Connection) -> Result<i64> {
        Items::count(conn, &QueryCriteria::new())
    }
}

fn oldest_first() -> QueryCriteria {
    QueryCriteria::new().order_by("created_at ASC, id ASC")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
