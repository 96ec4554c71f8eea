//! Saved projects: archive plus index record in object storage.
//!
//! Each project lives under two keys, `projects/<id>.tar.gz` for the archive
//! and `index/<id>.json` for the metadata used by listings. The index record
//! is authoritative for author, name and expiry.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{FlashError, Result};
use crate::expiry::{Badge, DEFAULT_EXPIRY_DAYS, Expiry};
use crate::saving::{ProjectArchive, load_project, save_project};
use crate::storage::ObjectStore;
use crate::table::Registry;

const ARCHIVE_PREFIX: &str = "projects/";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const INDEX_PREFIX: &str = "index/";
const INDEX_SUFFIX: &str = ".json";

/// Human readable save date, e.g. `March 01, 2026`.
pub const SAVED_AT_FORMAT: &str = "%B %d, %Y";

/// Index record stored next to every archive.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ProjectMeta {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub saved_at: String,
    #[serde(default)]
    pub expires_at: String,
    /// Exact save time, RFC 3339. Older records only have `saved_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at_ts: Option<String>,
}

impl ProjectMeta {
    fn new(author: &str, name: &str, now: DateTime<Utc>, expires_at: String) -> Self {
        ProjectMeta {
            author: author.trim().to_string(),
            name: name.trim().to_string(),
            saved_at: now.format(SAVED_AT_FORMAT).to_string(),
            expires_at,
            saved_at_ts: Some(now.to_rfc3339()),
        }
    }

    /// Save time used for ordering; falls back to the day in `saved_at`.
    pub fn saved_time(&self) -> Option<DateTime<Utc>> {
        if let Some(ts) = &self.saved_at_ts {
            if let Ok(t) = DateTime::parse_from_rfc3339(ts) {
                return Some(t.with_timezone(&Utc));
            }
        }
        NaiveDate::parse_from_str(&self.saved_at, SAVED_AT_FORMAT)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
    }
}

/// One row of the project listing.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct ProjectSummary {
    pub id: String,
    #[serde(flatten)]
    pub meta: ProjectMeta,
    pub badge: String,
}

/// Listing order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Newest first.
    #[default]
    SavedAt,
    Name,
    Author,
    /// Soonest expiry first; `never` and unreadable dates last.
    ExpiresAt,
}

/// Filter and order for `ProjectStore::list`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Case-insensitive substring matched against author and name.
    pub q: Option<String>,
    #[serde(default)]
    pub sort: SortKey,
}

pub fn archive_key(id: &str) -> String {
    format!("{}{}{}", ARCHIVE_PREFIX, id, ARCHIVE_SUFFIX)
}

pub fn index_key(id: &str) -> String {
    format!("{}{}{}", INDEX_PREFIX, id, INDEX_SUFFIX)
}

/// Project persistence on top of an object store.
#[derive(Clone)]
pub struct ProjectStore {
    store: Arc<dyn ObjectStore>,
    expiry_days: i64,
}

impl ProjectStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        ProjectStore {
            store,
            expiry_days: DEFAULT_EXPIRY_DAYS,
        }
    }

    pub fn with_expiry_days(mut self, days: i64) -> Self {
        self.expiry_days = days;
        self
    }

    /// Save a new project and return its identifier
    ///
    /// Author and name are trimmed and must both be non-empty. The expiry is
    /// set `expiry_days` after the save date.
    ///
    /// # Arguments
    /// * `author` - Who saved it
    /// * `name` - Project title
    /// * `snippet` - Snippet source
    /// * `registry` - Datasets to snapshot
    /// * `now` - Save time
    pub async fn save(
        &self,
        author: &str,
        name: &str,
        snippet: &str,
        registry: &Registry,
        now: DateTime<Utc>,
    ) -> Result<String> {
        check_names(author, name)?;
        let id = Uuid::new_v4().to_string();
        let expires_at = Expiry::days_from(now.date_naive(), self.expiry_days).to_string();
        let meta = ProjectMeta::new(author, name, now, expires_at);

        self.write(&id, &meta, snippet, registry).await?;
        info!("saved project {} ({} by {})", id, meta.name, meta.author);
        Ok(id)
    }

    /// Replace the content of an existing project
    ///
    /// Author and name default to the stored ones when not given. The save
    /// date moves to `now`; the expiry is left as it was.
    pub async fn update(
        &self,
        id: &str,
        author: Option<&str>,
        name: Option<&str>,
        snippet: &str,
        registry: &Registry,
        now: DateTime<Utc>,
    ) -> Result<ProjectMeta> {
        let current = self.meta(id).await?;
        let author = author.unwrap_or(&current.author);
        let name = name.unwrap_or(&current.name);
        check_names(author, name)?;

        let meta = ProjectMeta::new(author, name, now, current.expires_at);
        self.write(id, &meta, snippet, registry).await?;
        info!("updated project {}", id);
        Ok(meta)
    }

    /// List every project with its expiry badge
    ///
    /// Unreadable index records are skipped with a warning.
    pub async fn list(&self, query: &ListQuery, today: NaiveDate) -> Result<Vec<ProjectSummary>> {
        let needle = query
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        let mut projects = Vec::new();
        for key in self.store.list(INDEX_PREFIX).await? {
            let Some(id) = key
                .strip_prefix(INDEX_PREFIX)
                .and_then(|k| k.strip_suffix(INDEX_SUFFIX))
            else {
                continue;
            };
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let mut meta: ProjectMeta = match serde_json::from_slice(&bytes) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("skipping unreadable index record {}: {}", key, e);
                    continue;
                }
            };
            meta.author = meta.author.trim().to_string();
            meta.name = meta.name.trim().to_string();

            if let Some(needle) = &needle {
                let hit = meta.author.to_lowercase().contains(needle)
                    || meta.name.to_lowercase().contains(needle);
                if !hit {
                    continue;
                }
            }

            let badge = Badge::classify(&meta.expires_at, today).to_string();
            projects.push(ProjectSummary {
                id: id.to_string(),
                meta,
                badge,
            });
        }

        projects.sort_by(|a, b| compare(query.sort, a, b));
        Ok(projects)
    }

    /// Read a project's snippet and datasets back.
    pub async fn load(&self, id: &str) -> Result<ProjectArchive> {
        let bytes = self.download(id).await?;
        load_project(&bytes)
    }

    /// Raw archive bytes.
    pub async fn download(&self, id: &str) -> Result<Vec<u8>> {
        check_id(id)?;
        self.store
            .get(&archive_key(id))
            .await?
            .ok_or_else(|| FlashError::NotFound(format!("project {}", id)))
    }

    /// Remove both the archive and the index record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.meta(id).await?;
        self.store.delete(&archive_key(id)).await?;
        self.store.delete(&index_key(id)).await?;
        info!("deleted project {}", id);
        Ok(())
    }

    /// Overwrite only the expiry of a project
    ///
    /// # Arguments
    /// * `id` - Project identifier
    /// * `expiry` - New expiry, or `None` to re-enable it `expiry_days` from today
    /// * `today` - Reference date for re-enabling
    pub async fn set_expiry(
        &self,
        id: &str,
        expiry: Option<Expiry>,
        today: NaiveDate,
    ) -> Result<ProjectMeta> {
        let mut meta = self.meta(id).await?;
        let expiry = expiry.unwrap_or_else(|| Expiry::days_from(today, self.expiry_days));
        meta.expires_at = expiry.to_string();
        self.put_meta(id, &meta).await?;
        info!("project {} now expires {}", id, meta.expires_at);
        Ok(meta)
    }

    /// Index record of one project.
    pub async fn meta(&self, id: &str) -> Result<ProjectMeta> {
        check_id(id)?;
        let bytes = self
            .store
            .get(&index_key(id))
            .await?
            .ok_or_else(|| FlashError::NotFound(format!("project {}", id)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(
        &self,
        id: &str,
        meta: &ProjectMeta,
        snippet: &str,
        registry: &Registry,
    ) -> Result<()> {
        let archive = save_project(meta, snippet, registry)?;
        self.store
            .put(&archive_key(id), archive, "application/gzip")
            .await?;
        self.put_meta(id, meta).await
    }

    async fn put_meta(&self, id: &str, meta: &ProjectMeta) -> Result<()> {
        let body = serde_json::to_vec(meta)?;
        self.store
            .put(&index_key(id), body, "application/json")
            .await
    }
}

fn check_names(author: &str, name: &str) -> Result<()> {
    if author.trim().is_empty() || name.trim().is_empty() {
        return Err(FlashError::InvalidInput(
            "Please fill in both fields.".to_string(),
        ));
    }
    Ok(())
}

// Identifiers are always UUIDs; anything else cannot name a stored project
fn check_id(id: &str) -> Result<()> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| FlashError::NotFound(format!("project {}", id)))
}

fn compare(key: SortKey, a: &ProjectSummary, b: &ProjectSummary) -> Ordering {
    match key {
        // newest first, undated records last
        SortKey::SavedAt => match (a.meta.saved_time(), b.meta.saved_time()) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => b.meta.saved_at.cmp(&a.meta.saved_at),
        },
        SortKey::Name => a.meta.name.to_lowercase().cmp(&b.meta.name.to_lowercase()),
        SortKey::Author => a
            .meta
            .author
            .to_lowercase()
            .cmp(&b.meta.author.to_lowercase()),
        SortKey::ExpiresAt => {
            let date = |s: &ProjectSummary| match Expiry::parse(&s.meta.expires_at) {
                Some(Expiry::On(d)) => Some(d),
                _ => None,
            };
            match (date(a), date(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::from_delimited;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.insert("north.csv", from_delimited(b"month,total\njan,10\nfeb,12.5\n").unwrap());
        reg.insert("south.csv", from_delimited(b"month,total\njan,3\n").unwrap());
        reg
    }

    fn store() -> ProjectStore {
        ProjectStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let projects = store();
        let snippet = "print(df_all.rows);";
        let id = projects
            .save("  Ada ", " Q1 ", snippet, &registry(), at(2026, 1, 5))
            .await
            .unwrap();

        let loaded = projects.load(&id).await.unwrap();
        assert_eq!(loaded.snippet, snippet);
        assert_eq!(loaded.registry, registry());

        let meta = projects.meta(&id).await.unwrap();
        assert_eq!(meta.author, "Ada");
        assert_eq!(meta.name, "Q1");
        assert_eq!(meta.saved_at, "January 05, 2026");
        assert_eq!(meta.expires_at, "2026-04-05");
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let err = store()
            .save("Ada", "   ", "", &registry(), at(2026, 1, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn update_preserves_expiry() {
        let projects = store();
        let id = projects
            .save("Ada", "Q1", "a", &registry(), at(2026, 1, 5))
            .await
            .unwrap();
        projects
            .set_expiry(&id, Some(Expiry::Never), at(2026, 1, 6).date_naive())
            .await
            .unwrap();

        let mut smaller = Registry::new();
        smaller.insert("only.csv", from_delimited(b"x\n1\n").unwrap());
        let meta = projects
            .update(&id, None, Some("Q1 final"), "b", &smaller, at(2026, 2, 1))
            .await
            .unwrap();
        assert_eq!(meta.expires_at, "never");
        assert_eq!(meta.author, "Ada");
        assert_eq!(meta.name, "Q1 final");

        let loaded = projects.load(&id).await.unwrap();
        assert_eq!(loaded.snippet, "b");
        assert_eq!(loaded.registry.names(), vec!["only.csv"]);
    }

    #[tokio::test]
    async fn update_of_unknown_project_is_not_found() {
        let err = store()
            .update("nope", None, None, "", &registry(), at(2026, 1, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_sorts_newest_first_with_badges() {
        let projects = store();
        let reg = registry();
        let older = projects.save("Ada", "Older", "", &reg, at(2026, 1, 5)).await.unwrap();
        let newer = projects.save("Bob", "Newer", "", &reg, at(2026, 3, 1)).await.unwrap();

        let today = at(2026, 3, 1).date_naive();
        let list = projects.list(&ListQuery::default(), today).await.unwrap();
        assert_eq!(list.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec![newer.as_str(), older.as_str()]);
        assert_eq!(list[0].badge, "🟢 3 mo");
        // 2026-04-05 is 35 days out
        assert_eq!(list[1].badge, "🟡 2 mo");

        let query = ListQuery {
            q: Some("ada".into()),
            sort: SortKey::Name,
        };
        let filtered = projects.list(&query, today).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].meta.name, "Older");
    }

    #[tokio::test]
    async fn legacy_records_sort_by_saved_at_text() {
        let backing = Arc::new(MemoryStore::new());
        let projects = ProjectStore::new(backing.clone());
        for (id, saved_at) in [("a", "January 05, 2026"), ("b", "February 10, 2026")] {
            let meta = ProjectMeta {
                author: "x".into(),
                name: id.into(),
                saved_at: saved_at.into(),
                expires_at: "bogus".into(),
                saved_at_ts: None,
            };
            backing
                .put(&index_key(id), serde_json::to_vec(&meta).unwrap(), "application/json")
                .await
                .unwrap();
        }
        let list = projects
            .list(&ListQuery::default(), at(2026, 3, 1).date_naive())
            .await
            .unwrap();
        assert_eq!(list[0].id, "b");
        assert_eq!(list[0].badge, "");
    }

    #[tokio::test]
    async fn never_then_reenable_is_ninety_days_out() {
        let projects = store();
        let id = projects.save("Ada", "Q1", "", &registry(), at(2026, 1, 5)).await.unwrap();
        let today = at(2026, 2, 1).date_naive();

        projects.set_expiry(&id, Some(Expiry::Never), today).await.unwrap();
        let list = projects.list(&ListQuery::default(), today).await.unwrap();
        assert_eq!(list[0].badge, "♾️ never");

        let meta = projects.set_expiry(&id, None, today).await.unwrap();
        assert_eq!(meta.expires_at, (today + Duration::days(90)).format("%Y-%m-%d").to_string());
    }

    #[tokio::test]
    async fn delete_removes_both_keys() {
        let backing = Arc::new(MemoryStore::new());
        let projects = ProjectStore::new(backing.clone());
        let id = projects.save("Ada", "Q1", "", &registry(), at(2026, 1, 5)).await.unwrap();

        projects.delete(&id).await.unwrap();
        assert!(backing.list("").await.unwrap().is_empty());
        assert!(matches!(projects.load(&id).await, Err(FlashError::NotFound(_))));
        assert!(matches!(projects.delete(&id).await, Err(FlashError::NotFound(_))));
    }
}
