use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::WriteError;
use crate::identity::IdentityMap;
use crate::migrate::{apply_pending, current_version, ensure_parent_dir, open_connection};
use crate::model::{
    ContentFields, ContentItem, ContentKind, DestinationId, NaturalKey, NormalizedMedia,
    NormalizedRecord, ResolvedRelations, UpsertResult, WriteAction,
};
use crate::runtime::ResolvedPaths;
use crate::source::MediaFetcher;

const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// Destination of a migration run.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Whether `lookup` can find items by natural key. Writers without it are
    /// not idempotent across runs.
    fn supports_key_lookup(&self) -> bool;

    async fn lookup(&self, key: &NaturalKey) -> Result<Option<DestinationId>, WriteError>;

    /// Create or update one item. Media records go through `upsert_media`.
    async fn upsert(
        &self,
        record: &NormalizedRecord,
        relations: &ResolvedRelations,
    ) -> Result<UpsertResult, WriteError>;

    async fn upsert_media(
        &self,
        media: &NormalizedMedia,
        fetcher: &dyn MediaFetcher,
    ) -> Result<UpsertResult, WriteError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub items_by_kind: BTreeMap<ContentKind, usize>,
    pub relations: usize,
    pub media_files: usize,
    pub media_bytes: u64,
    pub checkpoint_entries: usize,
    pub schema_version: u32,
}

/// SQLite-backed content store. Media bodies live as plain files under `media_dir`.
#[derive(Clone)]
pub struct SqliteContentStore {
    connection: Arc<Mutex<Connection>>,
    media_dir: PathBuf,
}

impl SqliteContentStore {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        Self::open_at(&paths.db_path, &paths.media_dir)
    }

    /// Open (creating if needed) the database and apply pending migrations.
    pub fn open_at(db_path: &Path, media_dir: &Path) -> Result<Self> {
        ensure_parent_dir(db_path)?;
        let connection = open_connection(db_path)?;
        Self::from_connection(connection, media_dir)
    }

    pub fn open_in_memory(media_dir: &Path) -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory store")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        Self::from_connection(connection, media_dir)
    }

    fn from_connection(connection: Connection, media_dir: &Path) -> Result<Self> {
        let applied = apply_pending(&connection)?;
        if !applied.is_empty() {
            debug!("applied {} store migrations", applied.len());
        }
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            media_dir: media_dir.to_path_buf(),
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Run a synchronous operation against the underlying connection.
    pub fn with_connection<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.lock();
        operation(&mut guard)
    }

    pub fn count(&self, kind: ContentKind) -> Result<usize> {
        let connection = self.lock();
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM content_items WHERE kind = ?1",
                [kind.as_str()],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count {kind} items"))?;
        usize::try_from(count).context("item count does not fit into usize")
    }

    pub fn get(&self, id: DestinationId) -> Result<Option<ContentItem>> {
        let connection = self.lock();
        let row = connection
            .query_row(
                "SELECT id, source_key, name, slug, content_hash, fields_json
                 FROM content_items WHERE id = ?1",
                [id.0],
                read_item_row,
            )
            .optional()
            .with_context(|| format!("failed to load content item {id}"))?;
        row.map(ItemRow::into_item).transpose()
    }

    pub fn find_by_key(&self, key: &NaturalKey) -> Result<Option<ContentItem>> {
        let connection = self.lock();
        let row = connection
            .query_row(
                "SELECT id, source_key, name, slug, content_hash, fields_json
                 FROM content_items WHERE kind = ?1 AND source_key = ?2",
                params![key.kind.as_str(), key.source_key],
                read_item_row,
            )
            .optional()
            .with_context(|| format!("failed to look up {} {}", key.kind, key.source_key))?;
        row.map(ItemRow::into_item).transpose()
    }

    pub fn list(&self, kind: ContentKind) -> Result<Vec<ContentItem>> {
        let connection = self.lock();
        let mut statement = connection
            .prepare(
                "SELECT id, source_key, name, slug, content_hash, fields_json
                 FROM content_items WHERE kind = ?1 ORDER BY id",
            )
            .context("failed to prepare content listing")?;
        let rows = statement
            .query_map([kind.as_str()], read_item_row)
            .with_context(|| format!("failed to list {kind} items"))?;

        let mut items = Vec::new();
        for row in rows {
            let row = row.context("failed to decode content row")?;
            items.push(row.into_item()?);
        }
        Ok(items)
    }

    /// Destination ids referenced by `id` under one relation name, in order.
    pub fn relations_of(&self, id: DestinationId, relation: &str) -> Result<Vec<DestinationId>> {
        let connection = self.lock();
        let mut statement = connection
            .prepare(
                "SELECT target_id FROM content_relations
                 WHERE item_id = ?1 AND relation = ?2 ORDER BY position",
            )
            .context("failed to prepare relation query")?;
        let rows = statement
            .query_map(params![id.0, relation], |row| row.get::<_, i64>(0))
            .context("failed to query relations")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(DestinationId(row.context("failed to decode relation row")?));
        }
        Ok(out)
    }

    /// Replace the stored checkpoint with the current identity map.
    pub fn save_identity_checkpoint(&self, identities: &IdentityMap) -> Result<usize> {
        let mut connection = self.lock();
        let transaction = connection
            .transaction()
            .context("failed to start checkpoint transaction")?;
        transaction
            .execute("DELETE FROM identity_checkpoint", [])
            .context("failed to clear identity checkpoint")?;
        let now = chrono::Utc::now().timestamp();
        let entries = identities.entries();
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO identity_checkpoint (kind, external_id, destination_id, saved_at_unix)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare checkpoint insert")?;
            for (kind, external_id, id) in &entries {
                let external_id =
                    i64::try_from(*external_id).context("external id does not fit into i64")?;
                statement
                    .execute(params![kind.as_str(), external_id, id.0, now])
                    .context("failed to write checkpoint entry")?;
            }
        }
        transaction
            .commit()
            .context("failed to commit identity checkpoint")?;
        Ok(entries.len())
    }

    pub fn load_identity_checkpoint(&self) -> Result<IdentityMap> {
        let connection = self.lock();
        let mut statement = connection
            .prepare("SELECT kind, external_id, destination_id FROM identity_checkpoint")
            .context("failed to prepare checkpoint query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("failed to read identity checkpoint")?;

        let mut entries = Vec::new();
        for row in rows {
            let (kind, external_id, id) = row.context("failed to decode checkpoint row")?;
            let kind = ContentKind::from_name(&kind)
                .with_context(|| format!("unknown kind in identity checkpoint: {kind}"))?;
            let external_id =
                u64::try_from(external_id).context("negative external id in checkpoint")?;
            entries.push((kind, external_id, DestinationId(id)));
        }
        Ok(IdentityMap::from_entries(entries))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let connection = self.lock();
        let mut items_by_kind = BTreeMap::new();
        {
            let mut statement = connection
                .prepare("SELECT kind, COUNT(*) FROM content_items GROUP BY kind")
                .context("failed to prepare stats query")?;
            let rows = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .context("failed to query item counts")?;
            for row in rows {
                let (kind, count) = row.context("failed to decode stats row")?;
                if let Some(kind) = ContentKind::from_name(&kind) {
                    items_by_kind.insert(kind, usize::try_from(count).unwrap_or(0));
                }
            }
        }

        let count_rows = |sql: &str| -> Result<i64> {
            connection
                .query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("failed to run `{sql}`"))
        };
        let relations = count_rows("SELECT COUNT(*) FROM content_relations")?;
        let media_files = count_rows("SELECT COUNT(*) FROM media_files")?;
        let media_bytes = count_rows("SELECT COALESCE(SUM(byte_len), 0) FROM media_files")?;
        let checkpoint_entries = count_rows("SELECT COUNT(*) FROM identity_checkpoint")?;

        Ok(StoreStats {
            items_by_kind,
            relations: usize::try_from(relations).unwrap_or(0),
            media_files: usize::try_from(media_files).unwrap_or(0),
            media_bytes: u64::try_from(media_bytes).unwrap_or(0),
            checkpoint_entries: usize::try_from(checkpoint_entries).unwrap_or(0),
            schema_version: current_version(&connection)?,
        })
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, WriteError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, WriteError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&mut guard)
        })
        .await
        .map_err(|error| WriteError::rejected(format!("store task failed: {error}")))?
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TargetWriter for SqliteContentStore {
    fn supports_key_lookup(&self) -> bool {
        true
    }

    async fn lookup(&self, key: &NaturalKey) -> Result<Option<DestinationId>, WriteError> {
        let kind = key.kind;
        let source_key = key.source_key.clone();
        let media_dir = self.media_dir.clone();
        self.blocking(move |connection| {
            let found = connection
                .query_row(
                    "SELECT c.id, m.stored_path FROM content_items c
                     LEFT JOIN media_files m ON m.item_id = c.id
                     WHERE c.kind = ?1 AND c.source_key = ?2",
                    params![kind.as_str(), source_key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .map_err(|error| map_sqlite_error("lookup", error))?;
            Ok(found.and_then(|(id, stored_path)| {
                // Media whose file is gone must be downloaded again.
                if kind == ContentKind::Media
                    && !stored_path.is_some_and(|path| media_dir.join(path).is_file())
                {
                    debug!("{kind} {source_key}: stored file missing");
                    return None;
                }
                Some(DestinationId(id))
            }))
        })
        .await
    }

    async fn upsert(
        &self,
        record: &NormalizedRecord,
        relations: &ResolvedRelations,
    ) -> Result<UpsertResult, WriteError> {
        let item = prepare_item(record, relations)?;
        self.blocking(move |connection| write_item(connection, &item))
            .await
    }

    async fn upsert_media(
        &self,
        media: &NormalizedMedia,
        fetcher: &dyn MediaFetcher,
    ) -> Result<UpsertResult, WriteError> {
        require_text("title", &media.title)?;
        require_text("slug", &media.slug)?;

        let stored_name = stored_media_name(media.external_id, &media.file_name);
        let final_path = self.media_dir.join(&stored_name);
        let partial = PartialFile::new(self.media_dir.join(format!("{stored_name}.part")));

        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(|error| {
                WriteError::rejected(format!(
                    "failed to create {}: {error}",
                    self.media_dir.display()
                ))
            })?;

        let mut reader = fetcher.open(&media.source_url).await.map_err(|error| {
            WriteError::rejected(format!("media download failed: {error}"))
        })?;
        let mut file = tokio::fs::File::create(partial.path())
            .await
            .map_err(|error| {
                WriteError::rejected(format!(
                    "failed to create {}: {error}",
                    partial.path().display()
                ))
            })?;

        let mut hasher = Sha256::new();
        let mut byte_len = 0u64;
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        loop {
            let read = reader.read(&mut buffer).await.map_err(|error| {
                WriteError::rejected(format!("media stream failed: {error}"))
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read]).await.map_err(|error| {
                WriteError::rejected(format!("failed to write media file: {error}"))
            })?;
            byte_len += read as u64;
        }
        file.flush()
            .await
            .map_err(|error| WriteError::rejected(format!("failed to flush media file: {error}")))?;
        drop(file);
        drop(reader);

        let sha256 = hex_digest(&hasher.finalize());
        let fields = ContentFields::Media {
            file_name: media.file_name.clone(),
            stored_path: stored_name.clone(),
            mime_type: media.mime_type.clone(),
            alt_text: media.alt_text.clone(),
            byte_len,
        };
        let item = PreparedItem {
            kind: ContentKind::Media,
            source_key: NaturalKey::for_external(ContentKind::Media, media.external_id).source_key,
            name: media.title.trim().to_string(),
            slug: media.slug.trim().to_string(),
            content_hash: compute_hash(&canonical_payload(
                ContentKind::Media,
                &media.title,
                &media.slug,
                &fields,
                Some(&sha256),
            )?),
            fields,
            relations: Vec::new(),
            media_file: Some(MediaFileRow {
                source_url: media.source_url.clone(),
                stored_path: stored_name,
                byte_len,
                sha256,
            }),
        };

        // The file is in place before the row commits, so a committed row always has its file.
        let replaces_file = tokio::fs::try_exists(&final_path).await.unwrap_or(false);
        tokio::fs::rename(partial.path(), &final_path)
            .await
            .map_err(|error| {
                WriteError::rejected(format!(
                    "failed to move media into {}: {error}",
                    final_path.display()
                ))
            })?;
        partial.disarm();

        match self
            .blocking(move |connection| write_item(connection, &item))
            .await
        {
            Ok(result) => Ok(result),
            Err(error) => {
                if !replaces_file {
                    let _ = tokio::fs::remove_file(&final_path).await;
                }
                Err(error)
            }
        }
    }
}

/// Deletes the wrapped path on drop unless disarmed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

struct MediaFileRow {
    source_url: String,
    stored_path: String,
    byte_len: u64,
    sha256: String,
}

struct PreparedItem {
    kind: ContentKind,
    source_key: String,
    name: String,
    slug: String,
    content_hash: String,
    fields: ContentFields,
    relations: Vec<(&'static str, DestinationId)>,
    media_file: Option<MediaFileRow>,
}

fn prepare_item(
    record: &NormalizedRecord,
    relations: &ResolvedRelations,
) -> Result<PreparedItem, WriteError> {
    require_text("title", record.name())?;
    require_text("slug", record.slug())?;

    let mut relation_rows = Vec::new();
    let fields = match record {
        NormalizedRecord::Author(author) => ContentFields::Author {
            bio: author.bio.clone(),
            website: author.website.clone(),
            avatar_url: author.avatar_url.clone(),
        },
        NormalizedRecord::Category(term) => {
            relation_rows.extend(relations.parent.map(|id| ("parent", id)));
            ContentFields::Category {
                description: term.description.clone(),
                parent: relations.parent,
            }
        }
        NormalizedRecord::Tag(term) => ContentFields::Tag {
            description: term.description.clone(),
        },
        NormalizedRecord::Post(post) => {
            relation_rows.extend(relations.author.map(|id| ("author", id)));
            relation_rows.extend(relations.featured_media.map(|id| ("featured_media", id)));
            relation_rows.extend(relations.categories.iter().map(|id| ("categories", *id)));
            relation_rows.extend(relations.tags.iter().map(|id| ("tags", *id)));
            ContentFields::Post {
                title: post.title.trim().to_string(),
                body: post.body.clone(),
                excerpt: post.excerpt.clone(),
                status: post.status.clone(),
                published_at: post.published_at,
                modified_at: post.modified_at,
                author: relations.author,
                featured_media: relations.featured_media,
                categories: relations.categories.clone(),
                tags: relations.tags.clone(),
            }
        }
        NormalizedRecord::Media(_) => {
            return Err(WriteError::rejected(
                "media records must be written with their file stream",
            ));
        }
    };

    let kind = record.kind();
    Ok(PreparedItem {
        kind,
        source_key: record.natural_key().source_key,
        name: record.name().trim().to_string(),
        slug: record.slug().trim().to_string(),
        content_hash: compute_hash(&canonical_payload(
            kind,
            record.name(),
            record.slug(),
            &fields,
            None,
        )?),
        fields,
        relations: relation_rows,
        media_file: None,
    })
}

/// One savepoint per item: the row, its relations, and its media row land together or not at all.
fn write_item(connection: &mut Connection, item: &PreparedItem) -> Result<UpsertResult, WriteError> {
    let savepoint = connection
        .savepoint()
        .map_err(|error| map_sqlite_error("begin", error))?;

    let existing = savepoint
        .query_row(
            "SELECT id, content_hash FROM content_items WHERE kind = ?1 AND source_key = ?2",
            params![item.kind.as_str(), item.source_key],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(|error| map_sqlite_error("lookup", error))?;

    if let Some((id, hash)) = &existing
        && *hash == item.content_hash
    {
        return Ok(UpsertResult {
            id: DestinationId(*id),
            action: WriteAction::Unchanged,
        });
    }

    let fields_json = serde_json::to_string(&item.fields)
        .map_err(|error| WriteError::rejected(format!("failed to encode fields: {error}")))?;
    let now = chrono::Utc::now().timestamp();

    let (id, action) = match existing {
        Some((id, _)) => {
            savepoint
                .execute(
                    "UPDATE content_items
                     SET name = ?1, slug = ?2, content_hash = ?3, fields_json = ?4, updated_at_unix = ?5
                     WHERE id = ?6",
                    params![item.name, item.slug, item.content_hash, fields_json, now, id],
                )
                .map_err(|error| map_sqlite_error("update", error))?;
            savepoint
                .execute("DELETE FROM content_relations WHERE item_id = ?1", [id])
                .map_err(|error| map_sqlite_error("clear relations", error))?;
            (id, WriteAction::Updated)
        }
        None => {
            savepoint
                .execute(
                    "INSERT INTO content_items
                     (kind, source_key, name, slug, content_hash, fields_json, created_at_unix, updated_at_unix)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        item.kind.as_str(),
                        item.source_key,
                        item.name,
                        item.slug,
                        item.content_hash,
                        fields_json,
                        now
                    ],
                )
                .map_err(|error| map_sqlite_error("insert", error))?;
            (savepoint.last_insert_rowid(), WriteAction::Created)
        }
    };

    let mut positions: BTreeMap<&str, i64> = BTreeMap::new();
    for (relation, target) in &item.relations {
        let relation = *relation;
        let position = positions.entry(relation).or_insert(0);
        savepoint
            .execute(
                "INSERT INTO content_relations (item_id, relation, position, target_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, relation, *position, target.0],
            )
            .map_err(|error| map_sqlite_error(&format!("write {relation} relation"), error))?;
        *position += 1;
    }

    if let Some(media) = &item.media_file {
        let byte_len = i64::try_from(media.byte_len)
            .map_err(|_| WriteError::rejected("media file too large"))?;
        savepoint
            .execute(
                "INSERT INTO media_files (item_id, source_url, stored_path, byte_len, sha256)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(item_id) DO UPDATE SET
                   source_url = excluded.source_url,
                   stored_path = excluded.stored_path,
                   byte_len = excluded.byte_len,
                   sha256 = excluded.sha256",
                params![id, media.source_url, media.stored_path, byte_len, media.sha256],
            )
            .map_err(|error| map_sqlite_error("write media row", error))?;
    }

    savepoint
        .commit()
        .map_err(|error| map_sqlite_error("commit", error))?;
    debug!("{} {} -> {} ({:?})", item.kind, item.source_key, id, action);
    Ok(UpsertResult {
        id: DestinationId(id),
        action,
    })
}

struct ItemRow {
    id: i64,
    source_key: String,
    name: String,
    slug: String,
    content_hash: String,
    fields_json: String,
}

impl ItemRow {
    fn into_item(self) -> Result<ContentItem> {
        let fields: ContentFields = serde_json::from_str(&self.fields_json)
            .with_context(|| format!("corrupt fields for content item {}", self.id))?;
        Ok(ContentItem {
            id: DestinationId(self.id),
            source_key: self.source_key,
            name: self.name,
            slug: self.slug,
            content_hash: self.content_hash,
            fields,
        })
    }
}

fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        source_key: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        content_hash: row.get(4)?,
        fields_json: row.get(5)?,
    })
}

fn require_text(field: &str, value: &str) -> Result<(), WriteError> {
    if value.trim().is_empty() {
        return Err(WriteError::rejected(format!("{field} must not be blank")));
    }
    Ok(())
}

fn canonical_payload(
    kind: ContentKind,
    name: &str,
    slug: &str,
    fields: &ContentFields,
    file_sha256: Option<&str>,
) -> Result<String, WriteError> {
    serde_json::to_string(&(kind, name.trim(), slug.trim(), fields, file_sha256))
        .map_err(|error| WriteError::rejected(format!("failed to encode payload: {error}")))
}

fn map_sqlite_error(operation: &str, error: rusqlite::Error) -> WriteError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            WriteError::conflict(format!("{operation}: {error}"))
        }
        _ => WriteError::rejected(format!("{operation}: {error}")),
    }
}

/// Media files are stored as `<external id>-<sanitized name>`.
fn stored_media_name(external_id: u64, file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('.');
    if sanitized.is_empty() {
        format!("{external_id}-media")
    } else {
        format!("{external_id}-{sanitized}")
    }
}

pub(crate) fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex_digest(&digest[..8])
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use std::io;

    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::error::SourceError;
    use crate::model::{NormalizedAuthor, NormalizedPost, NormalizedTerm};
    use crate::source::MediaReader;

    fn store(temp: &tempfile::TempDir) -> SqliteContentStore {
        SqliteContentStore::open_at(
            &temp.path().join("data/content.db"),
            &temp.path().join("media"),
        )
        .expect("open store")
    }

    fn author(id: u64, name: &str) -> NormalizedRecord {
        NormalizedRecord::Author(NormalizedAuthor {
            external_id: id,
            name: name.to_string(),
            slug: slug::slugify(name),
            bio: String::new(),
            website: None,
            avatar_url: None,
        })
    }

    fn post(id: u64, title: &str) -> NormalizedRecord {
        NormalizedRecord::Post(NormalizedPost {
            external_id: id,
            title: title.to_string(),
            body: "<p>body</p>".to_string(),
            excerpt: String::new(),
            slug: slug::slugify(title),
            status: Some("publish".to_string()),
            published_at: Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
            modified_at: None,
            author: Some(1),
            featured_media: None,
            categories: vec![],
            tags: vec![],
        })
    }

    fn media(id: u64) -> NormalizedMedia {
        NormalizedMedia {
            external_id: id,
            title: "Photo".to_string(),
            slug: "photo".to_string(),
            source_url: format!("https://cdn.test/{id}/photo.jpg"),
            file_name: "photo.jpg".to_string(),
            mime_type: Some("image/jpeg".to_string()),
            alt_text: String::new(),
        }
    }

    struct BytesFetcher(&'static [u8]);

    #[async_trait]
    impl MediaFetcher for BytesFetcher {
        async fn open(&self, _url: &str) -> Result<MediaReader, SourceError> {
            Ok(Box::pin(io::Cursor::new(self.0)))
        }
    }

    struct BrokenFetcher;

    #[async_trait]
    impl MediaFetcher for BrokenFetcher {
        async fn open(&self, _url: &str) -> Result<MediaReader, SourceError> {
            let chunks: Vec<Result<&'static [u8], io::Error>> = vec![
                Ok(b"first chunk".as_slice()),
                Err(io::Error::other("connection reset")),
            ];
            Ok(Box::pin(tokio_util::io::StreamReader::new(
                futures::stream::iter(chunks),
            )))
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_reports_unchanged() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let record = author(1, "Ada Lovelace");

        let first = store
            .upsert(&record, &ResolvedRelations::default())
            .await
            .expect("first upsert");
        assert_eq!(first.action, WriteAction::Created);

        let second = store
            .upsert(&record, &ResolvedRelations::default())
            .await
            .expect("second upsert");
        assert_eq!(second.action, WriteAction::Unchanged);
        assert_eq!(second.id, first.id);
        assert_eq!(store.count(ContentKind::Author).expect("count"), 1);
    }

    #[tokio::test]
    async fn changed_payload_updates_in_place() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let created = store
            .upsert(&author(1, "Ada"), &ResolvedRelations::default())
            .await
            .expect("create");
        let updated = store
            .upsert(&author(1, "Ada King"), &ResolvedRelations::default())
            .await
            .expect("update");
        assert_eq!(updated.action, WriteAction::Updated);
        assert_eq!(updated.id, created.id);

        let item = store.get(created.id).expect("get").expect("item exists");
        assert_eq!(item.name, "Ada King");
        assert_eq!(item.kind(), ContentKind::Author);
    }

    #[tokio::test]
    async fn post_relations_are_written_with_the_item() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let writer = store
            .upsert(&author(1, "Ada"), &ResolvedRelations::default())
            .await
            .expect("author");
        let tag = store
            .upsert(
                &NormalizedRecord::Tag(NormalizedTerm {
                    external_id: 7,
                    name: "rust".to_string(),
                    slug: "rust".to_string(),
                    description: String::new(),
                    parent: None,
                }),
                &ResolvedRelations::default(),
            )
            .await
            .expect("tag");

        let relations = ResolvedRelations {
            author: Some(writer.id),
            tags: vec![tag.id],
            ..ResolvedRelations::default()
        };
        let written = store
            .upsert(&post(10, "Hello"), &relations)
            .await
            .expect("post");

        let item = store
            .find_by_key(&NaturalKey::for_external(ContentKind::Post, 10))
            .expect("find")
            .expect("post stored");
        assert_eq!(item.id, written.id);
        assert_eq!(item.author_id(), Some(writer.id));
        assert_eq!(item.tags(), &[tag.id]);
        assert_eq!(
            store.relations_of(written.id, "tags").expect("relations"),
            vec![tag.id]
        );
    }

    #[tokio::test]
    async fn relation_to_missing_item_rolls_back_the_write() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let relations = ResolvedRelations {
            author: Some(DestinationId(999)),
            ..ResolvedRelations::default()
        };
        let error = store
            .upsert(&post(11, "Orphan"), &relations)
            .await
            .expect_err("foreign key must fail");
        assert!(!error.is_conflict());
        assert_eq!(store.count(ContentKind::Post).expect("count"), 0);
    }

    #[tokio::test]
    async fn blank_titles_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let error = store
            .upsert(&author(2, "   "), &ResolvedRelations::default())
            .await
            .expect_err("must fail");
        assert_eq!(error.reason(), crate::error::FailureReason::WriteRejected);
    }

    #[tokio::test]
    async fn lookup_finds_items_by_natural_key() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let key = NaturalKey::for_external(ContentKind::Author, 5);
        assert_eq!(store.lookup(&key).await.expect("lookup"), None);
        let written = store
            .upsert(&author(5, "Grace"), &ResolvedRelations::default())
            .await
            .expect("upsert");
        assert_eq!(store.lookup(&key).await.expect("lookup"), Some(written.id));
    }

    #[tokio::test]
    async fn media_stream_is_copied_to_disk() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let result = store
            .upsert_media(&media(3), &BytesFetcher(b"jpeg bytes"))
            .await
            .expect("media upsert");
        assert_eq!(result.action, WriteAction::Created);

        let item = store.get(result.id).expect("get").expect("media stored");
        let stored = item.stored_path().expect("stored path");
        let on_disk = fs::read(store.media_dir().join(stored)).expect("read media file");
        assert_eq!(on_disk, b"jpeg bytes");
        assert!(!store.media_dir().join(format!("{stored}.part")).exists());

        let again = store
            .upsert_media(&media(3), &BytesFetcher(b"jpeg bytes"))
            .await
            .expect("second upsert");
        assert_eq!(again.action, WriteAction::Unchanged);
        let stats = store.stats().expect("stats");
        assert_eq!(stats.media_files, 1);
        assert_eq!(stats.media_bytes, 10);
    }

    #[tokio::test]
    async fn failing_media_stream_leaves_no_partial_file() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let error = store
            .upsert_media(&media(4), &BrokenFetcher)
            .await
            .expect_err("stream failure");
        assert!(error.to_string().contains("media stream failed"));

        let leftovers: Vec<_> = fs::read_dir(store.media_dir())
            .expect("media dir exists")
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(store.count(ContentKind::Media).expect("count"), 0);
    }

    #[tokio::test]
    async fn unplaceable_media_file_writes_no_row() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let key = NaturalKey::for_external(ContentKind::Media, 3);
        let blocked = store.media_dir().join("3-photo.jpg");
        fs::create_dir_all(&blocked).expect("occupy target path");

        let error = store
            .upsert_media(&media(3), &BytesFetcher(b"jpeg bytes"))
            .await
            .expect_err("target path is a directory");
        assert!(error.to_string().contains("failed to move media"));
        assert_eq!(store.count(ContentKind::Media).expect("count"), 0);
        assert_eq!(store.stats().expect("stats").media_files, 0);
        assert_eq!(store.lookup(&key).await.expect("lookup"), None);

        fs::remove_dir(&blocked).expect("free target path");
        let retried = store
            .upsert_media(&media(3), &BytesFetcher(b"jpeg bytes"))
            .await
            .expect("retry succeeds");
        assert_eq!(retried.action, WriteAction::Created);
        assert_eq!(fs::read(&blocked).expect("media file"), b"jpeg bytes");
        assert_eq!(store.lookup(&key).await.expect("lookup"), Some(retried.id));
    }

    #[tokio::test]
    async fn media_row_without_its_file_is_restored() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let key = NaturalKey::for_external(ContentKind::Media, 4);
        let first = store
            .upsert_media(&media(4), &BytesFetcher(b"png"))
            .await
            .expect("first upsert");
        let path = store.media_dir().join("4-photo.jpg");
        fs::remove_file(&path).expect("remove stored file");

        assert_eq!(store.lookup(&key).await.expect("lookup"), None);
        let restored = store
            .upsert_media(&media(4), &BytesFetcher(b"png"))
            .await
            .expect("second upsert");
        assert_eq!(restored.action, WriteAction::Unchanged);
        assert_eq!(restored.id, first.id);
        assert!(path.is_file());
        assert_eq!(store.lookup(&key).await.expect("lookup"), Some(first.id));
    }

    #[tokio::test]
    async fn media_records_are_refused_by_plain_upsert() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let error = store
            .upsert(
                &NormalizedRecord::Media(media(5)),
                &ResolvedRelations::default(),
            )
            .await
            .expect_err("must fail");
        assert!(error.to_string().contains("file stream"));
    }

    #[test]
    fn identity_checkpoint_round_trips() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let identities = IdentityMap::new();
        identities.insert(ContentKind::Author, 1, DestinationId(4));
        identities.insert(ContentKind::Tag, 9, DestinationId(5));

        assert_eq!(store.save_identity_checkpoint(&identities).expect("save"), 2);
        let restored = store.load_identity_checkpoint().expect("load");
        assert_eq!(restored.entries(), identities.entries());
        assert_eq!(store.stats().expect("stats").checkpoint_entries, 2);
    }

    #[test]
    fn busy_and_locked_errors_become_conflicts() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(map_sqlite_error("insert", busy).is_conflict());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!map_sqlite_error("insert", constraint).is_conflict());
    }

    #[test]
    fn stored_media_names_are_sanitized() {
        assert_eq!(stored_media_name(3, "photo.jpg"), "3-photo.jpg");
        assert_eq!(stored_media_name(4, "my photo (1).png"), "4-my-photo--1-.png");
        let traversal = stored_media_name(5, "../etc/passwd");
        assert!(traversal.starts_with("5-"));
        assert!(!traversal.contains('/'));
        assert_eq!(stored_media_name(6, ""), "6-media");
    }

    #[test]
    fn hash_is_short_hex() {
        let hash = compute_hash("payload");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, compute_hash("payload"));
    }
}
