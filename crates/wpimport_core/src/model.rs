use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Author,
    Category,
    Tag,
    Media,
    Post,
}

impl ContentKind {
    pub const ALL: [ContentKind; 5] = [
        ContentKind::Author,
        ContentKind::Category,
        ContentKind::Tag,
        ContentKind::Media,
        ContentKind::Post,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Category => "category",
            Self::Tag => "tag",
            Self::Media => "media",
            Self::Post => "post",
        }
    }

    /// WordPress REST collection serving this kind.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Author => "users",
            Self::Category => "categories",
            Self::Tag => "tags",
            Self::Media => "media",
            Self::Post => "posts",
        }
    }

    /// Lower ranks must be imported first.
    pub fn dependency_rank(self) -> u8 {
        match self {
            Self::Author => 0,
            Self::Category => 1,
            Self::Tag => 2,
            Self::Media => 3,
            Self::Post => 4,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "author" | "authors" | "user" | "users" => Some(Self::Author),
            "category" | "categories" => Some(Self::Category),
            "tag" | "tags" => Some(Self::Tag),
            "media" | "medium" => Some(Self::Media),
            "post" | "posts" => Some(Self::Post),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row id of an item in the destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub i64);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key the destination upserts by. Stable across runs for the same source record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub kind: ContentKind,
    pub source_key: String,
}

impl NaturalKey {
    pub fn for_external(kind: ContentKind, external_id: u64) -> Self {
        Self {
            kind,
            source_key: format!("wp:{external_id}"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Rendered {
    pub rendered: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WpPost {
    pub id: u64,
    pub title: Option<Rendered>,
    pub content: Option<Rendered>,
    pub excerpt: Option<Rendered>,
    pub date: Option<String>,
    pub modified: Option<String>,
    pub slug: Option<String>,
    pub status: Option<String>,
    pub author: Option<u64>,
    pub featured_media: Option<u64>,
    pub categories: Option<Vec<u64>>,
    pub tags: Option<Vec<u64>>,
}

/// Categories and tags share the term shape; tags never carry a parent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WpTerm {
    pub id: u64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub slug: Option<String>,
    pub parent: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WpUser {
    pub id: u64,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub avatar_urls: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WpMedia {
    pub id: u64,
    pub source_url: Option<String>,
    pub slug: Option<String>,
    pub title: Option<Rendered>,
    pub mime_type: Option<String>,
    pub alt_text: Option<String>,
    // WordPress sends `[]` instead of an object for some attachment types.
    pub media_details: Option<Value>,
}

impl WpMedia {
    pub fn details_file(&self) -> Option<&str> {
        self.media_details
            .as_ref()
            .and_then(|details| details.get("file"))
            .and_then(Value::as_str)
    }
}

/// Raw record as fetched from the source, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Author(WpUser),
    Category(WpTerm),
    Tag(WpTerm),
    Media(WpMedia),
    Post(WpPost),
}

impl SourceRecord {
    pub fn from_value(kind: ContentKind, value: Value) -> Result<Self, SourceError> {
        let decoded = match kind {
            ContentKind::Author => serde_json::from_value(value).map(Self::Author),
            ContentKind::Category => serde_json::from_value(value).map(Self::Category),
            ContentKind::Tag => serde_json::from_value(value).map(Self::Tag),
            ContentKind::Media => serde_json::from_value(value).map(Self::Media),
            ContentKind::Post => serde_json::from_value(value).map(Self::Post),
        };
        decoded.map_err(|error| {
            SourceError::malformed(format!("failed to decode {kind} record: {error}"))
        })
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Author(_) => ContentKind::Author,
            Self::Category(_) => ContentKind::Category,
            Self::Tag(_) => ContentKind::Tag,
            Self::Media(_) => ContentKind::Media,
            Self::Post(_) => ContentKind::Post,
        }
    }

    pub fn external_id(&self) -> u64 {
        match self {
            Self::Author(user) => user.id,
            Self::Category(term) | Self::Tag(term) => term.id,
            Self::Media(media) => media.id,
            Self::Post(post) => post.id,
        }
    }

    /// Short human label used in outcome messages before normalization succeeds.
    pub fn label(&self) -> String {
        let label = match self {
            Self::Author(user) => user.name.clone(),
            Self::Category(term) | Self::Tag(term) => term.name.clone(),
            Self::Media(media) => media.title.as_ref().and_then(|t| t.rendered.clone()),
            Self::Post(post) => post.title.as_ref().and_then(|t| t.rendered.clone()),
        };
        label
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "untitled".to_string())
    }

    pub fn describe(&self) -> String {
        format!("{} {} ({})", self.kind(), self.external_id(), self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedPost {
    pub external_id: u64,
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub slug: String,
    pub status: Option<String>,
    pub published_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub author: Option<u64>,
    pub featured_media: Option<u64>,
    pub categories: Vec<u64>,
    pub tags: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedTerm {
    pub external_id: u64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub parent: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedAuthor {
    pub external_id: u64,
    pub name: String,
    pub slug: String,
    pub bio: String,
    pub website: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedMedia {
    pub external_id: u64,
    pub title: String,
    pub slug: String,
    pub source_url: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub alt_text: String,
}

/// Canonical, kind-tagged record. Relations are still external ids here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedRecord {
    Author(NormalizedAuthor),
    Category(NormalizedTerm),
    Tag(NormalizedTerm),
    Media(NormalizedMedia),
    Post(NormalizedPost),
}

impl NormalizedRecord {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Author(_) => ContentKind::Author,
            Self::Category(_) => ContentKind::Category,
            Self::Tag(_) => ContentKind::Tag,
            Self::Media(_) => ContentKind::Media,
            Self::Post(_) => ContentKind::Post,
        }
    }

    pub fn external_id(&self) -> u64 {
        match self {
            Self::Author(author) => author.external_id,
            Self::Category(term) | Self::Tag(term) => term.external_id,
            Self::Media(media) => media.external_id,
            Self::Post(post) => post.external_id,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::for_external(self.kind(), self.external_id())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Author(author) => &author.name,
            Self::Category(term) | Self::Tag(term) => &term.name,
            Self::Media(media) => &media.title,
            Self::Post(post) => &post.title,
        }
    }

    pub fn slug(&self) -> &str {
        match self {
            Self::Author(author) => &author.slug,
            Self::Category(term) | Self::Tag(term) => &term.slug,
            Self::Media(media) => &media.slug,
            Self::Post(post) => &post.slug,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} {} ({})", self.kind(), self.external_id(), self.name())
    }
}

/// Relations after identity-map resolution, as destination ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRelations {
    pub author: Option<DestinationId>,
    pub parent: Option<DestinationId>,
    pub featured_media: Option<DestinationId>,
    pub categories: Vec<DestinationId>,
    pub tags: Vec<DestinationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub id: DestinationId,
    pub action: WriteAction,
}

/// Kind-specific payload of a stored content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentFields {
    Author {
        bio: String,
        website: Option<String>,
        avatar_url: Option<String>,
    },
    Category {
        description: String,
        parent: Option<DestinationId>,
    },
    Tag {
        description: String,
    },
    Media {
        file_name: String,
        stored_path: String,
        mime_type: Option<String>,
        alt_text: String,
        byte_len: u64,
    },
    Post {
        title: String,
        body: String,
        excerpt: String,
        status: Option<String>,
        published_at: DateTime<Utc>,
        modified_at: Option<DateTime<Utc>>,
        author: Option<DestinationId>,
        featured_media: Option<DestinationId>,
        categories: Vec<DestinationId>,
        tags: Vec<DestinationId>,
    },
}

/// An item as it exists in the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentItem {
    pub id: DestinationId,
    pub source_key: String,
    pub name: String,
    pub slug: String,
    pub content_hash: String,
    pub fields: ContentFields,
}

impl ContentItem {
    pub fn kind(&self) -> ContentKind {
        match self.fields {
            ContentFields::Author { .. } => ContentKind::Author,
            ContentFields::Category { .. } => ContentKind::Category,
            ContentFields::Tag { .. } => ContentKind::Tag,
            ContentFields::Media { .. } => ContentKind::Media,
            ContentFields::Post { .. } => ContentKind::Post,
        }
    }

    /// Post title, or the item name for every other kind.
    pub fn title(&self) -> &str {
        match &self.fields {
            ContentFields::Post { title, .. } => title,
            _ => &self.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match &self.fields {
            ContentFields::Category { description, .. } | ContentFields::Tag { description } => {
                Some(description)
            }
            ContentFields::Author { bio, .. } => Some(bio),
            ContentFields::Post { excerpt, .. } => Some(excerpt),
            ContentFields::Media { alt_text, .. } => Some(alt_text),
        }
    }

    pub fn publish_date(&self) -> Option<DateTime<Utc>> {
        match &self.fields {
            ContentFields::Post { published_at, .. } => Some(*published_at),
            _ => None,
        }
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        match &self.fields {
            ContentFields::Post { modified_at, .. } => *modified_at,
            _ => None,
        }
    }

    pub fn author_id(&self) -> Option<DestinationId> {
        match &self.fields {
            ContentFields::Post { author, .. } => *author,
            _ => None,
        }
    }

    pub fn featured_media(&self) -> Option<DestinationId> {
        match &self.fields {
            ContentFields::Post { featured_media, .. } => *featured_media,
            _ => None,
        }
    }

    pub fn categories(&self) -> &[DestinationId] {
        match &self.fields {
            ContentFields::Post { categories, .. } => categories,
            _ => &[],
        }
    }

    pub fn tags(&self) -> &[DestinationId] {
        match &self.fields {
            ContentFields::Post { tags, .. } => tags,
            _ => &[],
        }
    }

    pub fn parent(&self) -> Option<DestinationId> {
        match &self.fields {
            ContentFields::Category { parent, .. } => *parent,
            _ => None,
        }
    }

    pub fn stored_path(&self) -> Option<&str> {
        match &self.fields {
            ContentFields::Media { stored_path, .. } => Some(stored_path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kinds_sort_in_dependency_order() {
        let mut kinds = vec![
            ContentKind::Post,
            ContentKind::Tag,
            ContentKind::Author,
            ContentKind::Media,
            ContentKind::Category,
        ];
        kinds.sort();
        assert_eq!(kinds, ContentKind::ALL.to_vec());
        assert!(ContentKind::Author.dependency_rank() < ContentKind::Post.dependency_rank());
    }

    #[test]
    fn kind_names_accept_plural_forms() {
        assert_eq!(ContentKind::from_name("posts"), Some(ContentKind::Post));
        assert_eq!(ContentKind::from_name(" Users "), Some(ContentKind::Author));
        assert_eq!(ContentKind::from_name("comments"), None);
    }

    #[test]
    fn source_record_decodes_post_with_sparse_fields() {
        let record = SourceRecord::from_value(
            ContentKind::Post,
            json!({"id": 12, "title": {"rendered": "Hello"}, "categories": null}),
        )
        .expect("decode");
        assert_eq!(record.kind(), ContentKind::Post);
        assert_eq!(record.external_id(), 12);
        assert_eq!(record.describe(), "post 12 (Hello)");
    }

    #[test]
    fn source_record_without_id_is_malformed() {
        let error = SourceRecord::from_value(ContentKind::Tag, json!({"name": "rust"}))
            .expect_err("must fail");
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("failed to decode tag record"));
    }

    #[test]
    fn media_details_tolerates_empty_array() {
        let record = SourceRecord::from_value(
            ContentKind::Media,
            json!({"id": 4, "source_url": "https://x.test/a.pdf", "media_details": []}),
        )
        .expect("decode");
        let SourceRecord::Media(media) = record else {
            panic!("expected media record");
        };
        assert_eq!(media.details_file(), None);
    }

    #[test]
    fn content_item_accessors_follow_kind() {
        let item = ContentItem {
            id: DestinationId(1),
            source_key: "wp:3".to_string(),
            name: "rust".to_string(),
            slug: "rust".to_string(),
            content_hash: "00".to_string(),
            fields: ContentFields::Tag {
                description: "Rust posts".to_string(),
            },
        };
        assert_eq!(item.kind(), ContentKind::Tag);
        assert_eq!(item.title(), "rust");
        assert_eq!(item.description(), Some("Rust posts"));
        assert!(item.publish_date().is_none());
        assert!(item.categories().is_empty());
    }
}
