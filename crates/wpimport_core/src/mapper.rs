use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Url;

use crate::error::MappingError;
use crate::model::{
    ContentKind, NormalizedAuthor, NormalizedMedia, NormalizedPost, NormalizedRecord,
    NormalizedTerm, Rendered, SourceRecord, WpMedia, WpPost, WpTerm, WpUser,
};

pub const UNTITLED: &str = "Untitled";
pub const UNTITLED_CATEGORY: &str = "Untitled Category";
pub const UNTITLED_TAG: &str = "Untitled Tag";
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Translate a fetched record into its canonical form.
///
/// Pure and deterministic. Optional fields fall back to placeholders; only a
/// post's publish date, a media source URL, or a kind mismatch can fail.
pub fn normalize(
    kind: ContentKind,
    record: &SourceRecord,
) -> Result<NormalizedRecord, MappingError> {
    if record.kind() != kind {
        return Err(MappingError::KindMismatch {
            expected: kind,
            actual: record.kind(),
        });
    }

    match record {
        SourceRecord::Post(post) => normalize_post(post).map(NormalizedRecord::Post),
        SourceRecord::Category(term) => Ok(NormalizedRecord::Category(normalize_term(
            ContentKind::Category,
            term,
            UNTITLED_CATEGORY,
        ))),
        SourceRecord::Tag(term) => {
            let mut normalized = normalize_term(ContentKind::Tag, term, UNTITLED_TAG);
            normalized.parent = None;
            Ok(NormalizedRecord::Tag(normalized))
        }
        SourceRecord::Author(user) => Ok(NormalizedRecord::Author(normalize_author(user))),
        SourceRecord::Media(media) => normalize_media(media).map(NormalizedRecord::Media),
    }
}

fn normalize_post(post: &WpPost) -> Result<NormalizedPost, MappingError> {
    let raw_date = post
        .date
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or(MappingError::MissingField { field: "date" })?;
    let published_at = parse_source_date(raw_date).ok_or_else(|| MappingError::InvalidDate {
        field: "date",
        value: raw_date.to_string(),
    })?;

    let title = text_or(rendered(&post.title), UNTITLED);
    Ok(NormalizedPost {
        external_id: post.id,
        slug: slug_or_title(ContentKind::Post, post.id, post.slug.as_deref(), &title),
        title,
        body: rendered(&post.content).unwrap_or_default(),
        excerpt: rendered(&post.excerpt).unwrap_or_default(),
        status: post.status.clone().filter(|value| !value.trim().is_empty()),
        published_at,
        modified_at: post.modified.as_deref().and_then(parse_source_date),
        author: non_zero(post.author),
        featured_media: non_zero(post.featured_media),
        categories: non_zero_ids(post.categories.as_deref()),
        tags: non_zero_ids(post.tags.as_deref()),
    })
}

fn normalize_term(kind: ContentKind, term: &WpTerm, placeholder: &str) -> NormalizedTerm {
    let name = text_or(term.name.clone(), placeholder);
    NormalizedTerm {
        external_id: term.id,
        slug: slug_or_title(kind, term.id, term.slug.as_deref(), &name),
        name,
        description: term.description.clone().unwrap_or_default(),
        parent: non_zero(term.parent),
    }
}

fn normalize_author(user: &WpUser) -> NormalizedAuthor {
    let name = text_or(user.name.clone(), UNKNOWN_AUTHOR);
    // Largest avatar WordPress offers; keys are pixel sizes.
    let avatar_url = user.avatar_urls.as_ref().and_then(|urls| {
        urls.iter()
            .max_by_key(|(size, _)| size.parse::<u32>().unwrap_or(0))
            .map(|(_, url)| url.clone())
    });
    NormalizedAuthor {
        external_id: user.id,
        slug: slug_or_title(ContentKind::Author, user.id, user.slug.as_deref(), &name),
        name,
        bio: user.description.clone().unwrap_or_default(),
        website: user.url.clone().filter(|value| !value.trim().is_empty()),
        avatar_url,
    }
}

fn normalize_media(media: &WpMedia) -> Result<NormalizedMedia, MappingError> {
    let source_url = media
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(MappingError::MissingField {
            field: "source_url",
        })?
        .to_string();

    let file_name = file_name_from_url(&source_url)
        .or_else(|| {
            media
                .details_file()
                .and_then(|file| file.rsplit('/').next())
                .filter(|name| !name.is_empty())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| format!("media-{}", media.id));
    let title = text_or(rendered(&media.title), UNTITLED);

    Ok(NormalizedMedia {
        external_id: media.id,
        slug: slug_or_title(ContentKind::Media, media.id, media.slug.as_deref(), &title),
        title,
        source_url,
        file_name,
        mime_type: media.mime_type.clone().filter(|value| !value.is_empty()),
        alt_text: media.alt_text.clone().unwrap_or_default(),
    })
}

/// Parse the timestamp formats WordPress emits. Offsetless values are taken as UTC.
pub fn parse_source_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(ToString::to_string)
}

fn rendered(value: &Option<Rendered>) -> Option<String> {
    value.as_ref().and_then(|inner| inner.rendered.clone())
}

fn text_or(value: Option<String>, placeholder: &str) -> String {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| placeholder.to_string())
}

/// Source slug, else the slugified title, else `{kind}-{id}` when the title has
/// nothing slugify can keep.
fn slug_or_title(kind: ContentKind, external_id: u64, slug: Option<&str>, title: &str) -> String {
    if let Some(slug) = slug.map(str::trim).filter(|value| !value.is_empty()) {
        return slug.to_string();
    }
    let slugged = slug::slugify(title);
    if slugged.is_empty() {
        format!("{kind}-{external_id}")
    } else {
        slugged
    }
}

fn non_zero(value: Option<u64>) -> Option<u64> {
    value.filter(|id| *id != 0)
}

fn non_zero_ids(values: Option<&[u64]>) -> Vec<u64> {
    let mut ids = Vec::new();
    for id in values.unwrap_or_default() {
        if *id != 0 && !ids.contains(id) {
            ids.push(*id);
        }
    }
    ids
}
