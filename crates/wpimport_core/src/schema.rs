use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::store::SqliteContentStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDefinition {
    pub alias: String,
    pub name: String,
    pub editor: String,
    pub group: String,
    pub mandatory: bool,
    pub sort_order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentTypeDefinition {
    pub alias: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub allowed_as_root: bool,
    pub allowed_children: Vec<String>,
    pub properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateType { alias: String },
    UpdateType { alias: String },
    AddProperty { type_alias: String, alias: String },
    UpdateProperty { type_alias: String, alias: String },
}

impl SchemaChange {
    pub fn describe(&self) -> String {
        match self {
            Self::CreateType { alias } => format!("create type {alias}"),
            Self::UpdateType { alias } => format!("update type {alias}"),
            Self::AddProperty { type_alias, alias } => format!("add property {type_alias}.{alias}"),
            Self::UpdateProperty { type_alias, alias } => {
                format!("update property {type_alias}.{alias}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaSyncReport {
    pub dry_run: bool,
    pub changes: Vec<SchemaChange>,
    pub applied: bool,
}

struct Prop {
    alias: &'static str,
    name: &'static str,
    editor: &'static str,
    group: &'static str,
    mandatory: bool,
}

const fn prop(
    alias: &'static str,
    name: &'static str,
    editor: &'static str,
    group: &'static str,
    mandatory: bool,
) -> Prop {
    Prop {
        alias,
        name,
        editor,
        group,
        mandatory,
    }
}

const TEXTSTRING: &str = "Textstring";
const TEXTAREA: &str = "Textarea";
const RICHTEXT: &str = "Richtext Editor";
const MEDIA_PICKER: &str = "Media Picker";
const DATE_PICKER: &str = "Date Picker";
const CONTENT_PICKER: &str = "Content Picker";

fn definition(
    alias: &str,
    name: &str,
    icon: &str,
    description: &str,
    allowed_as_root: bool,
    allowed_children: &[&str],
    props: &[Prop],
) -> ContentTypeDefinition {
    // Sort order counts within each group.
    let mut next_order: BTreeMap<&str, u32> = BTreeMap::new();
    let properties = props
        .iter()
        .map(|p| {
            let order = next_order.entry(p.group).or_insert(0);
            let property = PropertyDefinition {
                alias: p.alias.to_string(),
                name: p.name.to_string(),
                editor: p.editor.to_string(),
                group: p.group.to_string(),
                mandatory: p.mandatory,
                sort_order: *order,
            };
            *order += 1;
            property
        })
        .collect();
    ContentTypeDefinition {
        alias: alias.to_string(),
        name: name.to_string(),
        icon: icon.to_string(),
        description: description.to_string(),
        allowed_as_root,
        allowed_children: allowed_children.iter().map(ToString::to_string).collect(),
        properties,
    }
}

/// Content types the importer writes into.
pub fn desired_schema() -> Vec<ContentTypeDefinition> {
    vec![
        definition(
            "author",
            "Author",
            "icon-user",
            "Author profile with bio and social links",
            false,
            &[],
            &[
                prop("name", "Name", TEXTSTRING, "Content", true),
                prop("bio", "Bio", RICHTEXT, "Content", false),
                prop("avatar", "Avatar", MEDIA_PICKER, "Content", false),
                prop("twitterUrl", "Twitter URL", TEXTSTRING, "Social Media", false),
                prop("githubUrl", "GitHub URL", TEXTSTRING, "Social Media", false),
                prop("linkedInUrl", "LinkedIn URL", TEXTSTRING, "Social Media", false),
            ],
        ),
        definition(
            "category",
            "Category",
            "icon-folder",
            "Blog post category",
            false,
            &[],
            &[
                prop("name", "Name", TEXTSTRING, "Content", true),
                prop("description", "Description", TEXTAREA, "Content", false),
                prop("slug", "Slug", TEXTSTRING, "Content", false),
            ],
        ),
        definition(
            "tag",
            "Tag",
            "icon-tag",
            "Blog post tag",
            false,
            &[],
            &[
                prop("name", "Name", TEXTSTRING, "Content", true),
                prop("slug", "Slug", TEXTSTRING, "Content", false),
            ],
        ),
        definition(
            "home",
            "Home",
            "icon-home",
            "Homepage",
            true,
            &["author", "category", "tag", "blogPost"],
            &[
                prop("title", "Title", TEXTSTRING, "Content", true),
                prop("metaDescription", "Meta Description", TEXTAREA, "Content", false),
            ],
        ),
        definition(
            "blogPost",
            "Blog Post",
            "icon-document",
            "Blog post article",
            false,
            &[],
            &[
                prop("title", "Title", TEXTSTRING, "Content", true),
                prop("content", "Content", RICHTEXT, "Content", true),
                prop("excerpt", "Excerpt", TEXTAREA, "Content", true),
                prop("featuredImage", "Featured Image", MEDIA_PICKER, "Content", true),
                prop("publishDate", "Publish Date", DATE_PICKER, "Content", true),
                prop("lastUpdated", "Last Updated", DATE_PICKER, "Content", false),
                prop("author", "Author", CONTENT_PICKER, "Metadata", true),
                prop("categories", "Categories", CONTENT_PICKER, "Metadata", false),
                prop("tags", "Tags", CONTENT_PICKER, "Metadata", false),
                prop("metaDescription", "Meta Description", TEXTAREA, "SEO", false),
            ],
        ),
    ]
}

/// Changes needed to bring `current` up to `desired`. Types and properties
/// present only in `current` are left alone.
pub fn plan_schema_sync(
    desired: &[ContentTypeDefinition],
    current: &[ContentTypeDefinition],
) -> Vec<SchemaChange> {
    let current_by_alias: BTreeMap<&str, &ContentTypeDefinition> = current
        .iter()
        .map(|definition| (definition.alias.as_str(), definition))
        .collect();

    let mut changes = Vec::new();
    for wanted in desired {
        let Some(existing) = current_by_alias.get(wanted.alias.as_str()) else {
            changes.push(SchemaChange::CreateType {
                alias: wanted.alias.clone(),
            });
            continue;
        };

        if existing.name != wanted.name
            || existing.icon != wanted.icon
            || existing.description != wanted.description
            || existing.allowed_as_root != wanted.allowed_as_root
            || existing.allowed_children != wanted.allowed_children
        {
            changes.push(SchemaChange::UpdateType {
                alias: wanted.alias.clone(),
            });
        }

        for property in &wanted.properties {
            match existing
                .properties
                .iter()
                .find(|candidate| candidate.alias == property.alias)
            {
                None => changes.push(SchemaChange::AddProperty {
                    type_alias: wanted.alias.clone(),
                    alias: property.alias.clone(),
                }),
                Some(candidate) if candidate != property => {
                    changes.push(SchemaChange::UpdateProperty {
                        type_alias: wanted.alias.clone(),
                        alias: property.alias.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }
    changes
}

pub fn load_current_schema(connection: &Connection) -> Result<Vec<ContentTypeDefinition>> {
    let mut types = Vec::new();
    {
        let mut statement = connection
            .prepare(
                "SELECT alias, name, icon, description, allowed_as_root, allowed_children
                 FROM content_types ORDER BY alias",
            )
            .context("failed to prepare content type query")?;
        let rows = statement
            .query_map([], |row| {
                let children: String = row.get(5)?;
                Ok(ContentTypeDefinition {
                    alias: row.get(0)?,
                    name: row.get(1)?,
                    icon: row.get(2)?,
                    description: row.get(3)?,
                    allowed_as_root: row.get::<_, i64>(4)? != 0,
                    allowed_children: children
                        .split(',')
                        .filter(|alias| !alias.is_empty())
                        .map(ToString::to_string)
                        .collect(),
                    properties: Vec::new(),
                })
            })
            .context("failed to read content types")?;
        for row in rows {
            types.push(row.context("failed to decode content type row")?);
        }
    }

    let mut statement = connection
        .prepare(
            "SELECT alias, name, editor, group_name, mandatory, sort_order
             FROM content_type_properties WHERE type_alias = ?1 ORDER BY rowid",
        )
        .context("failed to prepare property query")?;
    for definition in &mut types {
        let rows = statement
            .query_map([definition.alias.as_str()], |row| {
                Ok(PropertyDefinition {
                    alias: row.get(0)?,
                    name: row.get(1)?,
                    editor: row.get(2)?,
                    group: row.get(3)?,
                    mandatory: row.get::<_, i64>(4)? != 0,
                    sort_order: row.get(5)?,
                })
            })
            .with_context(|| format!("failed to read properties of {}", definition.alias))?;
        for row in rows {
            definition
                .properties
                .push(row.context("failed to decode property row")?);
        }
    }
    Ok(types)
}

/// Diff the desired schema against the store and apply it in one transaction unless `dry_run`.
pub fn sync_schema(store: &SqliteContentStore, dry_run: bool) -> Result<SchemaSyncReport> {
    let desired = desired_schema();
    store.with_connection(|connection| {
        let current = load_current_schema(connection)?;
        let changes = plan_schema_sync(&desired, &current);
        if dry_run || changes.is_empty() {
            return Ok(SchemaSyncReport {
                dry_run,
                changes,
                applied: false,
            });
        }

        let transaction = connection
            .transaction()
            .context("failed to start schema transaction")?;
        for definition in &desired {
            upsert_type(&transaction, definition)?;
        }
        transaction
            .commit()
            .context("failed to commit schema changes")?;
        Ok(SchemaSyncReport {
            dry_run,
            changes,
            applied: true,
        })
    })
}

fn upsert_type(connection: &Connection, definition: &ContentTypeDefinition) -> Result<()> {
    connection
        .execute(
            "INSERT INTO content_types (alias, name, icon, description, allowed_as_root, allowed_children)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(alias) DO UPDATE SET
               name = excluded.name,
               icon = excluded.icon,
               description = excluded.description,
               allowed_as_root = excluded.allowed_as_root,
               allowed_children = excluded.allowed_children",
            params![
                definition.alias,
                definition.name,
                definition.icon,
                definition.description,
                definition.allowed_as_root,
                definition.allowed_children.join(","),
            ],
        )
        .with_context(|| format!("failed to write content type {}", definition.alias))?;

    for property in &definition.properties {
        connection
            .execute(
                "INSERT INTO content_type_properties
                 (type_alias, alias, name, editor, group_name, mandatory, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(type_alias, alias) DO UPDATE SET
                   name = excluded.name,
                   editor = excluded.editor,
                   group_name = excluded.group_name,
                   mandatory = excluded.mandatory,
                   sort_order = excluded.sort_order",
                params![
                    definition.alias,
                    property.alias,
                    property.name,
                    property.editor,
                    property.group,
                    property.mandatory,
                    property.sort_order,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to write property {}.{}",
                    definition.alias, property.alias
                )
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn store(temp: &tempfile::TempDir) -> SqliteContentStore {
        SqliteContentStore::open_in_memory(&temp.path().join("media")).expect("store")
    }

    #[test]
    fn desired_schema_matches_blog_layout() {
        let schema = desired_schema();
        let aliases: Vec<_> = schema.iter().map(|t| t.alias.as_str()).collect();
        assert_eq!(aliases, vec!["author", "category", "tag", "home", "blogPost"]);

        let home = &schema[3];
        assert!(home.allowed_as_root);
        assert!(home.allowed_children.iter().any(|alias| alias == "blogPost"));

        let post = &schema[4];
        let mandatory: Vec<_> = post
            .properties
            .iter()
            .filter(|p| p.mandatory)
            .map(|p| p.alias.as_str())
            .collect();
        assert_eq!(
            mandatory,
            vec!["title", "content", "excerpt", "featuredImage", "publishDate", "author"]
        );
        let seo = post
            .properties
            .iter()
            .find(|p| p.alias == "metaDescription")
            .expect("seo property");
        assert_eq!(seo.group, "SEO");
        assert_eq!(seo.sort_order, 0);
    }

    #[test]
    fn plan_against_empty_store_creates_every_type() {
        let changes = plan_schema_sync(&desired_schema(), &[]);
        assert_eq!(changes.len(), 5);
        assert!(
            changes
                .iter()
                .all(|change| matches!(change, SchemaChange::CreateType { .. }))
        );
    }

    #[test]
    fn plan_detects_missing_and_changed_properties() {
        let desired = desired_schema();
        let mut current = desired.clone();
        current[2].properties.retain(|p| p.alias != "slug");
        current[0].properties[0].mandatory = false;
        current[3].icon = "icon-old".to_string();

        let changes = plan_schema_sync(&desired, &current);
        assert_eq!(
            changes,
            vec![
                SchemaChange::UpdateProperty {
                    type_alias: "author".to_string(),
                    alias: "name".to_string()
                },
                SchemaChange::AddProperty {
                    type_alias: "tag".to_string(),
                    alias: "slug".to_string()
                },
                SchemaChange::UpdateType {
                    alias: "home".to_string()
                },
            ]
        );
    }

    #[test]
    fn dry_run_does_not_write() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let report = sync_schema(&store, true).expect("dry run");
        assert!(!report.applied);
        assert_eq!(report.changes.len(), 5);
        let current = store
            .with_connection(|connection| load_current_schema(connection))
            .expect("load");
        assert!(current.is_empty());
    }

    #[test]
    fn sync_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let store = store(&temp);
        let first = sync_schema(&store, false).expect("first sync");
        assert!(first.applied);

        let second = sync_schema(&store, false).expect("second sync");
        assert!(!second.applied);
        assert!(second.changes.is_empty());

        let current = store
            .with_connection(|connection| load_current_schema(connection))
            .expect("load");
        assert_eq!(current.len(), 5);
        let blog_post = current
            .iter()
            .find(|t| t.alias == "blogPost")
            .expect("blogPost stored");
        assert_eq!(blog_post.properties.len(), 10);
    }
}
