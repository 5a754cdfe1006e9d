use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `wpimport db migrate` to apply pending schema migrations.";

pub const STATE_DIR_NAME: &str = ".wpimport";
pub const DB_FILENAME: &str = "content.db";
pub const MEDIA_DIR_NAME: &str = "media";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub media_dir: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub media_dir_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})\nmedia_dir={}\npolicy={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.media_dir),
            MIGRATIONS_POLICY_MESSAGE
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let media_dir_exists = paths.media_dir.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(".wpimport/ is missing; run `wpimport init` before importing".to_string());
    }
    if !config_exists {
        warnings.push(
            "config.toml is missing; the source URL must come from --source-url or WP_SOURCE_URL"
                .to_string(),
        );
    }
    if !media_dir_exists {
        warnings.push("media/ is missing; media imports will create it on demand".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists,
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        media_dir_exists,
        warnings,
    })
}

pub fn ensure_runtime_ready_for_migration(
    paths: &ResolvedPaths,
    status: &RuntimeStatus,
) -> Result<()> {
    if !status.state_dir_exists || !status.data_dir_exists {
        bail!(
            "Runtime layout is not initialized for import.\nMissing required paths:\n  - {}\n  - {}\nRun: wpimport init --project-root {}",
            if status.state_dir_exists {
                ".wpimport/ (ok)"
            } else {
                ".wpimport/ (missing)"
            },
            if status.data_dir_exists {
                "data dir (ok)"
            } else {
                "data dir (missing)"
            },
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub source_url: Option<String>,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            source_url: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let state_dir = project_root.join(STATE_DIR_NAME);
    let media_dir = project_root.join(MEDIA_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_blank(lookup_env("WPIMPORT_DATA_DIR")) {
        (
            absolutize_from_project(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_blank(lookup_env("WPIMPORT_CONFIG")) {
        (
            absolutize_from_project(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        media_dir,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.media_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(options.source_url.as_deref()),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(source_url: Option<&str>) -> String {
    let url_line = match source_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => format!("url = \"{}\"", url.trim_end_matches('/')),
        None => "# url = \"https://blog.example.org\"".to_string(),
    };

    format!(
        "# wpimport runtime configuration (materialized by `wpimport init`)\n# Run `wpimport db migrate` to apply pending schema migrations.\n\n[source]\n{url_line}\napi_path = \"/wp-json/wp/v2\"\n# user_agent = \"wpimport/0.2\"\ntimeout_ms = 30000\npage_size = 100\n\n[migration]\nkinds = [\"authors\", \"categories\", \"tags\", \"posts\"]\nworkers = 4\nwrite_timeout_ms = 30000\nfetch_attempts = 3\nretry_delay_ms = 500\nimport_media = false\nauthor_required = true\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = non_blank(lookup_env("WPIMPORT_PROJECT_ROOT")) {
        return Ok((absolutize(Path::new(&value), &context.cwd), ValueSource::Env));
    }

    match detect_project_root_heuristic(&context.cwd) {
        Some(root) => Ok((root, ValueSource::Heuristic)),
        None => Ok((context.cwd.clone(), ValueSource::Default)),
    }
}

/// Nearest ancestor of `cwd` (itself included) holding a `.wpimport/` directory.
fn detect_project_root_heuristic(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
pub(crate) fn resolve_paths_for_test(root: &Path) -> ResolvedPaths {
    let context = ResolutionContext {
        cwd: root.to_path_buf(),
    };
    let overrides = PathOverrides {
        project_root: Some(root.to_path_buf()),
        ..PathOverrides::default()
    };
    resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve paths")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource,
        ensure_runtime_ready_for_migration, init_layout, inspect_runtime, normalize_for_display,
        resolve_paths_for_test, resolve_paths_with_lookup,
    };
    use crate::config::load_config;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
        };

        let env = HashMap::from([(
            "WPIMPORT_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
    }

    #[test]
    fn resolve_paths_finds_nearest_initialized_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("site");
        let nested = root.join("drafts").join("2024");
        fs::create_dir_all(root.join(".wpimport")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let context = ResolutionContext {
            cwd: nested.clone(),
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve paths");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
        assert_eq!(resolved.db_path, root.join(".wpimport/data/content.db"));
        assert_eq!(resolved.media_dir, root.join("media"));
    }

    #[test]
    fn uninitialized_cwd_falls_back_to_itself() {
        let temp = tempdir().expect("tempdir");
        let elsewhere = temp.path().join("other-site");
        let cwd = temp.path().join("scratch");
        fs::create_dir_all(elsewhere.join(".wpimport")).expect("state dir");
        fs::create_dir_all(&cwd).expect("cwd");

        let context = ResolutionContext { cwd: cwd.clone() };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve paths");
        assert_eq!(resolved.project_root, cwd);
        assert_eq!(resolved.root_source, ValueSource::Default);
    }

    #[test]
    fn display_paths_use_forward_slashes() {
        assert_eq!(
            normalize_for_display(Path::new(r"C:\site\.wpimport\data")),
            "C:/site/.wpimport/data"
        );
        assert_eq!(normalize_for_display(Path::new("/srv/site")), "/srv/site");
    }

    #[test]
    fn resolve_paths_honours_data_and_config_env() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext {
            cwd: root.clone(),
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([
            ("WPIMPORT_DATA_DIR".to_string(), "store".to_string()),
            ("WPIMPORT_CONFIG".to_string(), "  ".to_string()),
        ]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.data_dir, root.join("store"));
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn init_layout_creates_expected_dirs_and_files() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_for_test(&temp.path().join("project"));

        let report = init_layout(
            &paths,
            &InitOptions {
                source_url: Some("https://blog.example.org/".to_string()),
                ..InitOptions::default()
            },
        )
        .expect("init");

        assert_eq!(report.created_dirs.len(), 3);
        assert!(report.wrote_config);
        assert!(paths.state_dir.exists());
        assert!(paths.data_dir.exists());
        assert!(paths.media_dir.exists());

        let config = load_config(&paths.config_path).expect("materialized config parses");
        assert_eq!(
            config.source.url.as_deref(),
            Some("https://blog.example.org")
        );
        assert_eq!(config.migration.workers, Some(4));
    }

    #[test]
    fn init_layout_keeps_existing_config_without_force() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_for_test(temp.path());
        init_layout(&paths, &InitOptions::default()).expect("first init");
        fs::write(&paths.config_path, "[source]\nurl = \"https://kept.test\"\n")
            .expect("edit config");

        let report = init_layout(&paths, &InitOptions::default()).expect("second init");
        assert!(!report.wrote_config);
        assert!(report.created_dirs.is_empty());
        let content = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(content.contains("kept.test"));
    }

    #[test]
    fn inspect_runtime_reports_missing_layout() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_for_test(temp.path());
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.state_dir_exists);
        assert!(!status.db_exists);
        assert_eq!(status.warnings.len(), 3);
    }

    #[test]
    fn migration_readiness_fails_without_init() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_for_test(temp.path());
        let status = inspect_runtime(&paths).expect("inspect");
        let err = ensure_runtime_ready_for_migration(&paths, &status).expect_err("must fail");
        assert!(
            err.to_string()
                .contains("Runtime layout is not initialized for import")
        );

        init_layout(&paths, &InitOptions::default()).expect("init");
        let status = inspect_runtime(&paths).expect("inspect");
        ensure_runtime_ready_for_migration(&paths, &status).expect("ready after init");
    }
}
