//! Filesystem roots the server may expose and their web-path prefixes.
//!
//! All three roots are re-expressed relative to their common ancestor, the
//! server root. A web path is accepted only when it falls under one of the
//! prefixes at a `/` boundary.

use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::{Component, Path, PathBuf};

use quadplay_export::MANIFEST_SUFFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Engine,
    Project,
    Library,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub kind: RootKind,
    pub path: PathBuf,
    /// Always starts and ends with `/`; the server root itself is `/`.
    pub web_prefix: String,
}

#[derive(Debug, Clone)]
pub struct Allowlist {
    server_root: PathBuf,
    roots: [Root; 3],
}

/// Fails for library paths that would break prefix matching downstream.
pub fn validate_library_path(path: &Path) -> Result<()> {
    let text = path.to_string_lossy();
    if text.chars().any(char::is_whitespace) {
        return Err(anyhow!(
            "the my_quadplay directory ({text}) may not contain spaces; use --my-quadplay to select a path without spaces"
        ));
    }
    if !path.is_absolute() {
        return Err(anyhow!(
            "the my_quadplay directory ({text}) must be an absolute path"
        ));
    }
    Ok(())
}

/// Absolute, lexically normalized form of `path`. Symlinks are not resolved.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    let joined = if path.as_os_str().is_empty() {
        env::current_dir().context("failed reading current directory")?
    } else if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .context("failed reading current directory")?
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

fn common_ancestor(paths: &[&Path]) -> PathBuf {
    let Some(first) = paths.first() else {
        return PathBuf::new();
    };
    let mut shared: Vec<Component<'_>> = first.components().collect();
    for path in &paths[1..] {
        let len = shared
            .iter()
            .zip(path.components())
            .take_while(|(a, b)| same_component(a, b))
            .count();
        shared.truncate(len);
    }
    shared.iter().map(|c| c.as_os_str()).collect()
}

fn same_component(a: &Component<'_>, b: &Component<'_>) -> bool {
    if cfg!(windows) {
        a.as_os_str().to_string_lossy().to_lowercase()
            == b.as_os_str().to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

fn case_fold(text: String) -> String {
    if cfg!(windows) { text.to_lowercase() } else { text }
}

/// Collapses `.` and `..` in a web path. Returns `None` for paths that do not
/// start with `/` or that climb above the server root. The result has a
/// leading `/` and no trailing `/` (the root itself is `/`).
pub fn normalize_web_path(raw: &str) -> Option<String> {
    let raw = raw.replace('\\', "/");
    if !raw.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

impl Allowlist {
    /// `project` may be empty (current directory) or name a manifest, in which
    /// case its directory is used.
    pub fn resolve(engine_root: &Path, project: &Path, library: &Path) -> Result<Self> {
        validate_library_path(library)?;

        let engine = absolutize(engine_root)?;
        let mut project = absolutize(project)?;
        if project.to_string_lossy().ends_with(MANIFEST_SUFFIX) {
            if let Some(parent) = project.parent() {
                project = parent.to_path_buf();
            }
        }
        let library = absolutize(library)?;

        let server_root = common_ancestor(&[&engine, &project, &library]);
        let root = |kind, path: PathBuf| {
            let web_prefix = web_path_under(&server_root, &path);
            Root {
                kind,
                path,
                web_prefix,
            }
        };
        let roots = [
            root(RootKind::Engine, engine),
            root(RootKind::Project, project),
            root(RootKind::Library, library),
        ];
        Ok(Self { server_root, roots })
    }

    pub fn server_root(&self) -> &Path {
        &self.server_root
    }

    pub fn roots(&self) -> &[Root; 3] {
        &self.roots
    }

    pub fn root(&self, kind: RootKind) -> &Root {
        match kind {
            RootKind::Engine => &self.roots[0],
            RootKind::Project => &self.roots[1],
            RootKind::Library => &self.roots[2],
        }
    }

    /// Web path of a synthesized file under the engine's `console/` directory.
    pub fn console_endpoint(&self, name: &str) -> String {
        format!("{}console/{name}", self.root(RootKind::Engine).web_prefix)
    }

    pub fn is_allowed(&self, web_path: &str) -> bool {
        let Some(normalized) = normalize_web_path(web_path) else {
            return false;
        };
        let normalized = case_fold(normalized);
        self.roots.iter().any(|root| {
            let prefix = root.web_prefix.as_str();
            prefix == "/"
                || normalized == prefix.trim_end_matches('/')
                || normalized.starts_with(prefix)
        })
    }

    /// Filesystem location of an allowlisted web path.
    pub fn to_fs_path(&self, web_path: &str) -> Option<PathBuf> {
        if !self.is_allowed(web_path) {
            return None;
        }
        let normalized = normalize_web_path(web_path)?;
        let mut path = self.server_root.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        Some(path)
    }

    /// Web path of a filesystem location, with a trailing `/` for directories
    /// other than manifests.
    pub fn web_path_for(&self, path: &Path) -> String {
        web_path_under(&self.server_root, path)
    }

    /// Listing form of a file under the server root: forward slashes and no
    /// leading slash.
    pub fn listing_path(&self, path: &Path) -> String {
        relative_slashed(&self.server_root, path)
    }

    /// `quad://` form of a file inside the engine install.
    pub fn engine_url(&self, path: &Path) -> String {
        format!(
            "quad://{}",
            relative_slashed(&self.root(RootKind::Engine).path, path)
        )
    }
}

fn relative_slashed(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn web_path_under(server_root: &Path, path: &Path) -> String {
    let relative = relative_slashed(server_root, path);
    let web = if relative.is_empty() {
        "/".to_string()
    } else if relative.ends_with(MANIFEST_SUFFIX) {
        format!("/{relative}")
    } else {
        format!("/{relative}/")
    };
    case_fold(web)
}
