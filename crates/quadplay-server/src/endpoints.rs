//! Web paths under the engine's `console/` directory that are answered with
//! computed JSON instead of file contents.

use log::warn;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::allowlist::{Allowlist, RootKind, absolutize, normalize_web_path};
use crate::error::{ServeError, ServeResult};
use crate::http::query_param;
use crate::server::ServerState;
use quadplay_export::MANIFEST_SUFFIX;

/// Directory names whose contents are never offered as scripts or assets.
const AUXILIARY_DIRS: &[&str] = &["journal", "screenshots", "metadata", "backlot", "graveyard"];
const ASSET_KINDS: &[&str] = &["font", "sprite", "sound", "map", "data"];
const SOURCE_EXTENSIONS: &[&str] = &["kra", "psd", "ase", "aseprite"];
const DOC_EXTENSIONS: &[&str] = &["html", "md", "pdf", "txt"];
const RESERVED_IMAGES: &[&str] = &["label64.png", "label128.png", "preview.png"];
const COPIED_GAME_FIELDS: &[&str] = &[
    "developer",
    "version",
    "min_players",
    "max_players",
    "cooperative",
    "competitive",
    "achievements",
    "highscores",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualEndpoint {
    Config,
    Scripts,
    Docs,
    Assets,
    Games,
    UpdateProgress,
}

#[derive(Debug, Clone)]
pub struct EndpointTable {
    entries: Vec<(String, VirtualEndpoint)>,
}

impl EndpointTable {
    pub fn new(allowlist: &Allowlist) -> Self {
        let entries = [
            ("_config.json", VirtualEndpoint::Config),
            ("_scripts.json", VirtualEndpoint::Scripts),
            ("_docs.json", VirtualEndpoint::Docs),
            ("_assets.json", VirtualEndpoint::Assets),
            ("games.json", VirtualEndpoint::Games),
            ("_update_progress.json", VirtualEndpoint::UpdateProgress),
        ]
        .into_iter()
        .filter_map(|(name, endpoint)| {
            normalize_web_path(&allowlist.console_endpoint(name)).map(|path| (path, endpoint))
        })
        .collect();
        Self { entries }
    }

    pub fn lookup(&self, web_path: &str) -> Option<VirtualEndpoint> {
        let normalized = normalize_web_path(web_path)?;
        self.entries
            .iter()
            .find(|(path, _)| {
                if cfg!(windows) {
                    path.eq_ignore_ascii_case(&normalized)
                } else {
                    *path == normalized
                }
            })
            .map(|(_, endpoint)| *endpoint)
    }
}

pub fn synthesize(
    state: &ServerState,
    endpoint: VirtualEndpoint,
    query: &str,
) -> ServeResult<Value> {
    let allowlist = &state.config.allowlist;
    match endpoint {
        VirtualEndpoint::Config => Ok(config_listing(state)),
        VirtualEndpoint::UpdateProgress => Ok(state.updates.progress()),
        VirtualEndpoint::Games => Ok(games_listing(allowlist)),
        VirtualEndpoint::Scripts => {
            let aux = aux_directory(allowlist, query)?;
            Ok(json!(scripts_listing(allowlist, &aux)))
        }
        VirtualEndpoint::Docs => {
            let aux = aux_directory(allowlist, query)?;
            Ok(json!(docs_listing(allowlist, &aux)))
        }
        VirtualEndpoint::Assets => {
            let aux = aux_directory(allowlist, query)?;
            Ok(assets_listing(allowlist, &aux))
        }
    }
}

/// The `aux_webpath` query value is caller data and is checked against the
/// allowlist on its own.
fn aux_directory(allowlist: &Allowlist, query: &str) -> ServeResult<PathBuf> {
    let aux = query_param(query, "aux_webpath")
        .ok_or_else(|| ServeError::BadRequest("missing aux_webpath".to_string()))?;
    allowlist
        .to_fs_path(&aux)
        .ok_or(ServeError::Illegal(aux))
}

fn in_auxiliary_dir(listing: &str) -> bool {
    let mut parts: Vec<&str> = listing.split('/').collect();
    parts.pop();
    parts.iter().any(|part| {
        AUXILIARY_DIRS
            .iter()
            .any(|dir| part.eq_ignore_ascii_case(dir))
    })
}

/// Files under `dir` (recursively) whose names end with one of `suffixes`, in
/// listing form.
fn find_files(allowlist: &Allowlist, dir: &Path, suffixes: &[String]) -> Vec<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
        })
        .map(|entry| allowlist.listing_path(entry.path()))
        .collect()
}

fn extension_suffixes(extensions: &[&str]) -> Vec<String> {
    extensions.iter().map(|ext| format!(".{ext}")).collect()
}

/// Files directly inside an engine directory, sorted, as `quad://` URLs.
fn engine_builtins(allowlist: &Allowlist, subdir: &str, suffix: &str) -> Vec<String> {
    let dir = allowlist.root(RootKind::Engine).path.join(subdir);
    let mut files: Vec<PathBuf> = WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files.iter().map(|path| allowlist.engine_url(path)).collect()
}

pub fn scripts_listing(allowlist: &Allowlist, aux: &Path) -> Vec<String> {
    let mut scripts: Vec<String> = find_files(allowlist, aux, &extension_suffixes(&["pyxl"]))
        .into_iter()
        .filter(|path| !in_auxiliary_dir(path))
        .collect();
    scripts.sort();
    scripts.extend(engine_builtins(allowlist, "scripts", ".pyxl"));
    scripts
}

pub fn docs_listing(allowlist: &Allowlist, aux: &Path) -> Vec<String> {
    let mut docs = find_files(allowlist, aux, &extension_suffixes(DOC_EXTENSIONS));
    docs.sort();
    docs
}

pub fn assets_listing(allowlist: &Allowlist, aux: &Path) -> Value {
    let aux_listing = allowlist.listing_path(aux);
    let in_aux = |name: &str| {
        if aux_listing.is_empty() {
            name.to_string()
        } else {
            format!("{aux_listing}/{name}")
        }
    };

    let mut exclude: HashSet<String> = RESERVED_IMAGES.iter().copied().map(in_aux).collect();
    let mut out = Map::new();
    let mut packaged: Vec<(&str, Vec<String>)> = Vec::new();

    // Every descriptor must be read before raw files are listed, since
    // several kinds share the png extension.
    for kind in ASSET_KINDS {
        let descriptors = find_files(allowlist, aux, &[format!(".{kind}.json")]);
        for listing in &descriptors {
            let path = allowlist.server_root().join(listing);
            match quadplay_workjson::load(&path) {
                Ok(value) => {
                    if let Some(url) = value.get("url").and_then(Value::as_str) {
                        let dir = path.parent().unwrap_or(allowlist.server_root());
                        if let Ok(raw) = absolutize(&dir.join(url)) {
                            exclude.insert(allowlist.listing_path(&raw));
                        }
                    }
                }
                Err(err) => warn!("could not parse {listing}: {err:#}"),
            }
        }
        packaged.push((kind, descriptors));
    }

    let mut sources: Vec<String> = find_files(allowlist, aux, &extension_suffixes(SOURCE_EXTENSIONS))
        .into_iter()
        .filter(|path| !in_auxiliary_dir(path))
        .collect();
    sources.sort();

    for (kind, descriptors) in packaged {
        let mut listing = descriptors;
        if let Some(raw_ext) = raw_extension(kind) {
            listing.extend(
                find_files(allowlist, aux, &extension_suffixes(&[raw_ext]))
                    .into_iter()
                    .filter(|path| !exclude.contains(path)),
            );
        }
        listing.retain(|path| !in_auxiliary_dir(path));
        listing.sort();
        let builtin_dir = if kind == "data" {
            "data".to_string()
        } else {
            format!("{kind}s")
        };
        listing.extend(engine_builtins(
            allowlist,
            &builtin_dir,
            &format!(".{kind}.json"),
        ));
        out.insert(kind.to_string(), json!(listing));
    }
    out.insert("source".to_string(), json!(sources));
    Value::Object(out)
}

fn raw_extension(kind: &str) -> Option<&'static str> {
    match kind {
        "sprite" | "font" => Some("png"),
        "sound" => Some("mp3"),
        "map" => Some("tmx"),
        _ => None,
    }
}

/// `/pong/pong.game.json` is shortened to `/pong/`.
fn collapse_redundant_manifest(url: &str) -> String {
    let Some(stem) = url.strip_suffix(MANIFEST_SUFFIX) else {
        return url.to_string();
    };
    let mut parts = stem.rsplitn(3, '/');
    let (Some(file), Some(dir)) = (parts.next(), parts.next()) else {
        return url.to_string();
    };
    if file == dir && !dir.is_empty() {
        format!("{}/", &url[..url.len() - file.len() - MANIFEST_SUFFIX.len() - 1])
    } else {
        url.to_string()
    }
}

pub fn games_listing(allowlist: &Allowlist) -> Value {
    let engine = &allowlist.root(RootKind::Engine).path;
    let mut buckets: Vec<(&str, PathBuf, bool)> = vec![
        ("examples", engine.join("examples"), false),
        ("builtins", engine.join("games"), false),
        ("mine", allowlist.root(RootKind::Library).path.clone(), true),
    ];
    if engine.join("_alpha").exists() {
        buckets.push(("alpha", engine.join("_alpha"), false));
        buckets.push(("tests", engine.join("_tests"), false));
    }

    let mut out = Map::new();
    for (key, dir, in_library) in buckets {
        let mut manifests: Vec<PathBuf> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(MANIFEST_SUFFIX)
            })
            .map(|entry| entry.into_path())
            .collect();
        manifests.sort();

        let mut entries = Vec::new();
        for manifest in manifests {
            let game = match quadplay_workjson::load(&manifest) {
                Ok(game) => game,
                Err(err) => {
                    warn!("skipping unreadable game {}: {err:#}", manifest.display());
                    continue;
                }
            };
            let url = if in_library {
                format!("/{}", allowlist.listing_path(&manifest))
            } else {
                allowlist.engine_url(&manifest)
            };

            let mut entry = Map::new();
            entry.insert("url".to_string(), json!(collapse_redundant_manifest(&url)));
            entry.insert("title".to_string(), string_field(&game, "title"));
            entry.insert("description".to_string(), string_field(&game, "description"));
            for field in COPIED_GAME_FIELDS {
                if let Some(value) = game.get(*field) {
                    entry.insert((*field).to_string(), value.clone());
                }
            }
            entries.push(Value::Object(entry));
        }
        out.insert(key.to_string(), Value::Array(entries));
    }
    Value::Object(out)
}

fn string_field(game: &Value, key: &str) -> Value {
    game.get(key).cloned().unwrap_or_else(|| json!(""))
}

fn config_listing(state: &ServerState) -> Value {
    let config = &state.config;
    let mut out = Map::new();
    if !config.kiosk {
        let user_var = if cfg!(windows) { "USERNAME" } else { "USER" };
        if let Ok(user) = env::var(user_var) {
            out.insert("IDE_USER".to_string(), json!(user));
        }
    }
    out.insert(
        "rootPath".to_string(),
        json!(
            config
                .allowlist
                .server_root()
                .to_string_lossy()
                .replace('\\', "/")
        ),
    );
    out.insert("hasFinder".to_string(), json!(state.host.has_file_browser()));
    out.insert("hasGit".to_string(), json!(state.host.has_git()));

    if let Some(section) = state.host.platform().external_apps_key() {
        let catalog = config
            .allowlist
            .root(RootKind::Engine)
            .path
            .join("console")
            .join("external-applications.json");
        let applications = match quadplay_workjson::load(&catalog) {
            Ok(value) => installed_applications(value.get(section)),
            Err(err) => {
                warn!("could not read application catalog: {err:#}");
                Vec::new()
            }
        };
        out.insert("applications".to_string(), Value::Array(applications));
    }
    Value::Object(out)
}

/// Catalog entries whose first existing install path is reported.
fn installed_applications(section: Option<&Value>) -> Vec<Value> {
    let Some(candidates) = section.and_then(Value::as_array) else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter_map(|app| {
            let paths = app.get("paths")?.as_array()?;
            let found = paths
                .iter()
                .filter_map(Value::as_str)
                .map(expand_install_path)
                .find(|path| path.exists())?;
            Some(json!({
                "name": app.get("name").cloned().unwrap_or(Value::Null),
                "path": found.to_string_lossy().replace('\\', "/"),
                "types": app.get("types").cloned().unwrap_or_else(|| json!([])),
            }))
        })
        .collect()
}

/// Expands a leading `~` and `$VAR`, `${VAR}`, or `%VAR%` references.
fn expand_install_path(raw: &str) -> PathBuf {
    let with_home = match raw.strip_prefix('~') {
        Some(rest) => match dirs::home_dir() {
            Some(home) => format!("{}{rest}", home.to_string_lossy()),
            None => raw.to_string(),
        },
        None => raw.to_string(),
    };
    PathBuf::from(expand_env_vars(&with_home))
}

fn expand_env_vars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(['$', '%']) {
        out.push_str(&rest[..pos]);
        let marker = &rest[pos..];
        let (name, consumed) = if let Some(body) = marker.strip_prefix("${") {
            match body.find('}') {
                Some(end) => (&body[..end], end + 3),
                None => ("", 0),
            }
        } else if let Some(body) = marker.strip_prefix('%') {
            match body.find('%') {
                Some(end) => (&body[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let body = &marker[1..];
            let end = body
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(body.len());
            (&body[..end], end + 1)
        };

        match env::var(name) {
            Ok(value) if !name.is_empty() => {
                out.push_str(&value);
                rest = &marker[consumed..];
            }
            _ => {
                out.push_str(&marker[..1]);
                rest = &marker[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
