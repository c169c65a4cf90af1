use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_LIBRARY_DIR: &str = "~/my_quadplay";
pub const DEFAULT_UPDATE_URL: &str =
    "https://github.com/morgan3d/quadplay/archive/refs/heads/main.zip";
pub const CONFIG_FILE_NAME: &str = "server.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub my_quadplay: Option<String>,
    pub nativeapp: Option<bool>,
    pub quiet: Option<bool>,
    pub no_update_check: Option<bool>,
    pub update_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvConfig {
    pub port: Option<u16>,
    pub my_quadplay: Option<String>,
    pub nativeapp: Option<bool>,
    pub quiet: Option<bool>,
    pub update_url: Option<String>,
    pub engine_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliServeOverrides {
    pub port: Option<u16>,
    pub my_quadplay: Option<String>,
    pub nativeapp: Option<bool>,
    pub quiet: Option<bool>,
    pub no_update_check: Option<bool>,
    pub engine_root: Option<PathBuf>,
}

/// Launch settings after CLI, environment, file, and built-in defaults have
/// been merged. The library path is still unexpanded here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeDefaults {
    pub port: u16,
    pub my_quadplay: String,
    pub nativeapp: bool,
    pub quiet: bool,
    pub no_update_check: bool,
    pub update_url: String,
    pub engine_root: Option<PathBuf>,
}

impl Default for ServeDefaults {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            my_quadplay: DEFAULT_LIBRARY_DIR.to_string(),
            nativeapp: false,
            quiet: false,
            no_update_check: false,
            update_url: DEFAULT_UPDATE_URL.to_string(),
            engine_root: None,
        }
    }
}

/// Directory searched for `server.json` when no explicit path is given.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("quadplay"))
}

pub fn load_file_config(
    explicit_path: Option<&Path>,
    search_dir: Option<&Path>,
) -> Result<Option<FileConfig>> {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => {
            let Some(dir) = search_dir else {
                return Ok(None);
            };
            let candidate = dir.join(CONFIG_FILE_NAME);
            if !candidate.exists() {
                return Ok(None);
            }
            candidate
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    let parsed: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing config file {}", path.display()))?;
    Ok(Some(parsed))
}

impl EnvConfig {
    pub fn from_current_env() -> Self {
        Self {
            port: env::var("QUADPLAY_PORT")
                .ok()
                .and_then(|v| v.trim().parse::<u16>().ok()),
            my_quadplay: env::var("MY_QUADPLAY").ok().filter(|v| !v.trim().is_empty()),
            nativeapp: env::var("QUADPLAY_NATIVEAPP")
                .ok()
                .and_then(|v| parse_bool(&v)),
            quiet: env::var("QUADPLAY_QUIET").ok().and_then(|v| parse_bool(&v)),
            update_url: env::var("QUADPLAY_UPDATE_URL").ok(),
            engine_root: env::var_os("QUADPLAY_ROOT").map(PathBuf::from),
        }
    }
}

pub fn resolve_serve_defaults(
    cli: &CliServeOverrides,
    env_cfg: &EnvConfig,
    file_cfg: Option<&FileConfig>,
) -> ServeDefaults {
    let base = ServeDefaults::default();

    let port = cli
        .port
        .or(env_cfg.port)
        .or(file_cfg.and_then(|c| c.port))
        .unwrap_or(base.port);

    let my_quadplay = cli
        .my_quadplay
        .clone()
        .or_else(|| env_cfg.my_quadplay.clone())
        .or_else(|| file_cfg.and_then(|c| c.my_quadplay.clone()))
        .unwrap_or(base.my_quadplay);

    let nativeapp = cli
        .nativeapp
        .or(env_cfg.nativeapp)
        .or(file_cfg.and_then(|c| c.nativeapp))
        .unwrap_or(base.nativeapp);

    let quiet = cli
        .quiet
        .or(env_cfg.quiet)
        .or(file_cfg.and_then(|c| c.quiet))
        .unwrap_or(base.quiet);

    let no_update_check = cli
        .no_update_check
        .or(file_cfg.and_then(|c| c.no_update_check))
        .unwrap_or(base.no_update_check);

    let update_url = env_cfg
        .update_url
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.update_url.clone()))
        .unwrap_or(base.update_url);

    let engine_root = cli
        .engine_root
        .clone()
        .or_else(|| env_cfg.engine_root.clone())
        .or(base.engine_root);

    ServeDefaults {
        port,
        my_quadplay,
        nativeapp,
        quiet,
        no_update_check,
        update_url,
        engine_root,
    }
}

/// Expands a leading `~` against the user's home directory. Any other path is
/// returned unchanged; relative paths are rejected later by the allowlist.
pub fn expand_home(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    if trimmed == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(trimmed));
    }
    if let Some(rest) = trimmed
        .strip_prefix("~/")
        .or_else(|| trimmed.strip_prefix("~\\"))
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

/// True when `raw` names the built-in library location, which is created on
/// demand instead of being reported missing.
pub fn is_default_library(raw: &str) -> bool {
    expand_home(raw) == expand_home(DEFAULT_LIBRARY_DIR)
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
