use anyhow::{Context, Result, anyhow};
use log::info;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use quadplay_config::{
    CliServeOverrides, EnvConfig, ServeDefaults, default_config_dir, expand_home,
    is_default_library, load_file_config, resolve_serve_defaults,
};
use quadplay_server::Provenance;
use quadplay_server::allowlist::{absolutize, validate_library_path};

use crate::Cli;

/// Everything both the supervisor and the listener child derive from the
/// command line before doing any work.
#[derive(Debug, Clone)]
pub(crate) struct LaunchContext {
    pub engine_root: PathBuf,
    /// Game directory or manifest; empty means the working directory.
    pub project: PathBuf,
    pub library: PathBuf,
    pub settings: ServeDefaults,
    pub provenance: Provenance,
}

pub(crate) fn resolve_settings(cli: &Cli) -> Result<ServeDefaults> {
    let overrides = CliServeOverrides {
        port: cli.port,
        my_quadplay: cli.my_quadplay.clone(),
        nativeapp: cli.nativeapp.then_some(true),
        quiet: cli.quiet.then_some(true),
        no_update_check: cli.no_update_check.then_some(true),
        engine_root: cli.quadpath.clone(),
    };
    let search_dir = default_config_dir();
    let file_cfg = load_file_config(cli.config.as_deref(), search_dir.as_deref())?;
    Ok(resolve_serve_defaults(
        &overrides,
        &EnvConfig::from_current_env(),
        file_cfg.as_ref(),
    ))
}

pub(crate) fn prepare(cli: &Cli, settings: ServeDefaults) -> Result<LaunchContext> {
    let engine_root = match &settings.engine_root {
        Some(root) => absolutize(root)?,
        None => locate_engine_root()?,
    };
    let library = prepare_library(&settings.my_quadplay, &engine_root)?;
    let project = cli
        .gamepath
        .as_deref()
        .filter(|path| !is_game_url(path))
        .map(PathBuf::from)
        .unwrap_or_default();
    let provenance = Provenance::detect(&engine_root);

    Ok(LaunchContext {
        engine_root,
        project,
        library,
        settings,
        provenance,
    })
}

/// Game arguments passed to the IDE verbatim rather than served locally.
pub(crate) fn is_game_url(gamepath: &str) -> bool {
    gamepath.starts_with("http://") || gamepath.starts_with("quad://")
}

/// The nearest ancestor of this executable holding a `console/` directory,
/// else the working directory.
fn locate_engine_root() -> Result<PathBuf> {
    if let Ok(exe) = env::current_exe() {
        if let Some(found) = exe
            .ancestors()
            .skip(1)
            .find(|dir| dir.join("console").is_dir())
        {
            return Ok(found.to_path_buf());
        }
    }
    env::current_dir().context("failed reading current directory")
}

fn prepare_library(raw: &str, engine_root: &Path) -> Result<PathBuf> {
    let library = expand_home(raw);
    validate_library_path(&library)?;
    if library.is_dir() {
        return Ok(library);
    }
    if !is_default_library(raw) {
        return Err(anyhow!(
            "the my_quadplay directory {} does not exist",
            library.display()
        ));
    }

    info!("creating {}", library.display());
    fs::create_dir_all(&library)
        .with_context(|| format!("failed creating {}", library.display()))?;
    let gitignore = engine_root.join(".gitignore");
    if gitignore.is_file() {
        fs::copy(&gitignore, library.join(".gitignore"))
            .with_context(|| format!("failed copying .gitignore into {}", library.display()))?;
    }
    Ok(library)
}

#[cfg(test)]
mod tests {
    use super::{is_game_url, prepare_library};
    use tempfile::tempdir;

    #[test]
    fn urls_are_not_local_projects() {
        assert!(is_game_url("quad://examples/accel_demo"));
        assert!(is_game_url("http://example.com/pong.game.json"));
        assert!(!is_game_url("games/pong"));
    }

    #[test]
    fn existing_library_is_used_as_is() {
        let dir = tempdir().expect("tempdir should work");
        let raw = dir.path().to_string_lossy().into_owned();
        let library = prepare_library(&raw, dir.path()).expect("library should resolve");
        assert_eq!(library, dir.path());
    }

    #[test]
    fn missing_custom_library_is_fatal() {
        let dir = tempdir().expect("tempdir should work");
        let raw = dir.path().join("nowhere").to_string_lossy().into_owned();
        let err = prepare_library(&raw, dir.path()).expect_err("missing library should fail");
        assert!(err.to_string().contains("does not exist"));
    }
}
