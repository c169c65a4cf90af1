//! Authenticated mutations requested by the IDE over POST and DELETE.

use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

use crate::allowlist::{Allowlist, RootKind, absolutize};
use crate::error::{ServeError, ServeResult};
use crate::http::{HttpRequest, HttpResponse};
use crate::server::ServerState;
use crate::update::StartOutcome;
use quadplay_export::{ExportRequest, ExportTarget, MANIFEST_SUFFIX};

/// Extensions the IDE may create, overwrite, or delete.
const MUTABLE_EXTENSIONS: &[&str] = &[
    "json", "xml", "pyxl", "png", "pdf", "yml", "yaml", "html", "txt", "md", "tmx", "mp3",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    WriteFile {
        url: String,
        #[serde(default)]
        encoding: String,
        contents: String,
    },
    Open {
        app: String,
        file: String,
    },
    NewGame {
        dir_name: String,
        game_name: String,
        src_url: String,
    },
    Update,
    ExportGame {
        #[serde(default)]
        game_path: String,
        #[serde(default)]
        target: String,
    },
    Quit,
}

/// What the listener does after a command has been handled.
#[derive(Debug)]
pub enum Outcome {
    Respond(HttpResponse),
    /// Send the response, then end the server process.
    Quit(HttpResponse),
}

/// Refuses `--serve` mode and non-loopback peers. Every request that changes
/// the disk or runs a process passes this first.
pub fn local_origin(state: &ServerState, req: &HttpRequest) -> ServeResult<()> {
    if state.config.serve_mode {
        return Err(ServeError::Forbidden(
            "refused mutating request while running with --serve".to_string(),
        ));
    }
    if !req.is_loopback() {
        let peer = req
            .peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(ServeError::Forbidden(format!(
            "refused mutating request from non-local address {peer}"
        )));
    }
    Ok(())
}

/// Local origin and an exact token match. Returns the parsed body.
pub fn guard(state: &ServerState, req: &HttpRequest) -> ServeResult<Value> {
    local_origin(state, req)?;
    let body: Value = serde_json::from_slice(&req.body)
        .map_err(|_| ServeError::Forbidden("request body is not JSON".to_string()))?;
    let token = body.get("token").and_then(Value::as_str).unwrap_or_default();
    if !state.config.token.matches(token) {
        return Err(ServeError::Forbidden(
            "ignored request without proper token".to_string(),
        ));
    }
    Ok(body)
}

fn ok(status: u16) -> HttpResponse {
    HttpResponse::json(status, &json!("OK"))
}

fn mutable_target(allowlist: &Allowlist, web_path: &str) -> ServeResult<PathBuf> {
    let extension = Path::new(web_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    if !MUTABLE_EXTENSIONS.contains(&extension) {
        return Err(ServeError::Illegal(web_path.to_string()));
    }
    allowlist
        .to_fs_path(web_path)
        .ok_or_else(|| ServeError::Illegal(web_path.to_string()))
}

pub fn handle_delete(state: &ServerState, req: &HttpRequest) -> ServeResult<HttpResponse> {
    guard(state, req)?;
    let target = mutable_target(&state.config.allowlist, &req.path)?;
    match fs::remove_file(&target) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ServeError::not_found(req.path.clone()));
        }
        Err(err) => {
            return Err(anyhow::Error::from(err)
                .context(format!("failed deleting {}", target.display()))
                .into());
        }
    }
    info!("deleted {}", target.display());
    Ok(ok(200))
}

pub fn handle_post(state: &ServerState, req: &HttpRequest) -> ServeResult<Outcome> {
    let body = guard(state, req)?;
    let command: Command = serde_json::from_value(body)
        .map_err(|err| ServeError::BadRequest(format!("unrecognized command: {err}")))?;
    execute(state, command)
}

pub fn execute(state: &ServerState, command: Command) -> ServeResult<Outcome> {
    let response = match command {
        Command::WriteFile {
            url,
            encoding,
            contents,
        } => write_file(state, &url, &encoding, &contents)?,
        Command::Open { app, file } => open(state, &app, &file)?,
        Command::NewGame {
            dir_name,
            game_name,
            src_url,
        } => new_game(state, &dir_name, &game_name, &src_url)?,
        Command::Update => update(state)?,
        Command::ExportGame { game_path, target } => export_game(state, &game_path, &target)?,
        Command::Quit => {
            info!("quadplay server terminated");
            return Ok(Outcome::Quit(ok(201)));
        }
    };
    Ok(Outcome::Respond(response))
}

fn write_file(
    state: &ServerState,
    url: &str,
    encoding: &str,
    contents: &str,
) -> ServeResult<HttpResponse> {
    let target = mutable_target(&state.config.allowlist, url)?;
    let bytes = if encoding == "binary" {
        STANDARD
            .decode(contents)
            .map_err(|err| ServeError::BadRequest(format!("invalid base64 contents: {err}")))?
    } else {
        contents.as_bytes().to_vec()
    };

    let mut file = File::create(&target)
        .with_context(|| format!("failed creating {}", target.display()))?;
    file.write_all(&bytes)
        .and_then(|()| file.flush())
        .with_context(|| format!("failed writing {}", target.display()))?;
    drop(file);

    // Windows can report a just-closed new file as missing to the next reader.
    if cfg!(windows) {
        for _ in 0..10 {
            if target.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
    info!("wrote {} file {}", encoding_label(encoding), target.display());
    Ok(ok(201))
}

fn encoding_label(encoding: &str) -> &str {
    if encoding.is_empty() { "utf8" } else { encoding }
}

/// `file` is an absolute filesystem path that must lie inside one of the
/// served roots.
fn local_file(allowlist: &Allowlist, file: &str) -> ServeResult<PathBuf> {
    let path = absolutize(Path::new(file)).map_err(ServeError::Internal)?;
    if allowlist.roots().iter().any(|root| path.starts_with(&root.path)) {
        Ok(path)
    } else {
        Err(ServeError::Illegal(file.to_string()))
    }
}

fn open(state: &ServerState, app: &str, file: &str) -> ServeResult<HttpResponse> {
    let path = local_file(&state.config.allowlist, file)?;
    if app == "<finder>" {
        state.host.reveal_in_file_browser(&path)?;
    } else {
        state.host.open_with_app(app, &path)?;
    }
    Ok(ok(201))
}

fn is_copy_noise(name: &str) -> bool {
    name == ".DS_Store" || name == ".git" || name.ends_with('~') || name.starts_with('#')
}

fn single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

/// Template directory and manifest file name for a `src_url` that is a
/// `quad://` URL, an http URL on this server, or a web path.
fn resolve_template(allowlist: &Allowlist, src_url: &str) -> ServeResult<(PathBuf, String)> {
    let mut web = src_url.to_string();
    for scheme in ["http://", "https://"] {
        if let Some(rest) = web.strip_prefix(scheme) {
            web = match rest.find('/') {
                Some(pos) => rest[pos..].to_string(),
                None => "/".to_string(),
            };
            break;
        }
    }
    if let Some(rest) = web.strip_prefix("quad://") {
        web = format!("{}{rest}", allowlist.root(RootKind::Engine).web_prefix);
    }

    let target = allowlist
        .to_fs_path(&web)
        .ok_or_else(|| ServeError::Illegal(src_url.to_string()))?;
    let is_manifest = target
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
    if is_manifest {
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ServeError::Illegal(src_url.to_string()))?;
        Ok((dir, name))
    } else {
        let stem = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ServeError::Illegal(src_url.to_string()))?;
        let name = format!("{stem}{MANIFEST_SUFFIX}");
        Ok((target, name))
    }
}

fn copy_template(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let walker = WalkDir::new(src).into_iter().filter_entry(|entry| {
        entry.depth() == 0 || !is_copy_noise(&entry.file_name().to_string_lossy())
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed scanning {}", src.display()))?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed creating {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed copying {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn new_game(
    state: &ServerState,
    dir_name: &str,
    game_name: &str,
    src_url: &str,
) -> ServeResult<HttpResponse> {
    let allowlist = &state.config.allowlist;
    if !single_component(dir_name) {
        return Err(ServeError::Illegal(dir_name.to_string()));
    }
    let dst = allowlist.root(RootKind::Library).path.join(dir_name);
    if dst.exists() {
        return Err(ServeError::AlreadyExists(allowlist.listing_path(&dst)));
    }

    let (src_dir, src_manifest) = resolve_template(allowlist, src_url)?;
    let template = src_dir.join(&src_manifest);
    if !template.is_file() {
        return Err(ServeError::not_found(src_url.to_string()));
    }

    let created = populate_new_game(state, &src_dir, &src_manifest, &dst, dir_name, game_name);
    if let Err(err) = created {
        if let Err(cleanup) = fs::remove_dir_all(&dst) {
            warn!("could not remove partial game {}: {cleanup}", dst.display());
        }
        return Err(ServeError::Internal(err));
    }

    info!("created game {dir_name} at {}", dst.display());
    Ok(HttpResponse::json(
        201,
        &json!({ "game": allowlist.web_path_for(&dst) }),
    ))
}

fn populate_new_game(
    state: &ServerState,
    src_dir: &Path,
    src_manifest: &str,
    dst: &Path,
    dir_name: &str,
    game_name: &str,
) -> anyhow::Result<()> {
    copy_template(src_dir, dst)?;

    let gitignore = state
        .config
        .allowlist
        .root(RootKind::Engine)
        .path
        .join(".gitignore");
    if gitignore.is_file() {
        fs::copy(&gitignore, dst.join(".gitignore")).context("failed copying .gitignore")?;
    }

    let mut game = quadplay_workjson::load(&src_dir.join(src_manifest))?;
    let fields = game
        .as_object_mut()
        .ok_or_else(|| anyhow!("{src_manifest} is not a JSON object"))?;
    fields.insert("title".to_string(), json!(game_name));
    fields.insert("screenshot_tag".to_string(), json!(game_name));

    let new_manifest = format!("{dir_name}{MANIFEST_SUFFIX}");
    quadplay_workjson::dump(&dst.join(&new_manifest), &game, Some(4))?;
    if new_manifest != src_manifest {
        let stale = dst.join(src_manifest);
        fs::remove_file(&stale)
            .with_context(|| format!("failed removing {}", stale.display()))?;
    }
    Ok(())
}

fn update(state: &ServerState) -> ServeResult<HttpResponse> {
    info!("updating quadplay");
    let message = match state.updates.start(Arc::clone(&state.update_job))? {
        StartOutcome::Started => "OK",
        StartOutcome::AlreadyRunning => {
            info!("update already in progress");
            "Update already in progress."
        }
    };
    Ok(HttpResponse::json(201, &json!(message)))
}

fn export_game(state: &ServerState, game_path: &str, target: &str) -> ServeResult<HttpResponse> {
    if game_path.is_empty() {
        return Err(ServeError::BadRequest("No game path provided".to_string()));
    }
    let allowlist = &state.config.allowlist;
    let mut manifest = allowlist
        .to_fs_path(game_path)
        .ok_or_else(|| ServeError::Illegal(game_path.to_string()))?;
    if manifest.is_dir() {
        let name = manifest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        manifest = manifest.join(format!("{name}{MANIFEST_SUFFIX}"));
    }
    if !manifest.exists() {
        return Err(ServeError::not_found(format!(
            "Game file {}",
            manifest.display()
        )));
    }

    let request = ExportRequest {
        archive: ExportRequest::default_archive_for(&manifest),
        manifest,
        engine_root: allowlist.root(RootKind::Engine).path.clone(),
        target: ExportTarget::from_hint(target),
    };
    let archive = state.exporter.export(&request)?;
    if let Err(err) = state.host.reveal_in_file_browser(&archive) {
        warn!("could not reveal {}: {err:#}", archive.display());
    }
    Ok(HttpResponse::json(200, &json!({ "status": "success" })))
}

#[cfg(test)]
mod tests {
    use super::{Command, is_copy_noise, single_component};
    use serde_json::json;

    #[test]
    fn commands_parse_from_tagged_bodies() {
        let body = json!({
            "command": "write_file",
            "token": "t",
            "url": "/g/Play.pyxl",
            "encoding": "utf8",
            "contents": "x"
        });
        let command: Command = serde_json::from_value(body).expect("should parse");
        assert_eq!(
            command,
            Command::WriteFile {
                url: "/g/Play.pyxl".into(),
                encoding: "utf8".into(),
                contents: "x".into()
            }
        );

        let quit: Command =
            serde_json::from_value(json!({"command": "quit", "token": "t"})).expect("quit");
        assert_eq!(quit, Command::Quit);

        let export: Command =
            serde_json::from_value(json!({"command": "export_game", "token": "t"}))
                .expect("export");
        assert_eq!(
            export,
            Command::ExportGame {
                game_path: String::new(),
                target: String::new()
            }
        );
    }

    #[test]
    fn unknown_or_incomplete_commands_fail_to_parse() {
        assert!(serde_json::from_value::<Command>(json!({"command": "format_disk"})).is_err());
        assert!(serde_json::from_value::<Command>(json!({"command": "new_game"})).is_err());
    }

    #[test]
    fn new_game_directory_must_be_one_component() {
        assert!(single_component("pong"));
        assert!(!single_component("../pong"));
        assert!(!single_component("a/b"));
        assert!(!single_component(".."));
        assert!(!single_component(""));
    }

    #[test]
    fn copy_noise_patterns() {
        assert!(is_copy_noise(".git"));
        assert!(is_copy_noise("Play.pyxl~"));
        assert!(is_copy_noise("#Play.pyxl#"));
        assert!(!is_copy_noise("Makefile"));
    }
}
