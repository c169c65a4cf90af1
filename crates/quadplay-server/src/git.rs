use anyhow::Context;
use log::{info, warn};
use std::process::Command;

use crate::commands;
use crate::error::{ServeError, ServeResult};
use crate::http::{HttpRequest, HttpResponse, percent_decode};
use crate::server::ServerState;

const ALLOWED_SUBCOMMANDS: &[&str] = &[
    "pull", "push", "status", "add", "commit", "merge", "reset", "fetch",
];

/// Flags the IDE's version-control panel sends. Anything else starting with
/// `-` is refused, since options such as `--upload-pack` run programs.
const ALLOWED_FLAGS: &[&str] = &[
    "--porcelain",
    "--abort",
    "--no-commit",
    "--no-ff",
    "--ff-only",
    "--quiet",
    "-q",
    "--untracked-files=no",
    "-A",
    "--all",
    "-u",
    "--hard",
    "--soft",
    "--mixed",
];

/// Flags whose next argument is a value (commit message, strategy name).
const VALUE_FLAGS: &[&str] = &["-m", "-s", "-X"];

/// Splits on whitespace, keeping double-quoted runs together.
pub fn split_args(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in command.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}

/// Checks a decoded query before it reaches git.
pub fn permitted(command: &str) -> Option<Vec<String>> {
    if command.contains(['&', '|', ';']) {
        return None;
    }
    let args = split_args(command);
    let (first, rest) = args.split_first()?;
    if !ALLOWED_SUBCOMMANDS.contains(&first.as_str()) {
        return None;
    }

    let mut rest = rest.iter();
    while let Some(arg) = rest.next() {
        if arg == "--" {
            break;
        }
        if VALUE_FLAGS.contains(&arg.as_str()) {
            rest.next()?;
        } else if arg.starts_with('-') && !ALLOWED_FLAGS.contains(&arg.as_str()) {
            return None;
        }
    }
    Some(args)
}

/// Runs `git -C <dir> <query>` for a web path ending in `/_git`. The reply is
/// the exit code on the first line followed by the combined output.
pub fn run(state: &ServerState, req: &HttpRequest) -> ServeResult<HttpResponse> {
    commands::local_origin(state, req)?;
    let web_path = req.path.as_str();
    let query = req.query.as_str();
    let command = percent_decode(query).unwrap_or_else(|| query.to_string());
    if !state.host.has_git() {
        warn!("prevented git {command}: git is not installed");
        return Err(ServeError::not_found(web_path.to_string()));
    }
    let Some(args) = permitted(&command) else {
        warn!("rejected illegal git command: git {command}");
        return Err(ServeError::Illegal(web_path.to_string()));
    };

    let dir_web = web_path.strip_suffix("/_git").unwrap_or(web_path);
    let dir_web = if dir_web.is_empty() { "/" } else { dir_web };
    let dir = state
        .config
        .allowlist
        .to_fs_path(dir_web)
        .ok_or_else(|| ServeError::Illegal(web_path.to_string()))?;

    info!("git -C {} {command}", dir.display());
    let output = Command::new("git")
        .arg("-C")
        .arg(&dir)
        .args(&args)
        .output()
        .context("failed running git")?;
    let code = output.status.code().unwrap_or(-1);
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(HttpResponse {
        status: 200,
        content_type: "text/plain".to_string(),
        body: format!("{code}\n{text}").into_bytes(),
    })
}
