#![allow(dead_code)]

use anyhow::{Result, anyhow};
use quadplay_export::{ExportRequest, GameExporter};
use quadplay_server::commands::Outcome;
use quadplay_server::http::HttpRequest;
use quadplay_server::server::{self, ServerConfig, ServerHandle, ServerState};
use quadplay_server::{
    Allowlist, HostEnvironment, KeyWatcher, Platform, SessionToken, UpdateJob,
};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

pub const TOKEN: &str = "0123456789abcdef";

#[derive(Default)]
pub struct FakeHost {
    pub revealed: Mutex<Vec<PathBuf>>,
    pub opened: Mutex<Vec<(String, PathBuf)>>,
}

impl HostEnvironment for FakeHost {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn has_git(&self) -> bool {
        false
    }

    fn find_browser(&self) -> Option<PathBuf> {
        None
    }

    fn reveal_in_file_browser(&self, path: &Path) -> Result<()> {
        self.revealed
            .lock()
            .expect("lock should work")
            .push(path.to_path_buf());
        Ok(())
    }

    fn open_with_app(&self, app: &str, path: &Path) -> Result<()> {
        self.opened
            .lock()
            .expect("lock should work")
            .push((app.to_string(), path.to_path_buf()));
        Ok(())
    }

    fn open_url(&self, _url: &str, _fullscreen: bool) -> Result<Child> {
        Err(anyhow!("no browser in tests"))
    }

    fn key_watcher(&self) -> KeyWatcher {
        KeyWatcher::new()
    }
}

#[derive(Default)]
pub struct FakeExporter {
    pub fail: bool,
    pub requests: Mutex<Vec<ExportRequest>>,
}

impl GameExporter for FakeExporter {
    fn export(&self, req: &ExportRequest) -> Result<PathBuf> {
        if self.fail {
            return Err(anyhow!("exporter exploded"));
        }
        self.requests
            .lock()
            .expect("lock should work")
            .push(req.clone());
        Ok(req.archive.clone())
    }
}

/// Update job that blocks until the test releases it.
pub struct GatedUpdate {
    gate: Mutex<Receiver<bool>>,
}

impl UpdateJob for GatedUpdate {
    fn run(&self) -> Result<bool> {
        let gate = self.gate.lock().expect("lock should work");
        Ok(gate.recv().unwrap_or(false))
    }
}

pub struct TestServer {
    pub dir: TempDir,
    pub engine: PathBuf,
    pub game: PathBuf,
    pub library: PathBuf,
    pub host: Arc<FakeHost>,
    pub exporter: Arc<FakeExporter>,
    pub release_update: Sender<bool>,
    pub state: Arc<ServerState>,
    pub handle: Option<ServerHandle>,
    pub addr: SocketAddr,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir should work");
    }
    fs::write(path, contents).expect("write should work");
}

pub fn start_server(failing_exporter: bool) -> TestServer {
    start_server_with(false, failing_exporter)
}

/// Like `start_server`, with `--serve` mode selectable.
pub fn start_server_with(serve_mode: bool, failing_exporter: bool) -> TestServer {
    let dir = tempdir().expect("tempdir should work");
    let engine = dir.path().join("quadplay");
    let game = dir.path().join("work").join("pong");
    let library = dir.path().join("my_quadplay");

    write(&engine.join("console/version.js"), "const version = '2024.01.02.03';");
    write(&engine.join("console/icons/favicon.ico"), "ICO");
    write(&engine.join(".gitignore"), "*.zip\n");
    write(
        &engine.join("examples/starter/starter.game.json"),
        "{title: 'Starter', // template\n version: 1,}",
    );
    write(&engine.join("examples/starter/Play.pyxl"), "// play");
    write(&engine.join("examples/starter/Play.pyxl~"), "// backup");
    write(&game.join("pong.game.json"), r#"{"title": "Pong"}"#);
    write(&game.join("Play.pyxl"), "// pong");
    fs::create_dir_all(&library).expect("mkdir should work");

    let allowlist = Allowlist::resolve(&engine, &game, &library).expect("allowlist");
    let config = ServerConfig {
        allowlist,
        token: SessionToken::from_string(TOKEN),
        serve_mode,
        kiosk: false,
        exit_on_quit: false,
    };

    let host = Arc::new(FakeHost::default());
    let exporter = Arc::new(FakeExporter {
        fail: failing_exporter,
        ..FakeExporter::default()
    });
    let (release_update, gate) = channel();
    let update = Arc::new(GatedUpdate {
        gate: Mutex::new(gate),
    });

    let state = Arc::new(ServerState::new(
        config,
        update,
        exporter.clone(),
        host.clone(),
    ));
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind should work");
    let handle = server::serve(listener, Arc::clone(&state)).expect("serve should work");
    let addr = handle.local_addr();

    TestServer {
        dir,
        engine,
        game,
        library,
        host,
        exporter,
        release_update,
        state,
        handle: Some(handle),
        addr,
    }
}

pub struct Reply {
    pub status: u16,
    pub headers: String,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("body should be JSON")
    }
}

pub fn request(addr: SocketAddr, method: &str, target: &str, body: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).expect("connect should work");
    let head = format!(
        "{method} {target} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).expect("write should work");
    stream.write_all(body.as_bytes()).expect("write should work");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read should work");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response should have headers");
    let headers = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status line");
    Reply {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

pub fn get(addr: SocketAddr, target: &str) -> Reply {
    request(addr, "GET", target, "")
}

pub fn post(addr: SocketAddr, body: serde_json::Value) -> Reply {
    request(addr, "POST", "/", &body.to_string())
}

/// Request as the listener would parse it, arriving from `peer`.
pub fn request_from(peer: &str, method: &str, path: &str, query: &str, body: &str) -> HttpRequest {
    HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        body: body.as_bytes().to_vec(),
        peer: Some(peer.parse().expect("peer address")),
    }
}

pub fn status_of(outcome: Outcome) -> (u16, String) {
    let (Outcome::Respond(response) | Outcome::Quit(response)) = outcome;
    (
        response.status,
        String::from_utf8_lossy(&response.body).into_owned(),
    )
}
