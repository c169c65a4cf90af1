use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde_json::json;
use std::env;
use std::fs;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::allowlist::{Allowlist, RootKind};
use crate::commands::{self, Outcome};
use crate::endpoints::{self, EndpointTable};
use crate::error::{ServeError, ServeResult};
use crate::git;
use crate::host::HostEnvironment;
use crate::http::{self, HttpRequest, HttpResponse};
use crate::token::{SessionToken, read_handoff};
use crate::update::{UpdateJob, UpdateSlot};
use quadplay_export::GameExporter;

/// Browser icon requests answered from the engine regardless of the allowlist.
const ICON_ALIASES: &[(&str, &str)] = &[
    ("/favicon.ico", "favicon.ico"),
    ("/apple-touch-icon.png", "favicon-64x64.png"),
    ("/apple-touch-icon-precomposed.png", "favicon-64x64.png"),
    ("/apple-touch-icon-120x120.png", "favicon-120x120.png"),
    ("/apple-touch-icon-120x120-precomposed.png", "favicon-120x120.png"),
];

/// Settings fixed for the lifetime of one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub allowlist: Allowlist,
    pub token: SessionToken,
    /// Multi-device mode: listen on all interfaces and refuse mutations.
    pub serve_mode: bool,
    pub kiosk: bool,
    /// `quit` ends the process; otherwise it only stops the listener.
    pub exit_on_quit: bool,
}

pub struct ServerState {
    pub config: ServerConfig,
    pub endpoints: EndpointTable,
    pub updates: UpdateSlot,
    pub update_job: Arc<dyn UpdateJob>,
    pub exporter: Arc<dyn GameExporter>,
    pub host: Arc<dyn HostEnvironment>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        update_job: Arc<dyn UpdateJob>,
        exporter: Arc<dyn GameExporter>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        let endpoints = EndpointTable::new(&config.allowlist);
        Self {
            config,
            endpoints,
            updates: UpdateSlot::default(),
            update_job,
            exporter,
            host,
        }
    }
}

pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    /// Stops accepting connections. In-flight requests finish on their own
    /// threads.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Chooses the interface to listen on.
pub fn listen_host(serve_mode: bool) -> &'static str {
    if serve_mode { "0.0.0.0" } else { "127.0.0.1" }
}

/// Binds `host:port`. If the port is taken, asks the instance recorded in the
/// handoff file to quit and tries exactly once more.
pub fn bind_with_handoff(host: &str, port: u16, handoff: &Path) -> Result<TcpListener> {
    match TcpListener::bind((host, port)) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            info!("cleaning up previous quadplay server instance");
            request_previous_quit(port, handoff);
            thread::sleep(Duration::from_millis(100));
            TcpListener::bind((host, port)).with_context(|| {
                format!("port {port} is in use and the previous server did not release it")
            })
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed binding quadplay server on {host}:{port}"))
        }
    }
}

fn request_previous_quit(port: u16, handoff: &Path) {
    let token = match read_handoff(handoff) {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!("no token from a previous instance at {}", handoff.display());
            return;
        }
        Err(err) => {
            warn!("{err:#}");
            return;
        }
    };
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!("failed building HTTP client: {err}");
            return;
        }
    };
    // The old server exits without necessarily answering.
    let _ = client
        .post(format!("http://127.0.0.1:{port}/"))
        .json(&json!({ "command": "quit", "token": token }))
        .send();
}

/// Makes the server root the working directory. An empty root (separate
/// Windows drives) leaves it unchanged.
pub fn enter_server_root(root: &Path) -> Result<()> {
    if root.as_os_str().is_empty() {
        return Ok(());
    }
    env::set_current_dir(root)
        .with_context(|| format!("failed entering server root {}", root.display()))
}

pub fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<ServerHandle> {
    listener
        .set_nonblocking(true)
        .context("failed setting listener nonblocking mode")?;
    let addr = listener
        .local_addr()
        .context("failed reading listener local address")?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);

    let join_handle = thread::Builder::new()
        .name("listener".to_string())
        .spawn(move || {
            while !stop_for_thread.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        let stop = Arc::clone(&stop_for_thread);
                        let spawned = thread::Builder::new()
                            .name("request".to_string())
                            .spawn(move || {
                                if let Err(err) = handle_connection(stream, &state, &stop) {
                                    debug!("request failed: {err:#}");
                                }
                            });
                        if let Err(err) = spawned {
                            error!("failed spawning request thread: {err}");
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(err) => {
                        error!("listener failed: {err}");
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
        .context("failed spawning listener thread")?;

    Ok(ServerHandle {
        addr,
        stop,
        join_handle: Some(join_handle),
    })
}

fn handle_connection(mut stream: TcpStream, state: &ServerState, stop: &AtomicBool) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("failed setting connection blocking mode")?;
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .context("failed setting read timeout")?;

    let Some(req) = http::read_request(&mut stream).context("failed reading request")? else {
        return Ok(());
    };
    debug!("{} {}", req.method, req.path);
    let head_only = req.method == "HEAD";

    match route(state, &req) {
        Outcome::Respond(response) => {
            http::write_response(&mut stream, &response, head_only)?;
        }
        Outcome::Quit(response) => {
            let _ = http::write_response(&mut stream, &response, head_only);
            if state.config.exit_on_quit {
                process::exit(0);
            }
            stop.store(true, Ordering::SeqCst);
        }
    }
    Ok(())
}

pub fn route(state: &ServerState, req: &HttpRequest) -> Outcome {
    let result = match req.method.as_str() {
        "GET" | "HEAD" => get(state, req).map(Outcome::Respond),
        "POST" => commands::handle_post(state, req),
        "DELETE" => commands::handle_delete(state, req).map(Outcome::Respond),
        _ => Ok(Outcome::Respond(HttpResponse::text(
            405,
            "Method Not Allowed",
        ))),
    };
    result.unwrap_or_else(|err| Outcome::Respond(error_response(req, &err)))
}

fn error_response(req: &HttpRequest, err: &ServeError) -> HttpResponse {
    if !err.should_log() {
        return HttpResponse::empty(err.status());
    }
    match err {
        ServeError::Internal(_) => error!("{} {}: {err}", req.method, req.path),
        _ => warn!("{} {}: {err}", req.method, req.path),
    }
    HttpResponse::json(err.status(), &err.payload())
}

/// Optional files the client asks for speculatively; their absence is routine.
pub fn is_silent_miss(web_path: &str) -> bool {
    let name = web_path.rsplit('/').next().unwrap_or(web_path);
    web_path.ends_with(".debug.json")
        || name == "label64.png"
        || name == "label128.png"
        || web_path.ends_with("favicon.png")
}

fn get(state: &ServerState, req: &HttpRequest) -> ServeResult<HttpResponse> {
    let allowlist = &state.config.allowlist;

    if let Some((_, icon)) = ICON_ALIASES.iter().find(|(alias, _)| *alias == req.path) {
        let path = allowlist
            .root(RootKind::Engine)
            .path
            .join("console")
            .join("icons")
            .join(icon);
        return serve_file(&path, &req.path);
    }

    if !allowlist.is_allowed(&req.path) {
        return Err(ServeError::Illegal(req.path.clone()));
    }

    if let Some(endpoint) = state.endpoints.lookup(&req.path) {
        let body = endpoints::synthesize(state, endpoint, &req.query)?;
        return Ok(HttpResponse::json(200, &body));
    }

    if req.path.ends_with("/_git") {
        return git::run(state, req);
    }

    let path = allowlist
        .to_fs_path(&req.path)
        .ok_or_else(|| ServeError::Illegal(req.path.clone()))?;
    serve_file(&path, &req.path)
}

fn serve_file(path: &Path, web_path: &str) -> ServeResult<HttpResponse> {
    let target: PathBuf = if path.is_dir() {
        let index = path.join("index.html");
        if !index.is_file() {
            return Err(ServeError::not_found(format!("directory listing {web_path}")));
        }
        index
    } else {
        path.to_path_buf()
    };

    match fs::read(&target) {
        Ok(body) => Ok(HttpResponse::file(http::guess_content_type(&target), body)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if is_silent_miss(web_path) {
                Err(ServeError::silent_not_found(web_path))
            } else {
                Err(ServeError::not_found(web_path))
            }
        }
        Err(err) => Err(anyhow::Error::from(err)
            .context(format!("failed reading {}", target.display()))
            .into()),
    }
}
