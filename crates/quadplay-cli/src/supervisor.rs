//! Runs the listener in a child process, opens the IDE, and tears the child
//! down when the session ends.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::env;
use std::fs;
use std::net::UdpSocket;
use std::path::Path;
use std::process::{Child, Command, ExitCode, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use quadplay_server::allowlist::absolutize;
use quadplay_server::install::read_installed_version;
use quadplay_server::token::{TOKEN_ENV, handoff_path, write_handoff};
use quadplay_server::{Allowlist, HostEnvironment, NativeHost, RootKind, SessionToken};

use crate::Cli;
use crate::launch::{LaunchContext, is_game_url};

const STARTUP_WAIT: Duration = Duration::from_millis(1500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const BROWSER_POLL: Duration = Duration::from_millis(200);
const KEY_POLL: Duration = Duration::from_millis(250);

pub(crate) fn run(cli: &Cli, ctx: &LaunchContext) -> Result<ExitCode> {
    let quiet = ctx.settings.quiet;
    let allowlist = Allowlist::resolve(&ctx.engine_root, &ctx.project, &ctx.library)?;
    match read_installed_version(&ctx.engine_root) {
        Ok(version) => info!("quadplay {} ({})", version.text, ctx.provenance),
        Err(err) => warn!("could not read installed version: {err:#}"),
    }

    let token = SessionToken::generate();
    let mut child = spawn_listener(&token)?;
    thread::sleep(STARTUP_WAIT);
    if let Some(status) = child.try_wait().context("failed checking listener process")? {
        eprintln!("error: could not start quadplay server ({status})");
        return Ok(ExitCode::from(2));
    }
    write_handoff(&handoff_path(&ctx.engine_root), &token)?;

    let host_name = if cli.serve {
        outward_address()
    } else {
        "127.0.0.1".to_string()
    };
    let url = launch_url(cli, ctx, &allowlist, &host_name, token.as_str(), &user_name());
    if !quiet {
        println!("\nServing from:\n\n   {url}\n");
        println!("   quad://  = {}", ctx.engine_root.display());
        println!("   My games = {}", ctx.library.display());
        println!("   cwd      = {}\n", allowlist.server_root().display());
        if cli.serve {
            println!(
                "Operating in --serve mode. Your firewall may need to be configured to load on other devices.\n"
            );
        }
        if cli.gamepath.is_none() {
            println!("Loading the default game. Pass a game directory or URL to load it directly.\n");
        }
    }

    let host = NativeHost::new();
    match host.find_browser().filter(|_| ctx.settings.nativeapp) {
        Some(browser) => match launch_native_app(&browser, &url, cli.kiosk) {
            Ok(app) => wait_for_app(app, &mut child)?,
            Err(err) => {
                warn!("{err:#}");
                wait_for_key(&host, &url, cli.kiosk, &mut child, quiet)?;
            }
        },
        None => wait_for_key(&host, &url, cli.kiosk, &mut child, quiet)?,
    }

    shutdown(child);
    Ok(ExitCode::SUCCESS)
}

/// Re-executes this binary as the listener, forwarding the original
/// arguments.
fn spawn_listener(token: &SessionToken) -> Result<Child> {
    let exe = env::current_exe().context("failed locating the quadplay executable")?;
    info!("starting local server process");
    Command::new(exe)
        .args(env::args_os().skip(1))
        .arg("--listen-child")
        .env(TOKEN_ENV, token.as_str())
        .stdin(Stdio::piped())
        .spawn()
        .context("failed starting the server process")
}

/// Address other devices on the network can reach this machine at. No
/// packets are sent; connecting a UDP socket only selects a route.
fn outward_address() -> String {
    UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|err| {
            warn!("server IP address is unknown: {err}");
            "127.0.0.1".to_string()
        })
}

fn user_name() -> String {
    let var = if cfg!(windows) { "USERNAME" } else { "USER" };
    env::var(var).unwrap_or_default()
}

pub(crate) fn launch_url(
    cli: &Cli,
    ctx: &LaunchContext,
    allowlist: &Allowlist,
    host: &str,
    token: &str,
    user: &str,
) -> String {
    let engine_prefix = &allowlist.root(RootKind::Engine).web_prefix;
    let mut url = format!(
        "http://{host}:{}{engine_prefix}console/app.html?fastReload=1&token={token}",
        ctx.settings.port
    );
    if ctx.settings.nativeapp {
        url.push_str("&nativeapp=1");
    }
    if !ctx.settings.no_update_check && !cli.kiosk {
        url.push_str("&update=");
        url.push_str(ctx.provenance.update_param());
    }
    if cli.nosleep {
        url.push_str("&nosleep=1");
    }

    let name: String = user
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    url.push_str("&name=");
    url.push_str(&name);

    url.push_str(if cli.kiosk {
        "&mode=Maximal&kiosk=1"
    } else if cli.play {
        "&mode=Windowed"
    } else {
        "&IDE=1"
    });
    if cli.offline {
        url.push_str("&offline=1");
    }

    if let Some(game) = cli.gamepath.as_deref() {
        let game = if is_game_url(game) {
            game.to_string()
        } else {
            match absolutize(Path::new(game)) {
                Ok(path) => allowlist.web_path_for(&path),
                Err(err) => {
                    warn!("{err:#}");
                    game.to_string()
                }
            }
        };
        url.push_str("&game=");
        url.push_str(&game);
    }
    url.push_str("&quadserver=1");
    url
}

fn launch_native_app(browser: &Path, url: &str, kiosk: bool) -> Result<Child> {
    let session = dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join("quadplay_session");
    fs::create_dir_all(&session)
        .with_context(|| format!("failed creating {}", session.display()))?;

    let mut command = Command::new(browser);
    command
        .arg(format!("--app={url}"))
        .arg(format!("--user-data-dir={}", session.display()))
        .arg("--no-user-gesture-required");
    if kiosk {
        command.arg("--start-fullscreen");
    }
    debug!("launching {}", browser.display());
    command
        .stdin(Stdio::null())
        .spawn()
        .with_context(|| format!("failed launching {}", browser.display()))
}

/// The app window owns the session: it ends when the window closes.
fn wait_for_app(mut app: Child, listener: &mut Child) -> Result<()> {
    loop {
        if app.try_wait().context("failed checking browser process")?.is_some() {
            info!("browser closed");
            return Ok(());
        }
        if listener.try_wait().context("failed checking listener process")?.is_some() {
            info!("server process ended");
            return Ok(());
        }
        thread::sleep(BROWSER_POLL);
    }
}

fn wait_for_key(
    host: &NativeHost,
    url: &str,
    kiosk: bool,
    listener: &mut Child,
    quiet: bool,
) -> Result<()> {
    let mut opener = match host.open_url(url, kiosk) {
        Ok(opener) => Some(opener),
        Err(err) => {
            warn!("{err:#}; open the URL above manually");
            None
        }
    };
    let mut keys = host.key_watcher();
    if !quiet {
        println!("Press any key to quit the server.");
    }
    loop {
        if keys.pressed() {
            break;
        }
        if listener.try_wait().context("failed checking listener process")?.is_some() {
            info!("server process ended");
            break;
        }
        thread::sleep(KEY_POLL);
    }
    if let Some(opener) = opener.as_mut() {
        let _ = opener.try_wait();
    }
    Ok(())
}

/// Closes the listener's stdin, gives it the grace period, then kills it.
fn shutdown(mut child: Child) {
    drop(child.stdin.take());
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => {
                info!("quadplay server stopped");
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(err) => {
                warn!("failed checking server process: {err}");
                break;
            }
        }
    }
    if let Err(err) = child.kill() {
        debug!("server process already gone: {err}");
    }
    let _ = child.wait();
    info!("quadplay server terminated");
}
