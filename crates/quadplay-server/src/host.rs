//! Per-OS capabilities: browser discovery, file-browser reveal, external
//! editors, and keypress detection for the supervisor.

use anyhow::{Context, Result};
use log::debug;
use std::env;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }

    /// Section of `external-applications.json` that applies here.
    pub fn external_apps_key(self) -> Option<&'static str> {
        match self {
            Self::Windows => Some("Windows"),
            Self::MacOs => Some("macOS"),
            Self::Linux | Self::Other => None,
        }
    }
}

pub trait HostEnvironment: Send + Sync {
    fn platform(&self) -> Platform;

    fn has_file_browser(&self) -> bool {
        matches!(self.platform(), Platform::Windows | Platform::MacOs)
    }

    fn has_git(&self) -> bool;

    /// A Chromium-family browser that supports `--app` windows.
    fn find_browser(&self) -> Option<PathBuf>;

    fn reveal_in_file_browser(&self, path: &Path) -> Result<()>;

    fn open_with_app(&self, app: &str, path: &Path) -> Result<()>;

    /// Hands `url` to the desktop's default opener.
    fn open_url(&self, url: &str, fullscreen: bool) -> Result<Child>;

    fn key_watcher(&self) -> KeyWatcher;
}

#[derive(Debug, Clone)]
pub struct NativeHost {
    git: bool,
}

impl NativeHost {
    pub fn new() -> Self {
        Self {
            git: git_available(),
        }
    }
}

impl Default for NativeHost {
    fn default() -> Self {
        Self::new()
    }
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn browser_candidates(platform: Platform) -> Vec<PathBuf> {
    match platform {
        Platform::MacOs => [
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect(),
        Platform::Windows => {
            let mut out = Vec::new();
            for var in ["ProgramFiles(x86)", "ProgramFiles", "LOCALAPPDATA"] {
                let Some(base) = env::var_os(var).map(PathBuf::from) else {
                    continue;
                };
                out.push(base.join("Microsoft/Edge/Application/msedge.exe"));
                out.push(base.join("Google/Chrome/Application/chrome.exe"));
                out.push(base.join("BraveSoftware/Brave-Browser/Application/brave.exe"));
            }
            out
        }
        Platform::Linux | Platform::Other => [
            "/usr/bin/chromium-browser",
            "/usr/bin/chromium",
            "/usr/bin/google-chrome",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect(),
    }
}

impl HostEnvironment for NativeHost {
    fn platform(&self) -> Platform {
        Platform::current()
    }

    fn has_git(&self) -> bool {
        self.git
    }

    fn find_browser(&self) -> Option<PathBuf> {
        browser_candidates(self.platform())
            .into_iter()
            .find(|path| path.is_file())
    }

    fn reveal_in_file_browser(&self, path: &Path) -> Result<()> {
        let mut command = match self.platform() {
            Platform::MacOs => {
                let mut c = Command::new("open");
                c.arg("-R").arg(path);
                c
            }
            Platform::Windows => {
                let mut c = Command::new("explorer");
                c.arg("/select,").arg(path);
                c
            }
            Platform::Linux | Platform::Other => {
                let mut c = Command::new("xdg-open");
                c.arg(path.parent().unwrap_or(path));
                c
            }
        };
        debug!("revealing {}", path.display());
        // explorer.exe reports failure even when the window opens.
        command
            .status()
            .with_context(|| format!("failed revealing {}", path.display()))?;
        Ok(())
    }

    fn open_with_app(&self, app: &str, path: &Path) -> Result<()> {
        let mut command = if self.platform() == Platform::MacOs {
            let mut c = Command::new("open");
            c.arg("-a").arg(app).arg(path);
            c
        } else {
            let mut c = Command::new(app);
            c.arg(path);
            c
        };
        command
            .spawn()
            .with_context(|| format!("failed opening {} with {app}", path.display()))?;
        Ok(())
    }

    fn open_url(&self, url: &str, fullscreen: bool) -> Result<Child> {
        let mut command = match self.platform() {
            Platform::MacOs => {
                let mut c = Command::new("open");
                c.arg(url);
                if fullscreen {
                    c.args(["--args", "--start-fullscreen"]);
                }
                c
            }
            Platform::Windows => {
                let mut c = Command::new("cmd");
                c.args(["/C", "start", "quadplay", url]);
                c
            }
            Platform::Linux | Platform::Other => {
                let mut c = Command::new("xdg-open");
                c.arg(url);
                c
            }
        };
        command
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed launching browser for {url}"))
    }

    fn key_watcher(&self) -> KeyWatcher {
        KeyWatcher::new()
    }
}

/// Non-blocking "was a key pressed" check on the controlling terminal.
/// Reports nothing when stdin is not a terminal.
#[cfg(unix)]
pub struct KeyWatcher {
    active: bool,
    saved: Option<nix::sys::termios::Termios>,
}

#[cfg(unix)]
impl KeyWatcher {
    pub fn new() -> Self {
        use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};
        use std::os::fd::AsFd;

        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Self {
                active: false,
                saved: None,
            };
        }
        let saved = tcgetattr(stdin.as_fd()).ok();
        if let Some(original) = &saved {
            let mut raw = original.clone();
            raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
            if let Err(err) = tcsetattr(stdin.as_fd(), SetArg::TCSAFLUSH, &raw) {
                debug!("could not switch terminal to unbuffered input: {err}");
            }
        }
        Self {
            active: true,
            saved,
        }
    }

    pub fn pressed(&mut self) -> bool {
        use nix::poll::{PollFd, PollFlags, poll};
        use std::os::fd::AsFd;

        if !self.active {
            return false;
        }
        let stdin = io::stdin();
        let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, 0_u16), Ok(ready) if ready > 0)
    }
}

#[cfg(unix)]
impl Drop for KeyWatcher {
    fn drop(&mut self) {
        use nix::sys::termios::{SetArg, tcsetattr};
        use std::os::fd::AsFd;

        if let Some(original) = self.saved.take() {
            let stdin = io::stdin();
            let _ = tcsetattr(stdin.as_fd(), SetArg::TCSAFLUSH, &original);
        }
    }
}

#[cfg(not(unix))]
pub struct KeyWatcher {
    hit: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
}

#[cfg(not(unix))]
impl KeyWatcher {
    pub fn new() -> Self {
        use std::io::Read;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        if !io::stdin().is_terminal() {
            return Self { hit: None };
        }
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        std::thread::spawn(move || {
            let mut byte = [0_u8; 1];
            if io::stdin().read(&mut byte).is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        });
        Self { hit: Some(hit) }
    }

    pub fn pressed(&mut self) -> bool {
        self.hit
            .as_ref()
            .is_some_and(|hit| hit.load(std::sync::atomic::Ordering::SeqCst))
    }
}

impl Default for KeyWatcher {
    fn default() -> Self {
        Self::new()
    }
}
