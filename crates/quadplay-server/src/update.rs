//! One-shot self-update of the engine installation.

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use serde_json::{Value, json};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::install::Provenance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Running,
    DoneRestartServer,
    DoneRestartClient,
    Failed(String),
}

impl UpdateStatus {
    pub fn text(&self) -> String {
        match self {
            Self::Running => "Running".to_string(),
            Self::DoneRestartServer => "Done. Restart server.".to_string(),
            Self::DoneRestartClient => "Done. Restart client.".to_string(),
            Self::Failed(reason) => format!("Failed: {reason}"),
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Work performed on the update thread. Returns `true` when the server's own
/// executable changed and must be restarted.
pub trait UpdateJob: Send + Sync {
    fn run(&self) -> Result<bool>;
}

#[derive(Debug)]
pub struct UpdateTask {
    status: Mutex<UpdateStatus>,
}

impl UpdateTask {
    fn new() -> Self {
        Self {
            status: Mutex::new(UpdateStatus::Running),
        }
    }

    pub fn get(&self) -> UpdateStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, status: UpdateStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Holds the most recent update task. A new task starts only when there is
/// none or the previous one has finished.
#[derive(Debug, Default)]
pub struct UpdateSlot {
    current: Mutex<Option<Arc<UpdateTask>>>,
}

impl UpdateSlot {
    pub fn start(&self, job: Arc<dyn UpdateJob>) -> Result<StartOutcome> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current
            .as_ref()
            .is_some_and(|task| task.get() == UpdateStatus::Running)
        {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let task = Arc::new(UpdateTask::new());
        let worker = Arc::clone(&task);
        thread::Builder::new()
            .name("update".to_string())
            .spawn(move || {
                let status = match job.run() {
                    Ok(true) => UpdateStatus::DoneRestartServer,
                    Ok(false) => UpdateStatus::DoneRestartClient,
                    Err(err) => {
                        warn!("update failed: {err:#}");
                        UpdateStatus::Failed(format!("{err:#}"))
                    }
                };
                info!("update finished: {}", status.text());
                worker.set(status);
            })
            .context("failed spawning update thread")?;
        *current = Some(task);
        Ok(StartOutcome::Started)
    }

    pub fn status(&self) -> Option<UpdateStatus> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|task| task.get())
    }

    /// Body of `_update_progress.json`.
    pub fn progress(&self) -> Value {
        match self.status() {
            Some(status) => json!({
                "status": status.text(),
                "done": status.is_done(),
                "restartServer": status == UpdateStatus::DoneRestartServer,
            }),
            None => json!({
                "status": "No update in progress.",
                "done": true,
                "restartServer": false,
            }),
        }
    }
}

/// Updates the engine in place using the strategy its provenance calls for.
#[derive(Debug, Clone)]
pub struct InstallUpdater {
    pub engine_root: PathBuf,
    pub provenance: Provenance,
    pub release_url: String,
    /// Compared before and after to decide between a server or client restart.
    pub entry_point: Option<PathBuf>,
}

impl UpdateJob for InstallUpdater {
    fn run(&self) -> Result<bool> {
        let before = self.entry_point.as_deref().and_then(modified_time);
        match self.provenance {
            Provenance::GitClone => git_pull(&self.engine_root)?,
            Provenance::DevelopmentGitClone => {
                ensure_git_lfs()?;
                git_pull(&self.engine_root)?;
            }
            Provenance::DownloadedRelease => {
                replace_from_release(&self.release_url, &self.engine_root)?
            }
        }
        let after = self.entry_point.as_deref().and_then(modified_time);
        Ok(before != after)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn git_pull(engine_root: &Path) -> Result<()> {
    info!("running git pull in {}", engine_root.display());
    let output = Command::new("git")
        .arg("-C")
        .arg(engine_root)
        .arg("pull")
        .output()
        .map_err(|_| {
            anyhow!(
                "quadplay was installed via git clone but the updater cannot find the git program; delete the .git directory or update manually"
            )
        })?;
    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(anyhow!("git pull failed: {}", text.trim()));
    }
    Ok(())
}

fn ensure_git_lfs() -> Result<()> {
    let ok = Command::new("git")
        .args(["lfs", "version"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(anyhow!(
            "the development build requires git lfs to fetch binary files"
        ))
    }
}

fn replace_from_release(url: &str, engine_root: &Path) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix("quadplay-update")
        .tempdir()
        .context("failed creating update staging directory")?;
    let archive = staging.path().join("quadplay-install.zip");
    download(url, &archive)?;
    install_release_archive(&archive, staging.path(), engine_root)
}

fn download(url: &str, dst: &Path) -> Result<()> {
    info!("downloading {url}");
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .context("failed building HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed downloading {url}"))?
        .error_for_status()
        .with_context(|| format!("download of {url} was refused"))?;
    let mut file =
        File::create(dst).with_context(|| format!("failed creating {}", dst.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("failed saving {}", dst.display()))?;
    Ok(())
}

/// Unpacks a release archive into `staging` and copies its single top-level
/// directory over `engine_root`.
pub fn install_release_archive(archive: &Path, staging: &Path, engine_root: &Path) -> Result<()> {
    let extracted = staging.join("extracted");
    let file =
        File::open(archive).with_context(|| format!("failed opening {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a zip archive", archive.display()))?;
    zip.extract(&extracted)
        .with_context(|| format!("failed extracting {}", archive.display()))?;

    let source = release_root(&extracted)?;
    copy_tree(&source, engine_root)
}

fn release_root(extracted: &Path) -> Result<PathBuf> {
    let preferred = extracted.join("quadplay-main");
    if preferred.is_dir() {
        return Ok(preferred);
    }
    let mut dirs = fs::read_dir(extracted)
        .with_context(|| format!("failed reading {}", extracted.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir());
    match (dirs.next(), dirs.next()) {
        (Some(only), None) => Ok(only),
        _ => Err(anyhow!("release archive has no single top-level directory")),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("failed scanning {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} escaped {}", entry.path().display(), src.display()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed creating {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed copying to {}", target.display()))?;
        }
    }
    Ok(())
}
