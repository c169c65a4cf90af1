use anyhow::{Context, Result, anyhow};
use log::info;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MANIFEST_SUFFIX: &str = ".game.json";

/// Names never copied into an archive.
const NOISE_NAMES: &[&str] = &[".DS_Store", ".git", "__pycache__", "Makefile"];
const RUNTIME_SKIP_DIRS: &[&str] = &["launcher", "templates", "ace"];
const RUNTIME_SKIP_EXTENSIONS: &[&str] = &["psd", "kra", "zip", "pyc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    /// Game files plus the engine runtime, playable from a static host.
    Standalone,
    /// Game files only; the player loads the runtime from elsewhere.
    GameOnly,
}

impl ExportTarget {
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "remote" | "game" | "game_only" => Self::GameOnly,
            _ => Self::Standalone,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub manifest: PathBuf,
    pub engine_root: PathBuf,
    pub target: ExportTarget,
    pub archive: PathBuf,
}

impl ExportRequest {
    /// Archive path next to the manifest: `foo.game.json` becomes `foo.zip`.
    pub fn default_archive_for(manifest: &Path) -> PathBuf {
        let name = manifest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("game.game.json");
        let stem = name.strip_suffix(MANIFEST_SUFFIX).unwrap_or(name);
        manifest.with_file_name(format!("{stem}.zip"))
    }
}

pub trait GameExporter: Send + Sync {
    /// Builds the archive and returns its path.
    fn export(&self, req: &ExportRequest) -> Result<PathBuf>;
}

/// True for editor backups, lock files, and OS/VCS metadata.
pub fn is_noise(name: &str) -> bool {
    NOISE_NAMES.contains(&name) || name.ends_with('~') || name.starts_with('#')
}

#[derive(Debug, Clone, Default)]
pub struct ZipExporter;

impl GameExporter for ZipExporter {
    fn export(&self, req: &ExportRequest) -> Result<PathBuf> {
        if !req.manifest.is_file() {
            return Err(anyhow!("{} not found", req.manifest.display()));
        }
        let game_dir = req
            .manifest
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", req.manifest.display()))?;
        let game_dir_name = game_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no directory name", game_dir.display()))?;
        let manifest_name = req
            .manifest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let console = req.engine_root.join("console");
        if req.target == ExportTarget::Standalone && !console.is_dir() {
            return Err(anyhow!(
                "engine runtime directory {} is missing",
                console.display()
            ));
        }

        if req.archive.exists() {
            fs::remove_file(&req.archive).with_context(|| {
                format!("failed removing stale archive {}", req.archive.display())
            })?;
        }

        let file = File::create(&req.archive)
            .with_context(|| format!("failed creating {}", req.archive.display()))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        add_tree(&mut writer, options, game_dir, game_dir_name, &req.archive)?;

        if req.target == ExportTarget::Standalone {
            add_tree(&mut writer, options, &console, "console", &req.archive)?;
            writer
                .start_file("index.html", options)
                .context("failed adding index.html")?;
            let page = launcher_page(&format!("{game_dir_name}/{manifest_name}"));
            io::Write::write_all(&mut writer, page.as_bytes())
                .context("failed writing index.html")?;
        }

        writer.finish().context("failed finalizing archive")?;
        info!("exported {} to {}", req.manifest.display(), req.archive.display());
        Ok(req.archive.clone())
    }
}

fn add_tree(
    writer: &mut ZipWriter<File>,
    options: SimpleFileOptions,
    root: &Path,
    prefix: &str,
    archive: &Path,
) -> Result<()> {
    let walker = WalkDir::new(root).sort_by_file_name().into_iter();
    for entry in walker.filter_entry(|e| keep_entry(e.path(), root, e.depth())) {
        let entry = entry.with_context(|| format!("failed scanning {}", root.display()))?;
        let path = entry.path();
        if path == archive || !entry.file_type().is_file() {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", path.display(), root.display()))?;
        let name = format!(
            "{prefix}/{}",
            relative.to_string_lossy().replace('\\', "/")
        );
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("failed adding {name}"))?;
        let mut source =
            File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
        io::copy(&mut source, writer).with_context(|| format!("failed compressing {name}"))?;
    }
    Ok(())
}

fn keep_entry(path: &Path, root: &Path, depth: usize) -> bool {
    if depth == 0 {
        return true;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if is_noise(name) {
        return false;
    }
    if depth == 1 && root.ends_with("console") && RUNTIME_SKIP_DIRS.contains(&name) {
        return false;
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    !RUNTIME_SKIP_EXTENSIONS.contains(&extension.as_str())
}

fn launcher_page(game_url: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
<meta http-equiv=\"refresh\" content=\"0; url=console/app.html?mode=Maximal&game={game_url}\">\
</head><body></body></html>\n"
    )
}
