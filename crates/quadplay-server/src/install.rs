use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    GitClone,
    DevelopmentGitClone,
    DownloadedRelease,
}

impl Provenance {
    pub fn detect(engine_root: &Path) -> Self {
        if !engine_root.join(".git").is_dir() {
            Self::DownloadedRelease
        } else if engine_root.join("_dev").exists() {
            Self::DevelopmentGitClone
        } else {
            Self::GitClone
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::GitClone => "git clone",
            Self::DevelopmentGitClone => "development git clone",
            Self::DownloadedRelease => "downloaded release",
        }
    }

    /// Value of the `update=` launch parameter.
    pub fn update_param(self) -> &'static str {
        match self {
            Self::GitClone => "git",
            Self::DevelopmentGitClone => "dev",
            Self::DownloadedRelease => "1",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A development checkout without git LFS has pointer stubs in place of its
/// binary files; the controller diagram is one of the largest.
pub fn lfs_content_missing(engine_root: &Path) -> bool {
    fs::metadata(engine_root.join("console").join("xbox_controller.png"))
        .map(|meta| meta.len() < 1000)
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    /// Monotonic encoding of `year.month.day.hour` for comparisons.
    pub value: u64,
    pub text: String,
}

pub fn parse_version_js(source: &str) -> InstalledVersion {
    parse_version_line(source).unwrap_or_else(|| InstalledVersion {
        value: 0,
        text: source.to_string(),
    })
}

fn parse_version_line(source: &str) -> Option<InstalledVersion> {
    let line = source
        .lines()
        .map(str::trim_start)
        .find(|line| line.starts_with("const"))?;
    let rest = line.strip_prefix("const")?.trim_start();
    let rest = rest.strip_prefix("version")?.trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    let text = &body[..end];

    let fields: Vec<u64> = text
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<_>>()?;
    let &[year, month, day, hour] = fields.as_slice() else {
        return None;
    };
    Some(InstalledVersion {
        value: ((year * 12 + month) * 32 + day) * 24 + hour,
        text: text.to_string(),
    })
}

pub fn read_installed_version(engine_root: &Path) -> Result<InstalledVersion> {
    let path = engine_root.join("console").join("version.js");
    let source =
        fs::read_to_string(&path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(parse_version_js(&source))
}
