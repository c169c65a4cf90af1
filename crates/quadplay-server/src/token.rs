use anyhow::{Context, Result};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const TOKEN_ENV: &str = "QUADPLAY_SESSION_TOKEN";

/// Secret shared between one server process and the browser it launched.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0_u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Where the running instance leaves its token for the next one.
pub fn handoff_path(engine_root: &Path) -> PathBuf {
    engine_root.join("tools").join("token.txt")
}

pub fn write_handoff(path: &Path, token: &SessionToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(path, token.as_str())
        .with_context(|| format!("failed writing token file {}", path.display()))
}

/// Token left by a previous instance, if any.
pub fn read_handoff(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed reading token file {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionToken, handoff_path, read_handoff, write_handoff};
    use tempfile::tempdir;

    #[test]
    fn generated_tokens_are_distinct_hex() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn match_is_exact() {
        let token = SessionToken::from_string("abc123");
        assert!(token.matches("abc123"));
        assert!(!token.matches("abc1234"));
        assert!(!token.matches("ABC123"));
        assert!(!token.matches(""));
    }

    #[test]
    fn debug_output_hides_secret() {
        let token = SessionToken::from_string("secret");
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[test]
    fn handoff_round_trip() {
        let dir = tempdir().expect("tempdir should work");
        let path = handoff_path(dir.path());
        assert_eq!(read_handoff(&path).expect("read should work"), None);

        let token = SessionToken::generate();
        write_handoff(&path, &token).expect("write should work");
        assert_eq!(
            read_handoff(&path).expect("read should work").as_deref(),
            Some(token.as_str())
        );
    }
}
