//! Enrollment credentials persisted in the agent state directory.

use crate::client::Credentials;
use std::io;
use std::path::{Path, PathBuf};

const AGENT_ID_FILE: &str = "agent_id";
const AGENT_TOKEN_FILE: &str = "agent_token";

/// Reads and writes `agent_id` / `agent_token` under one directory
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stored credentials, or `None` if either file is missing or blank
    pub fn load(&self) -> io::Result<Option<Credentials>> {
        let Some(agent_id) = read_trimmed(&self.dir.join(AGENT_ID_FILE))? else {
            return Ok(None);
        };
        let Some(token) = read_trimmed(&self.dir.join(AGENT_TOKEN_FILE))? else {
            return Ok(None);
        };
        Ok(Some(Credentials { agent_id, token }))
    }

    /// Persist credentials, creating the directory if needed
    pub fn save(&self, credentials: &Credentials) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        write_private(&self.dir.join(AGENT_ID_FILE), &credentials.agent_id)?;
        write_private(&self.dir.join(AGENT_TOKEN_FILE), &credentials.token)
    }
}

fn read_trimmed(path: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value = contents.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    std::fs::write(path, contents)
}
