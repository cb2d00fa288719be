//! Session history on disk, one JSON file per session.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use agent_mesh_core::{Error, Event, SessionStore};

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/agent-mesh/sessions`, or `./.agent-mesh/sessions` when the
    /// platform has no data dir.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("agent-mesh"))
            .unwrap_or_else(|| PathBuf::from(".agent-mesh"))
            .join("sessions")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, session_id: &str) -> Result<PathBuf, Error> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !session_id.starts_with('.');
        if !valid {
            return Err(Error::Store(format!("invalid session id: {session_id:?}")));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<Event>>, Error> {
        let path = self.path(session_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let history: Vec<Event> = serde_json::from_str(&contents)?;
                debug!(path = %path.display(), entries = history.len(), "Loaded history");
                Ok(Some(history))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session_id: &str, history: &[Event]) -> Result<(), Error> {
        let path = self.path(session_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(history)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path(session_id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
