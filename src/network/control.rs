//! Control State
//!
//! Durable record of the last acknowledged message id per client session.
//! The file is replaced atomically (write temp, fsync, rename, fsync the
//! directory) so a crash leaves either the old cursor or the new one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

const FORMAT_VERSION: u32 = 1;

/// Cursor for one client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursor {
    pub client_hostname: String,
    pub last_acknowledged_message_id: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlFile {
    format_version: u32,
    sessions: BTreeMap<String, SessionCursor>,
}

/// Persistent per-session acknowledgment cursors
#[derive(Debug)]
pub struct ControlState {
    path: PathBuf,
    max_sessions: usize,
    sessions: HashMap<Uuid, SessionCursor>,
}

impl ControlState {
    /// Load the cursor file, or start empty if it does not exist yet
    pub fn load(path: impl Into<PathBuf>, max_sessions: usize) -> Result<Self> {
        let path = path.into();
        let mut sessions = HashMap::new();

        match fs::read(&path) {
            Ok(bytes) => {
                let file: ControlFile = serde_json::from_slice(&bytes)?;
                if file.format_version != FORMAT_VERSION {
                    return Err(Error::State(format!(
                        "Unsupported control state version {} in {:?}",
                        file.format_version, path
                    )));
                }
                for (key, cursor) in file.sessions {
                    let session = Uuid::parse_str(&key).map_err(|e| {
                        Error::State(format!("Bad session id '{}' in {:?}: {}", key, path, e))
                    })?;
                    sessions.insert(session, cursor);
                }
                tracing::info!("Loaded {} session cursors from {:?}", sessions.len(), path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No control state at {:?}, starting fresh", path);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            max_sessions: max_sessions.max(1),
            sessions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Highest message id acknowledged for `session`, 0 if none
    pub fn last_acknowledged(&self, session: &Uuid) -> u64 {
        self.sessions
            .get(session)
            .map(|c| c.last_acknowledged_message_id)
            .unwrap_or(0)
    }

    pub fn cursor(&self, session: &Uuid) -> Option<&SessionCursor> {
        self.sessions.get(session)
    }

    /// Move the cursor for `session` forward to `message_id` and persist it.
    /// The cursor never moves backwards. On a persist failure the in-memory
    /// cursor is left where it was.
    pub fn advance(
        &mut self,
        session: Uuid,
        client_hostname: &str,
        message_id: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let current = self.last_acknowledged(&session);
        if message_id <= current {
            return Ok(current);
        }

        let previous = self.sessions.insert(
            session,
            SessionCursor {
                client_hostname: client_hostname.to_string(),
                last_acknowledged_message_id: message_id,
                updated_at: now,
            },
        );
        let evicted = self.evict_oldest(&session);

        if let Err(e) = self.persist() {
            match previous {
                Some(cursor) => self.sessions.insert(session, cursor),
                None => self.sessions.remove(&session),
            };
            self.sessions.extend(evicted);
            return Err(e);
        }

        Ok(message_id)
    }

    /// Drop the least recently updated sessions beyond `max_sessions`
    fn evict_oldest(&mut self, keep: &Uuid) -> Vec<(Uuid, SessionCursor)> {
        let mut evicted = Vec::new();
        while self.sessions.len() > self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .filter(|(id, _)| *id != keep)
                .min_by_key(|(_, c)| c.updated_at)
                .map(|(id, _)| *id);

            match oldest.and_then(|id| self.sessions.remove_entry(&id)) {
                Some(entry) => {
                    tracing::debug!("Evicting session cursor {}", entry.0);
                    evicted.push(entry);
                }
                None => break,
            }
        }
        evicted
    }

    fn persist(&self) -> Result<()> {
        let file = ControlFile {
            format_version: FORMAT_VERSION,
            sessions: self
                .sessions
                .iter()
                .map(|(id, c)| (id.to_string(), c.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        File::open(&dir)?.sync_all()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, s).unwrap()
    }

    #[test]
    fn test_cursor_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.json");
        let session = Uuid::new_v4();

        let mut state = ControlState::load(&path, 16).unwrap();
        assert_eq!(state.last_acknowledged(&session), 0);
        state.advance(session, "web-1", 7, at(0)).unwrap();

        let reloaded = ControlState::load(&path, 16).unwrap();
        assert_eq!(reloaded.last_acknowledged(&session), 7);
        assert_eq!(reloaded.cursor(&session).unwrap().client_hostname, "web-1");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_cursor_never_moves_back() {
        let dir = tempdir().unwrap();
        let mut state = ControlState::load(dir.path().join("c.json"), 16).unwrap();
        let session = Uuid::new_v4();

        state.advance(session, "h", 10, at(0)).unwrap();
        assert_eq!(state.advance(session, "h", 4, at(1)).unwrap(), 10);
        assert_eq!(state.last_acknowledged(&session), 10);
    }

    #[test]
    fn test_evicts_oldest_session() {
        let dir = tempdir().unwrap();
        let mut state = ControlState::load(dir.path().join("c.json"), 2).unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        state.advance(a, "a", 1, at(0)).unwrap();
        state.advance(b, "b", 1, at(1)).unwrap();
        state.advance(c, "c", 1, at(2)).unwrap();

        assert_eq!(state.session_count(), 2);
        assert_eq!(state.last_acknowledged(&a), 0);
        assert_eq!(state.last_acknowledged(&c), 1);
    }

    #[test]
    fn test_failed_persist_keeps_old_cursor() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("state");
        let mut state = ControlState::load(parent.join("c.json"), 4).unwrap();
        let session = Uuid::new_v4();

        // Parent is now a regular file, so the write cannot succeed
        fs::write(&parent, b"x").unwrap();

        assert!(state.advance(session, "h", 3, at(0)).is_err());
        assert_eq!(state.last_acknowledged(&session), 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            ControlState::load(&path, 4),
            Err(Error::StateCorrupted(_))
        ));
    }
}
