//! File-backed mailboxes.
//!
//! Layout under the mailbox root (this is the wire format; external tools
//! read it directly):
//!
//! ```text
//! {root}/{agent}/inbox/*.json       pending, one file per message
//! {root}/{agent}/processed/*.json   consumed messages
//! {root}/broadcasts/*.json          broadcast area, never consumed
//! ```
//!
//! Filenames start with the creation timestamp, so sorting names gives FIFO
//! order. Files appear in an inbox only by atomic rename of a complete temp
//! file, and leave it only by atomic rename into `processed/`. Another
//! process may share the directory; no in-memory lock is relied on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::message::Message;

const INBOX: &str = "inbox";
const PROCESSED: &str = "processed";
const BROADCASTS: &str = "broadcasts";

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed message {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid mailbox name {0:?}")]
    InvalidName(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MailboxError + '_ {
    move |source| MailboxError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Handle to a mailbox root directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
}

impl Mailbox {
    /// Open (creating if needed) a mailbox root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MailboxError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inbox_dir(&self, agent: &str) -> PathBuf {
        self.root.join(agent).join(INBOX)
    }

    pub fn processed_dir(&self, agent: &str) -> PathBuf {
        self.root.join(agent).join(PROCESSED)
    }

    pub fn broadcast_dir(&self) -> PathBuf {
        self.root.join(BROADCASTS)
    }

    /// Write `message` into its recipient's inbox (or the broadcast area when
    /// addressed to [`crate::message::BROADCAST`]). Returns the file written.
    pub fn send(&self, message: &Message) -> Result<PathBuf, MailboxError> {
        if message.is_broadcast() {
            return self.broadcast(message);
        }
        validate_name(message.to())?;
        let path = self.inbox_dir(message.to()).join(message.file_name());
        write_message(&path, message)?;
        info!(
            id = %message.id(),
            from = %message.from(),
            to = %message.to(),
            kind = %message.kind(),
            "Message sent"
        );
        Ok(path)
    }

    /// Take the oldest pending message for `agent`.
    ///
    /// The file is moved to `processed/` before it is parsed, so a concurrent
    /// consumer can never be handed the same message. A file that fails to
    /// parse stays in `processed/` and is reported as
    /// [`MailboxError::Malformed`]; the rest of the inbox is untouched.
    pub fn receive(&self, agent: &str) -> Result<Option<Message>, MailboxError> {
        validate_name(agent)?;
        let inbox = self.inbox_dir(agent);
        let names = match list_messages(&inbox) {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&inbox)(e)),
        };
        if names.is_empty() {
            return Ok(None);
        }

        let processed = self.processed_dir(agent);
        fs::create_dir_all(&processed).map_err(io_err(&processed))?;

        for name in names {
            let from = inbox.join(&name);
            let claimed = processed.join(&name);
            match fs::rename(&from, &claimed) {
                Ok(()) => {}
                // Another consumer got there first.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&from)(e)),
            }
            let message = read_message(&claimed)?;
            debug!(agent, id = %message.id(), "Message received");
            return Ok(Some(message));
        }
        Ok(None)
    }

    /// Write `message` to the shared broadcast area. Broadcasts are read with
    /// [`Mailbox::broadcasts`] and are never consumed.
    pub fn broadcast(&self, message: &Message) -> Result<PathBuf, MailboxError> {
        let path = self.broadcast_dir().join(message.file_name());
        write_message(&path, message)?;
        info!(id = %message.id(), from = %message.from(), "Broadcast sent");
        Ok(path)
    }

    /// All broadcasts in creation order.
    pub fn broadcasts(&self) -> Result<Vec<Message>, MailboxError> {
        let dir = self.broadcast_dir();
        let names = match list_messages(&dir) {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };
        names
            .iter()
            .map(|name| read_message(&dir.join(name)))
            .collect()
    }

    /// Number of messages waiting in `agent`'s inbox.
    pub fn pending(&self, agent: &str) -> Result<usize, MailboxError> {
        validate_name(agent)?;
        let inbox = self.inbox_dir(agent);
        match list_messages(&inbox) {
            Ok(names) => Ok(names.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_err(&inbox)(e)),
        }
    }
}

fn validate_name(name: &str) -> Result<(), MailboxError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name == BROADCASTS
        || name.contains(['/', '\\']);
    if bad {
        return Err(MailboxError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn write_message(path: &Path, message: &Message) -> Result<(), MailboxError> {
    let body = serde_json::to_vec_pretty(message).map_err(|source| MailboxError::Encode {
        id: message.id().to_string(),
        source,
    })?;
    write_atomic(path, &body).map_err(io_err(path))
}

fn read_message(path: &Path) -> Result<Message, MailboxError> {
    let raw = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&raw).map_err(|source| MailboxError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Sorted `*.json` names in `dir`, skipping dot-prefixed temp files.
fn list_messages(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        if entry.file_type()?.is_file() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BROADCAST, MessageKind};
    use serde_json::json;

    fn note(from: &str, to: &str, n: u32) -> Message {
        Message::builder(from, to, MessageKind::Notification)
            .payload(json!({ "n": n }))
            .build()
    }

    #[test]
    fn receive_on_missing_inbox_is_none() {
        let temp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::open(temp.path()).unwrap();
        assert!(mailbox.receive("Nobody").unwrap().is_none());
        assert_eq!(mailbox.pending("Nobody").unwrap(), 0);
    }

    #[test]
    fn receive_moves_file_to_processed() {
        let temp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::open(temp.path()).unwrap();
        let msg = note("QA", "SelfHealing", 1);
        let path = mailbox.send(&msg).unwrap();
        assert!(path.exists());

        let got = mailbox.receive("SelfHealing").unwrap().unwrap();
        assert_eq!(got, msg);
        assert!(!path.exists());
        assert!(mailbox.processed_dir("SelfHealing").join(msg.file_name()).exists());
    }

    #[test]
    fn malformed_message_fails_loud_without_blocking_the_rest() {
        let temp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::open(temp.path()).unwrap();
        let inbox = mailbox.inbox_dir("QA");
        fs::create_dir_all(&inbox).unwrap();
        fs::write(inbox.join("0000-00-00T00:00:00.000000_BAD.json"), b"{not json").unwrap();
        let good = note("Orchestrator", "QA", 2);
        mailbox.send(&good).unwrap();

        let err = mailbox.receive("QA").unwrap_err();
        assert!(matches!(err, MailboxError::Malformed { .. }), "{err}");
        assert_eq!(mailbox.receive("QA").unwrap(), Some(good));
        assert!(mailbox.receive("QA").unwrap().is_none());
    }

    #[test]
    fn temp_files_are_invisible_to_readers() {
        let temp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::open(temp.path()).unwrap();
        let inbox = mailbox.inbox_dir("QA");
        fs::create_dir_all(&inbox).unwrap();
        fs::write(inbox.join(".half-written.json.tmp"), b"{").unwrap();
        assert_eq!(mailbox.pending("QA").unwrap(), 0);
        assert!(mailbox.receive("QA").unwrap().is_none());
    }

    #[test]
    fn broadcasts_are_not_consumed() {
        let temp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::open(temp.path()).unwrap();
        let first = note("DeliveryLead", BROADCAST, 1);
        let second = note("DeliveryLead", BROADCAST, 2);
        mailbox.send(&first).unwrap();
        mailbox.broadcast(&second).unwrap();

        assert_eq!(mailbox.broadcasts().unwrap(), vec![first.clone(), second.clone()]);
        assert_eq!(mailbox.broadcasts().unwrap().len(), 2);
        assert!(mailbox.receive("DeliveryLead").unwrap().is_none());
    }

    #[test]
    fn rejects_path_like_names() {
        let temp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::open(temp.path()).unwrap();
        assert!(matches!(
            mailbox.receive("../etc"),
            Err(MailboxError::InvalidName(_))
        ));
        let msg = note("a", "x/y", 0);
        assert!(matches!(mailbox.send(&msg), Err(MailboxError::InvalidName(_))));
    }
}
