//! File-backed conversation store
//!
//! One pretty-printed JSON document per conversation, named `<uuid>.json`,
//! under a single directory. Writes go to a temporary file that is renamed
//! into place, so a crash never leaves a half-written conversation.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Conversation, ConversationStore, StoreError, StoredMessage};
use crate::messages::MessageRole;

/// Conversation store persisting to a directory of JSON files
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            info!(path = %root.display(), "Created conversation directory");
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the conversation files
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn read(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        match fs::read_to_string(self.path_for(id)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self.path_for(conversation.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(conversation)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl ConversationStore for FileStore {
    fn find_or_create(
        &self,
        id: Option<Uuid>,
        user_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.write_lock.lock();

        if let Some(id) = id {
            if let Some(existing) = self.read(id)? {
                if existing.is_owned_by(user_id) {
                    return Ok(existing);
                }
                debug!(conversation_id = %id, "Conversation owned by another user");
            }
        }

        let conversation = Conversation::new(user_id, title);
        self.write(&conversation)?;
        Ok(conversation)
    }

    fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let _guard = self.write_lock.lock();

        let mut conversation = self
            .read(conversation_id)?
            .ok_or(StoreError::ConversationDeleted(conversation_id))?;
        let message = conversation.push(role, content);
        self.write(&conversation)?;
        Ok(message)
    }

    fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.read(id)
    }

    fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();

        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
