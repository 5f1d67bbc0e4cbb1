use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use courier_common::{
    DeliveryAttempt, MessageId, MessageRequest, MessageStatus, OtpCode, internal,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use crate::{
    SerializationError, StoreError, ValidationError,
    r#trait::{DeliveryStateStore, OtpStore, TimeRange},
};

const MESSAGES_DIR: &str = "messages";
const ATTEMPTS_DIR: &str = "attempts";
const OTPS_DIR: &str = "otps";

const RECORD_EXTENSION: &str = "bin";
const LOG_EXTENSION: &str = "jsonl";

const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// File-based store
///
/// Layout under the configured directory:
/// - `messages/{id}.bin`: the current message record, bincode encoded
/// - `attempts/{id}.jsonl`: the attempt log, one JSON document per line
/// - `otps/{hex(recipient)}.bin`: the recipient's active one-time code
///
/// # Atomicity
/// Record files are written to a `.tmp_` file, synced, then renamed over
/// the previous version, so a crash never leaves a half-written record.
/// Attempt logs are only ever appended to and synced; a torn final line
/// left by a crash is ignored on read and truncated on the next append.
///
/// Deletion renames to a `.deleted` suffix first. Leftover temporary and
/// deleted files are removed by [`FileStateStore::init`].
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    append_lock: Arc<Mutex<()>>,
}

impl Default for FileStateStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/courier"),
            append_lock: Arc::default(),
        }
    }
}

// Custom Deserialize implementation with path validation
impl<'de> Deserialize<'de> for FileStateStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileStateStoreHelper {
            path: PathBuf,
        }

        let helper = FileStateStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self {
            path: helper.path,
            append_lock: Arc::default(),
        })
    }
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

impl FileStateStore {
    /// Reject paths that traverse upwards, are relative, or point into
    /// system directories
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentTraversal(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        for prefix in sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(ValidationError::SystemDirectory {
                    prefix: prefix.to_string(),
                    path: path.display().to_string(),
                });
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileStateStoreBuilder {
        FileStateStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the store directories and clear leftovers from a crash
    ///
    /// Should be called at startup, so permission problems fail fast.
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising store at {}", self.path.display());

        if self.path.try_exists()? && !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        let mut cleaned = 0;
        for dir in [MESSAGES_DIR, ATTEMPTS_DIR, OTPS_DIR] {
            let dir = self.path.join(dir);
            std::fs::create_dir_all(&dir)?;

            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();

                if name.starts_with(TEMP_PREFIX) || name.ends_with(DELETED_SUFFIX) {
                    std::fs::remove_file(entry.path())?;
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from the store"
            );
        }

        Ok(())
    }

    fn message_path(&self, id: &MessageId) -> PathBuf {
        self.path
            .join(MESSAGES_DIR)
            .join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn attempts_path(&self, id: &MessageId) -> PathBuf {
        self.path
            .join(ATTEMPTS_DIR)
            .join(format!("{id}.{LOG_EXTENSION}"))
    }

    fn otp_path(&self, recipient: &str) -> PathBuf {
        self.path.join(OTPS_DIR).join(format!(
            "{}.{RECORD_EXTENSION}",
            hex::encode(recipient.as_bytes())
        ))
    }

    /// Write `value` next to `path` and rename it into place
    async fn write_record<T: Serialize + Sync>(&self, path: &Path, value: &T) -> crate::Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode_config())?;

        let file_name = path
            .file_name()
            .ok_or_else(|| StoreError::Internal(format!("No file name in {}", path.display())))?;
        let temp_path =
            path.with_file_name(format!("{TEMP_PREFIX}{}", file_name.to_string_lossy()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(path: &Path) -> crate::Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode_config())?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Two-phase delete: rename aside, then remove
    async fn remove_file(path: &Path) -> crate::Result<bool> {
        let mut deleted = path.as_os_str().to_owned();
        deleted.push(DELETED_SUFFIX);
        let deleted = PathBuf::from(deleted);

        match fs::rename(path, &deleted).await {
            Ok(()) => {
                fs::remove_file(&deleted).await?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Read an attempt log, returning the parsed rows and the raw bytes
    ///
    /// An unparseable final line is a torn write and is skipped; anywhere
    /// else it is corruption.
    async fn read_log(&self, id: &MessageId) -> crate::Result<(Vec<DeliveryAttempt>, Vec<u8>)> {
        let raw = match fs::read(self.attempts_path(id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), Vec::new()));
            }
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<&[u8]> = raw
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .collect();

        let mut attempts = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_slice::<DeliveryAttempt>(line) {
                Ok(attempt) => attempts.push(attempt),
                Err(err) if index + 1 == lines.len() && !raw.ends_with(b"\n") => {
                    internal!(
                        level = WARN,
                        "Ignoring torn attempt log line for {id}: {err}"
                    );
                }
                Err(err) => {
                    return Err(SerializationError::Corrupted(format!(
                        "Attempt log for {id}, line {}: {err}",
                        index + 1
                    ))
                    .into());
                }
            }
        }

        attempts.sort_by_key(|attempt| attempt.attempt);
        Ok((attempts, raw))
    }

    async fn list_ids(&self) -> crate::Result<Vec<MessageId>> {
        let mut entries = fs::read_dir(self.path.join(MESSAGES_DIR)).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if !name.starts_with(TEMP_PREFIX)
                && let Some(id) = MessageId::from_filename(&name, RECORD_EXTENSION)
            {
                ids.push(id);
            }
        }

        // ULIDs sort by creation time
        ids.sort();
        Ok(ids)
    }

    async fn all_messages(&self) -> crate::Result<Vec<MessageRequest>> {
        let mut messages = Vec::new();
        for id in self.list_ids().await? {
            if let Some(message) = Self::read_record(&self.message_path(&id)).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl DeliveryStateStore for FileStateStore {
    async fn upsert(&self, message: &MessageRequest) -> crate::Result<()> {
        self.write_record(&self.message_path(&message.id), message)
            .await?;

        internal!(
            level = DEBUG,
            "Stored message {} as {}",
            message.id,
            message.status
        );

        Ok(())
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> crate::Result<bool> {
        let _guard = self.append_lock.lock().await;

        let (existing, raw) = self.read_log(&attempt.message_id).await?;
        if existing.iter().any(|a| a.attempt == attempt.attempt) {
            return Ok(false);
        }

        let path = self.attempts_path(&attempt.message_id);

        // Drop a torn tail before appending behind it
        if !raw.is_empty() && !raw.ends_with(b"\n") {
            let keep = raw.iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
            let file = fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(keep as u64).await?;
        }

        let mut line = serde_json::to_vec(attempt)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        Ok(true)
    }

    async fn get(&self, id: &MessageId) -> crate::Result<MessageRequest> {
        Self::read_record(&self.message_path(id))
            .await?
            .ok_or(StoreError::NotFound(*id))
    }

    async fn attempts(&self, id: &MessageId) -> crate::Result<Vec<DeliveryAttempt>> {
        Ok(self.read_log(id).await?.0)
    }

    async fn query(
        &self,
        status: Option<MessageStatus>,
        range: TimeRange,
    ) -> crate::Result<Vec<MessageRequest>> {
        Ok(self
            .all_messages()
            .await?
            .into_iter()
            .filter(|message| status.is_none_or(|status| message.status == status))
            .filter(|message| range.contains(message.created_at))
            .collect())
    }

    async fn attempts_between(&self, range: TimeRange) -> crate::Result<Vec<DeliveryAttempt>> {
        let mut found = Vec::new();
        for id in self.list_ids().await? {
            found.extend(
                self.read_log(&id)
                    .await?
                    .0
                    .into_iter()
                    .filter(|attempt| range.contains(attempt.timestamp)),
            );
        }

        found.sort_by_key(|attempt| attempt.timestamp);
        Ok(found)
    }

    async fn unfinished(&self) -> crate::Result<Vec<MessageRequest>> {
        Ok(self
            .all_messages()
            .await?
            .into_iter()
            .filter(|message| !message.status.is_terminal())
            .collect())
    }

    async fn purge_before(&self, cutoff: SystemTime) -> crate::Result<usize> {
        let mut purged = 0;

        for message in self.all_messages().await? {
            if message.status.is_terminal() && message.created_at < cutoff {
                Self::remove_file(&self.attempts_path(&message.id)).await?;
                if Self::remove_file(&self.message_path(&message.id)).await? {
                    purged += 1;
                }
            }
        }

        internal!(level = DEBUG, "Purged {purged} messages from the store");
        Ok(purged)
    }
}

#[async_trait]
impl OtpStore for FileStateStore {
    async fn replace_code(&self, code: &OtpCode) -> crate::Result<Option<OtpCode>> {
        let path = self.otp_path(&code.recipient);
        let previous = Self::read_record(&path).await?;
        self.write_record(&path, code).await?;
        Ok(previous)
    }

    async fn code_for(&self, recipient: &str) -> crate::Result<Option<OtpCode>> {
        Self::read_record(&self.otp_path(recipient)).await
    }

    async fn save_code(&self, code: &OtpCode) -> crate::Result<()> {
        self.write_record(&self.otp_path(&code.recipient), code)
            .await
    }

    async fn purge_codes_before(&self, cutoff: SystemTime) -> crate::Result<usize> {
        let mut entries = fs::read_dir(self.path.join(OTPS_DIR)).await?;
        let mut purged = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) || !name.ends_with(RECORD_EXTENSION) {
                continue;
            }

            let path = entry.path();
            if let Some(code) = Self::read_record::<OtpCode>(&path).await?
                && code.issued_at < cutoff
                && Self::remove_file(&path).await?
            {
                purged += 1;
            }
        }

        Ok(purged)
    }
}

/// Builder for `FileStateStore`
#[derive(Debug, Default)]
pub struct FileStateStoreBuilder {
    path: PathBuf,
}

impl FileStateStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Build the final `FileStateStore`
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> crate::Result<FileStateStore> {
        FileStateStore::validate_path(&self.path)?;
        Ok(FileStateStore {
            path: self.path,
            append_lock: Arc::default(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(FileStateStore::validate_path(Path::new("/var/lib/courier")).is_ok());
        assert!(matches!(
            FileStateStore::validate_path(Path::new("/var/lib/../courier")),
            Err(ValidationError::ParentTraversal(_))
        ));
        assert!(matches!(
            FileStateStore::validate_path(Path::new("relative/path")),
            Err(ValidationError::NotAbsolute(_))
        ));
        assert!(matches!(
            FileStateStore::validate_path(Path::new("/etc/courier")),
            Err(ValidationError::SystemDirectory { .. })
        ));
    }

    #[test]
    fn test_deserialize_validates_path() {
        let store: FileStateStore = ron::from_str(r#"(path: "/tmp/courier")"#).unwrap();
        assert_eq!(store.path(), Path::new("/tmp/courier"));

        assert!(ron::from_str::<FileStateStore>(r#"(path: "/proc/courier")"#).is_err());
    }

    #[test]
    fn test_otp_path_is_hex_encoded() {
        let store = FileStateStore::builder()
            .path(PathBuf::from("/tmp/courier"))
            .build()
            .unwrap();
        let path = store.otp_path("../+44");
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("{}.bin", hex::encode("../+44"))
        );
    }
}
