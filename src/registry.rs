//! Known clients, their document inventories and their open index handles.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Db;
use crate::db::models::Client;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::index::{ClientIndex, DocumentRecord, IndexStats};

const DOCUMENTS_DIR: &str = "documents";

/// Normalize a user-supplied client name into its storage id.
///
/// Trims, lowercases and collapses whitespace runs into `_`. The result may
/// only contain `[a-z0-9_.-]` and must not be empty, `.` or `..`.
pub fn normalize_client_id(raw: &str) -> Result<String> {
    let id = raw
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_");

    if id.is_empty() || id == "." || id == ".." {
        return Err(RagError::InvalidInput(format!("invalid client id '{raw}'")));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')))
    {
        return Err(RagError::InvalidInput(format!(
            "client id '{raw}' contains unsupported character '{bad}'"
        )));
    }
    Ok(id)
}

/// Reject filenames that could escape the client's document directory.
pub fn validate_filename(filename: &str) -> Result<()> {
    let trimmed = filename.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed != filename
        || filename.contains(['/', '\\', '\0'])
    {
        return Err(RagError::InvalidInput(format!(
            "invalid document filename '{filename}'"
        )));
    }
    Ok(())
}

/// SHA-256 of `bytes`, lowercase hex.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    #[serde(flatten)]
    pub client: Client,
    #[serde(flatten)]
    pub stats: IndexStats,
}

pub struct ClientRegistry {
    db: Arc<Mutex<Db>>,
    clients_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    indexes: RwLock<HashMap<String, Arc<ClientIndex>>>,
    /// Held while a stored file is swapped in and recorded, so the inventory
    /// hash always describes the bytes on disk.
    uploads: Mutex<()>,
}

impl ClientRegistry {
    /// Open the registry and an index handle for every known client.
    pub fn open(db: Arc<Mutex<Db>>, clients_dir: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        std::fs::create_dir_all(clients_dir)?;
        let registry = Self {
            db,
            clients_dir: clients_dir.to_path_buf(),
            embedder,
            indexes: RwLock::new(HashMap::new()),
            uploads: Mutex::new(()),
        };

        let clients = registry.db()?.list_clients()?;
        for client in &clients {
            registry.open_index(&client.id)?;
        }
        info!("Client registry ready: {} clients", clients.len());
        Ok(registry)
    }

    fn db(&self) -> Result<MutexGuard<'_, Db>> {
        self.db
            .lock()
            .map_err(|_| RagError::Internal("catalog lock poisoned".to_string()))
    }

    fn client_dir(&self, id: &str) -> PathBuf {
        self.clients_dir.join(id)
    }

    fn open_index(&self, id: &str) -> Result<Arc<ClientIndex>> {
        let index = Arc::new(ClientIndex::open(
            id,
            &self.client_dir(id),
            self.embedder.clone(),
        )?);
        std::fs::create_dir_all(self.client_dir(id).join(DOCUMENTS_DIR))?;
        self.indexes
            .write()
            .map_err(|_| RagError::Internal("index map lock poisoned".to_string()))?
            .insert(id.to_string(), index.clone());
        Ok(index)
    }

    /// Create a client. Fails with `Conflict` if its normalized id exists.
    pub fn create(&self, name: &str) -> Result<Client> {
        let id = normalize_client_id(name)?;
        let client = Client {
            id: id.clone(),
            display_name: name.trim().to_string(),
            created_at: Utc::now(),
        };

        {
            let db = self.db()?;
            if db.get_client(&id)?.is_some() {
                return Err(RagError::Conflict(format!("client '{id}' already exists")));
            }
            self.open_index(&id)?;
            if !db.insert_client(&client)? {
                return Err(RagError::Conflict(format!("client '{id}' already exists")));
            }
        }

        info!("Created client '{id}'");
        Ok(client)
    }

    pub fn list(&self) -> Result<Vec<Client>> {
        Ok(self.db()?.list_clients()?)
    }

    pub fn get(&self, id: &str) -> Result<Client> {
        let id = normalize_client_id(id)?;
        self.db()?
            .get_client(&id)?
            .ok_or_else(|| RagError::NotFound(format!("client '{id}'")))
    }

    /// The open index of a known client.
    pub fn index(&self, id: &str) -> Result<Arc<ClientIndex>> {
        let id = normalize_client_id(id)?;
        self.indexes
            .read()
            .map_err(|_| RagError::Internal("index map lock poisoned".to_string()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("client '{id}'")))
    }

    /// Where a client's raw document bytes live.
    pub fn document_path(&self, id: &str, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        let id = normalize_client_id(id)?;
        Ok(self.client_dir(&id).join(DOCUMENTS_DIR).join(filename))
    }

    /// Store raw bytes for a client's document and record it in the inventory.
    ///
    /// Re-uploading an existing filename is an update.
    pub fn upload_document(&self, id: &str, filename: &str, bytes: &[u8]) -> Result<DocumentRecord> {
        validate_filename(filename)?;
        let index = self.index(id)?;
        let path = self.document_path(index.client_id(), filename)?;

        // Write-then-rename so a crash never leaves a truncated document
        let tmp = path.with_file_name(format!(".{filename}.{}.upload", Uuid::new_v4().simple()));
        if let Err(e) = std::fs::write(&tmp, bytes) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        let record = {
            let _guard = self
                .uploads
                .lock()
                .map_err(|_| RagError::Internal("upload lock poisoned".to_string()))?;
            if let Err(e) = std::fs::rename(&tmp, &path) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
            index.record_upload(filename, bytes.len() as u64, &content_hash(bytes), Utc::now())?
        };
        info!(
            "Stored '{filename}' for '{}' ({} bytes, {:?})",
            index.client_id(),
            bytes.len(),
            record.status
        );
        Ok(record)
    }

    pub fn list_documents(&self, id: &str) -> Result<Vec<DocumentRecord>> {
        self.index(id)?.list_documents()
    }

    /// Delete a document, its chunks and its stored bytes.
    pub fn delete_document(&self, id: &str, filename: &str) -> Result<()> {
        validate_filename(filename)?;
        let index = self.index(id)?;
        if !index.delete_document(filename)? {
            return Err(RagError::NotFound(format!(
                "document '{filename}' for client '{}'",
                index.client_id()
            )));
        }

        let path = self.document_path(index.client_id(), filename)?;
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to remove {}: {e}", path.display());
        }
        info!("Deleted '{filename}' for '{}'", index.client_id());
        Ok(())
    }

    pub fn summary(&self, id: &str) -> Result<ClientSummary> {
        let client = self.get(id)?;
        let stats = self.index(&client.id)?.stats()?;
        Ok(ClientSummary { client, stats })
    }

    /// Checkpoint every open index and the catalog.
    pub fn shutdown(&self) -> Result<()> {
        let indexes: Vec<Arc<ClientIndex>> = self
            .indexes
            .read()
            .map_err(|_| RagError::Internal("index map lock poisoned".to_string()))?
            .values()
            .cloned()
            .collect();
        for index in indexes {
            if let Err(e) = index.close() {
                warn!("Failed to close index for '{}': {e}", index.client_id());
            }
        }
        self.db()?.checkpoint()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedder::hashing::HashingEmbedder;
    use crate::index::IngestionStatus;

    pub(crate) fn open_registry(root: &Path) -> ClientRegistry {
        let db = Arc::new(Mutex::new(Db::open(root.join("app.db")).unwrap()));
        ClientRegistry::open(db, &root.join("clients"), Arc::new(HashingEmbedder::new(64))).unwrap()
    }

    #[test]
    fn test_normalize_client_id() {
        assert_eq!(normalize_client_id("  Jane   Doe ").unwrap(), "jane_doe");
        assert_eq!(normalize_client_id("jane_doe").unwrap(), "jane_doe");
        assert_eq!(normalize_client_id("Client-7.b").unwrap(), "client-7.b");
        assert!(normalize_client_id("   ").is_err());
        assert!(normalize_client_id("..").is_err());
        assert!(normalize_client_id("a/b").is_err());
        assert!(normalize_client_id("José").is_err());
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("session1.txt").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("a\\b.txt").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename(" padded.txt").is_err());
    }

    #[test]
    fn test_create_conflict_on_normalized_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(dir.path());
        let client = registry.create("Jane Doe").unwrap();
        assert_eq!(client.id, "jane_doe");
        assert_eq!(client.display_name, "Jane Doe");

        assert!(matches!(registry.create("jane doe"), Err(RagError::Conflict(_))));
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(registry.get("JANE DOE").unwrap().id, "jane_doe");
    }

    #[test]
    fn test_upload_to_unknown_client_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(dir.path());
        let err = registry
            .upload_document("ghost", "session1.txt", b"hello")
            .unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_upload_and_reupload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(dir.path());
        registry.create("jane_doe").unwrap();

        let doc = registry
            .upload_document("jane_doe", "session1.txt", b"Patient reports improved sleep.")
            .unwrap();
        assert_eq!(doc.status, IngestionStatus::NotIngested);
        assert_eq!(doc.content_hash, content_hash(b"Patient reports improved sleep."));

        let path = registry.document_path("jane_doe", "session1.txt").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"Patient reports improved sleep.");

        registry
            .upload_document("jane_doe", "session1.txt", b"Revised notes.")
            .unwrap();
        let docs = registry.list_documents("jane_doe").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].size_bytes, 14);
    }

    #[test]
    fn test_concurrent_uploads_of_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();

        let versions: Vec<Vec<u8>> = (0..8)
            .map(|i| format!("Version {i} of the notes. ").repeat(200).into_bytes())
            .collect();
        let handles: Vec<_> = versions
            .iter()
            .cloned()
            .map(|bytes| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.upload_document("jane_doe", "notes.txt", &bytes)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // The stored bytes are one whole version and the inventory describes them
        let path = registry.document_path("jane_doe", "notes.txt").unwrap();
        let stored = std::fs::read(&path).unwrap();
        assert!(versions.contains(&stored));
        let doc = registry.list_documents("jane_doe").unwrap().remove(0);
        assert_eq!(doc.content_hash, content_hash(&stored));

        // No temp files left behind
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != "notes.txt")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_delete_document() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(dir.path());
        registry.create("jane_doe").unwrap();
        registry
            .upload_document("jane_doe", "session1.txt", b"text")
            .unwrap();

        registry.delete_document("jane_doe", "session1.txt").unwrap();
        assert!(registry.list_documents("jane_doe").unwrap().is_empty());
        assert!(!registry.document_path("jane_doe", "session1.txt").unwrap().exists());
        assert!(matches!(
            registry.delete_document("jane_doe", "session1.txt"),
            Err(RagError::NotFound(_))
        ));
    }

    #[test]
    fn test_reopen_restores_clients() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = open_registry(dir.path());
            registry.create("jane_doe").unwrap();
            registry.upload_document("jane_doe", "a.txt", b"a").unwrap();
            registry.shutdown().unwrap();
        }
        let registry = open_registry(dir.path());
        let summary = registry.summary("jane_doe").unwrap();
        assert_eq!(summary.stats.documents, 1);
        assert_eq!(summary.stats.chunks, 0);
    }
}
