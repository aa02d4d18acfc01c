//! Token storage: the single access/refresh pair of the current session

use crate::types::TokenPair;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Holder of the current session's tokens
///
/// All operations are synchronous and infallible: a missing pair is `None`,
/// and a pair is always replaced or removed as a whole.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Option<TokenPair>;

    fn set(&self, pair: TokenPair);

    fn clear(&self);

    fn access_token(&self) -> Option<String> {
        self.get().map(|pair| pair.access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        self.get().map(|pair| pair.refresh_token)
    }
}

/// Process-local token store
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Option<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(pair: TokenPair) -> Self {
        Self {
            tokens: RwLock::new(Some(pair)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Option<TokenPair> {
        self.tokens.read().clone()
    }

    fn set(&self, pair: TokenPair) {
        *self.tokens.write() = Some(pair);
    }

    fn clear(&self) {
        *self.tokens.write() = None;
    }
}

/// Token store persisted as a small JSON file
///
/// The file holds `{"accessToken": "...", "refreshToken": "..."}`; a missing
/// file means logged out. Writes go to a sibling temp file that is renamed
/// over the target, so a reader never sees half a pair. I/O errors are logged
/// and the in-memory copy stays authoritative for this process.
///
/// `set` and `clear` do blocking file I/O on the calling thread. Writers are
/// serialized by `file_lock`; readers only take the in-memory lock and never
/// wait on the disk.
pub struct FileTokenStore {
    path: PathBuf,
    tokens: RwLock<Option<TokenPair>>,
    file_lock: Mutex<()>,
}

impl FileTokenStore {
    /// Open the store, loading any pair already on disk
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tokens = load(&path);
        debug!(path = %path.display(), present = tokens.is_some(), "Opened token file");
        Self {
            path,
            tokens: RwLock::new(tokens),
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tokens".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persist(&self, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)
    }
}

fn load(path: &Path) -> Option<TokenPair> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read token file");
            return None;
        }
    };

    match serde_json::from_slice::<TokenPair>(&bytes) {
        Ok(pair) if pair.is_complete() => Some(pair),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed token file");
            None
        }
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Option<TokenPair> {
        self.tokens.read().clone()
    }

    fn set(&self, pair: TokenPair) {
        let contents = serde_json::to_vec(&pair);

        let _file = self.file_lock.lock();
        *self.tokens.write() = Some(pair);
        let persisted = contents
            .map_err(io::Error::from)
            .and_then(|contents| self.persist(&contents));
        if let Err(e) = persisted {
            warn!(path = %self.path.display(), error = %e, "Failed to persist tokens");
        }
    }

    fn clear(&self) {
        let _file = self.file_lock.lock();
        *self.tokens.write() = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove token file"),
        }
    }
}
