use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::credentials::{CredentialUpdate, Credentials};
use crate::error::{AuthError, Result};

/// Persists the credential record as a pretty-printed JSON file.
///
/// Writes go through an internal lock, so refresh merges coming from
/// different tasks never interleave their read-modify-write cycles.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored record; `Ok(None)` when no token file exists yet
    pub fn load(&self) -> Result<Option<Credentials>> {
        let Some(content) = self.read()? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&content).map_err(|source| self.decode(source))?;
        Ok(Some(record))
    }

    /// Replace the stored record
    pub fn save(&self, record: &Credentials) -> Result<()> {
        let _guard = self.lock();
        let value = serde_json::to_value(record).map_err(|source| self.decode(source))?;
        self.write(&value)
    }

    /// Overlay the fields present in `update` onto the stored record.
    ///
    /// A missing file is treated as an empty record. Fields absent from the
    /// update, the refresh token in particular, keep their stored value.
    pub fn merge(&self, update: &CredentialUpdate) -> Result<Map<String, Value>> {
        self.overlay(update.present_fields())
    }

    /// Merge a freshly granted record into the stored one and return the result.
    ///
    /// Unlike [`save`](Self::save), a grant without a refresh token keeps the
    /// stored refresh token.
    pub fn merge_record(&self, record: &Credentials) -> Result<Credentials> {
        let fields = match serde_json::to_value(record).map_err(|source| self.decode(source))? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        let merged = self.overlay(fields)?;
        serde_json::from_value(Value::Object(merged)).map_err(|source| self.decode(source))
    }

    fn overlay(&self, fields: Map<String, Value>) -> Result<Map<String, Value>> {
        let _guard = self.lock();
        let mut current = match self.read()? {
            Some(content) => {
                let value: Value =
                    serde_json::from_str(&content).map_err(|source| self.decode(source))?;
                match value {
                    Value::Object(fields) => fields,
                    _ => {
                        return Err(self.decode(serde::de::Error::custom(
                            "token file is not a JSON object",
                        )));
                    }
                }
            }
            None => Map::new(),
        };

        for (key, value) in fields {
            current.insert(key, value);
        }

        self.write(&Value::Object(current.clone()))?;
        Ok(current)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.persistence(source)),
        }
    }

    /// Write the file with secure permissions
    fn write(&self, value: &Value) -> Result<()> {
        let mut content =
            serde_json::to_string_pretty(value).map_err(|source| self.decode(source))?;
        content.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| self.persistence(source))?;
        }

        std::fs::write(&self.path, content).map_err(|source| self.persistence(source))?;

        // Set secure permissions (owner read/write only) on Unix-like systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, permissions)
                .map_err(|source| self.persistence(source))?;
        }

        tracing::debug!(path = %self.path.display(), "token file written");
        Ok(())
    }

    fn decode(&self, source: serde_json::Error) -> AuthError {
        AuthError::Decode {
            path: self.path.clone(),
            source,
        }
    }

    fn persistence(&self, source: std::io::Error) -> AuthError {
        AuthError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}
