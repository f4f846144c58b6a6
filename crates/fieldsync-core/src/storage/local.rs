//! Filesystem-backed object store for offline deployments.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use url::Url;

use super::object_store::{key_from_url_path, normalize_object_key, CloudError, ObjectStore};

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            public_base_url: public_base_url.map(|base| base.trim_end_matches('/').to_string()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<(String, PathBuf), CloudError> {
        let key = normalize_object_key(key)?;
        let path = self.root.join(&key);
        Ok((key, path))
    }
}

fn io_error(operation: &str, key: &str, error: &std::io::Error) -> CloudError {
    CloudError::Backend(format!("local {operation} failed for {key}: {error}"))
}

impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn put_object(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), CloudError> {
        let (key, path) = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| io_error("mkdir", &key, &error))?;
        }
        let staging = path.with_extension("partial");
        fs::write(&staging, bytes).map_err(|error| io_error("write", &key, &error))?;
        fs::rename(&staging, &path).map_err(|error| io_error("rename", &key, &error))?;
        Ok(())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, CloudError> {
        let (key, path) = self.path_for(key)?;
        fs::read(&path).map_err(|error| match error.kind() {
            ErrorKind::NotFound => CloudError::NotFound(key.clone()),
            _ => io_error("read", &key, &error),
        })
    }

    fn delete_object(&self, key: &str) -> Result<(), CloudError> {
        let (key, path) = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(io_error("delete", &key, &error)),
        }
    }

    fn object_url(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        if let Some(base) = &self.public_base_url {
            return format!("{base}/{key}");
        }
        Url::from_file_path(self.root.join(key))
            .map_or_else(|()| self.root.join(key).display().to_string(), String::from)
    }

    fn object_key_from_url(&self, url: &str) -> Option<String> {
        if let Some(base) = &self.public_base_url {
            if let Some(rest) = url.strip_prefix(base.as_str()) {
                let key = rest.trim_matches('/');
                return (!key.is_empty()).then(|| key.to_string());
            }
        }
        let parsed = Url::parse(url).ok()?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path().ok()?;
            let key = path.strip_prefix(&self.root).ok()?;
            return Some(key.to_string_lossy().replace('\\', "/"));
        }
        key_from_url_path(url)
    }
}
