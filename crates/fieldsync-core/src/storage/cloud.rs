//! Breaker-protected cloud storage client for photos.

use std::sync::Arc;

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::object_store::{CloudError, ObjectStore};

const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Object names of an uploaded photo and its thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoObjectNames {
    pub photo: String,
    pub thumbnail: String,
}

impl PhotoObjectNames {
    /// `<site_id>/<photo_id>.jpg` and `<site_id>/thumbnails/<photo_id>_thumb.jpg`,
    /// without the site prefix when the photo has no site.
    pub fn for_photo(photo_id: &str, site_id: Option<i64>) -> Self {
        let prefix = site_id.map(|site| format!("{site}/")).unwrap_or_default();
        Self {
            photo: format!("{prefix}{photo_id}.jpg"),
            thumbnail: format!("{prefix}thumbnails/{photo_id}_thumb.jpg"),
        }
    }
}

/// Result of a successful photo upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPhoto {
    pub photo_url: String,
    pub thumbnail_url: Option<String>,
    pub objects: PhotoObjectNames,
}

/// Thin client over an [`ObjectStore`]; every driver call passes the breaker.
pub struct CloudStorageClient {
    store: Arc<dyn ObjectStore>,
    breaker: CircuitBreaker,
}

impl CloudStorageClient {
    pub fn new(store: Arc<dyn ObjectStore>, breaker: CircuitBreaker) -> Self {
        Self { store, breaker }
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    fn call<T>(
        &self,
        operation: &str,
        key: &str,
        f: impl FnOnce(&dyn ObjectStore) -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        self.breaker.admit().inspect_err(|_| {
            tracing::debug!(operation, key, "Cloud call skipped, circuit open");
        })?;
        match f(self.store.as_ref()) {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.is_backend_failure() {
                    self.breaker.record_failure();
                }
                tracing::warn!(operation, key, %error, "Cloud storage call failed");
                Err(error)
            }
        }
    }

    /// Upload a photo and, if given, its thumbnail.
    ///
    /// When the thumbnail upload fails the photo object is removed again.
    pub fn upload_photo(
        &self,
        photo_id: &str,
        site_id: Option<i64>,
        photo: &[u8],
        thumbnail: Option<&[u8]>,
    ) -> Result<UploadedPhoto, CloudError> {
        let objects = PhotoObjectNames::for_photo(photo_id, site_id);

        self.call("upload", &objects.photo, |store| {
            store.put_object(&objects.photo, photo, JPEG_CONTENT_TYPE)
        })?;

        let thumbnail_url = match thumbnail {
            Some(bytes) => {
                let uploaded = self.call("upload", &objects.thumbnail, |store| {
                    store.put_object(&objects.thumbnail, bytes, JPEG_CONTENT_TYPE)
                });
                if let Err(error) = uploaded {
                    self.delete_object_best_effort(&objects.photo);
                    return Err(error);
                }
                Some(self.store.object_url(&objects.thumbnail))
            }
            None => None,
        };

        Ok(UploadedPhoto {
            photo_url: self.store.object_url(&objects.photo),
            thumbnail_url,
            objects,
        })
    }

    pub fn download(&self, object_name: &str) -> Result<Vec<u8>, CloudError> {
        self.call("download", object_name, |store| store.get_object(object_name))
    }

    /// Download the object a stored URL points at.
    pub fn download_url(&self, url: &str) -> Result<Vec<u8>, CloudError> {
        let key = self
            .object_key_from_url(url)
            .ok_or_else(|| CloudError::InvalidInput(format!("cannot derive object key from `{url}`")))?;
        self.download(&key)
    }

    pub fn delete(&self, object_name: &str) -> Result<(), CloudError> {
        self.call("delete", object_name, |store| store.delete_object(object_name))
    }

    /// Delete and log instead of failing.
    pub fn delete_object_best_effort(&self, object_name: &str) -> bool {
        match self.delete(object_name) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(object_name, %error, "Failed to delete cloud object");
                false
            }
        }
    }

    /// Delete the objects behind a photo's URLs, skipping blanks.
    ///
    /// Returns how many objects were removed.
    pub fn delete_urls_best_effort(&self, urls: &[&str]) -> usize {
        urls.iter()
            .filter(|url| !url.trim().is_empty())
            .filter_map(|url| {
                let key = self.object_key_from_url(url);
                if key.is_none() {
                    tracing::warn!(url, "Cannot derive object key for deletion");
                }
                key
            })
            .filter(|key| self.delete_object_best_effort(key))
            .count()
    }

    pub fn object_key_from_url(&self, url: &str) -> Option<String> {
        self.store.object_key_from_url(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{BreakerConfig, CircuitState, MemoryObjectStore};
    use pretty_assertions::assert_eq;

    fn client() -> (CloudStorageClient, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), Arc::new(ManualClock::new(0)));
        (CloudStorageClient::new(store.clone(), breaker), store)
    }

    #[test]
    fn object_names_follow_site_layout() {
        assert_eq!(
            PhotoObjectNames::for_photo("p1", Some(7)),
            PhotoObjectNames {
                photo: "7/p1.jpg".into(),
                thumbnail: "7/thumbnails/p1_thumb.jpg".into(),
            }
        );
        assert_eq!(PhotoObjectNames::for_photo("p1", None).photo, "p1.jpg");
        assert_eq!(
            PhotoObjectNames::for_photo("p1", None).thumbnail,
            "thumbnails/p1_thumb.jpg"
        );
    }

    #[test]
    fn upload_then_download_by_url() {
        let (client, store) = client();
        let uploaded = client
            .upload_photo("p1", Some(7), b"photo", Some(b"thumb"))
            .unwrap();

        assert!(store.contains("7/p1.jpg"));
        assert!(store.contains("7/thumbnails/p1_thumb.jpg"));
        assert_eq!(client.download_url(&uploaded.photo_url).unwrap(), b"photo");

        let removed = client.delete_urls_best_effort(&[
            &uploaded.photo_url,
            uploaded.thumbnail_url.as_deref().unwrap(),
            "",
        ]);
        assert_eq!(removed, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_thumbnail_upload_removes_photo() {
        let (client, store) = client();
        store.fail_writes_containing("thumbnails/");

        let err = client
            .upload_photo("p2", Some(1), b"x", Some(b"t"))
            .unwrap_err();
        assert!(err.is_backend_failure());
        assert!(!store.contains("1/p2.jpg"));
    }

    #[test]
    fn open_circuit_skips_driver() {
        let (client, store) = client();
        store.set_offline(true);
        for _ in 0..5 {
            assert!(client.download("7/p1.jpg").is_err());
        }
        assert_eq!(client.breaker_snapshot().state, CircuitState::Open);

        let calls = store.call_count();
        assert_eq!(client.download("7/p1.jpg"), Err(CloudError::CircuitOpen));
        assert_eq!(store.call_count(), calls);
    }

    #[test]
    fn missing_objects_do_not_trip_breaker() {
        let (client, _store) = client();
        for _ in 0..10 {
            assert!(matches!(
                client.download("nope.jpg"),
                Err(CloudError::NotFound(_))
            ));
        }
        assert_eq!(client.breaker_snapshot().state, CircuitState::Closed);
    }
}
