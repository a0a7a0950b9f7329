//! Image vector: name to image-reference resolution from `images.yaml`

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Catalog key of the main etcd image
pub const ETCD_IMAGE_KEY: &str = "etcd";
/// Catalog key of the backup-restore sidecar image
pub const BACKUP_RESTORE_IMAGE_KEY: &str = "etcd-backup-restore";

/// A single image catalog entry
#[derive(Clone, Debug, Deserialize)]
pub struct ImageSource {
    /// Catalog key
    pub name: String,
    /// Repository, e.g. `quay.io/coreos/etcd`
    pub repository: String,
    /// Tag pinned by the catalog
    pub tag: String,
}

impl ImageSource {
    /// Full image reference, `repository:tag`
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Deserialize)]
struct ImageVectorFile {
    images: Vec<ImageSource>,
}

/// Image catalog, read once at start-up and injected into the controllers
#[derive(Clone, Debug, Default)]
pub struct ImageVector {
    images: Vec<ImageSource>,
}

impl ImageVector {
    /// Load the catalog from a YAML file; `etcd` and `etcd-backup-restore`
    /// must be present.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ImageError(format!(
                "cannot read image vector {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let file: ImageVectorFile = serde_yaml::from_str(&raw)
            .map_err(|e| Error::ImageError(format!("cannot parse image vector: {}", e)))?;

        let vector = Self {
            images: file.images,
        };
        for required in [ETCD_IMAGE_KEY, BACKUP_RESTORE_IMAGE_KEY] {
            if vector.find(required).is_none() {
                return Err(Error::ImageError(format!(
                    "image vector is missing required image {:?}",
                    required
                )));
            }
        }
        Ok(vector)
    }

    /// Build a catalog from entries, used by tests.
    pub fn from_images(images: Vec<ImageSource>) -> Self {
        Self { images }
    }

    /// Look up an entry by catalog key.
    pub fn find(&self, name: &str) -> Option<&ImageSource> {
        self.images.iter().find(|img| img.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_joins_repository_and_tag() {
        let source = ImageSource {
            name: "etcd".to_string(),
            repository: "quay.io/coreos/etcd".to_string(),
            tag: "v3.4.13".to_string(),
        };
        assert_eq!(source.image_ref(), "quay.io/coreos/etcd:v3.4.13");
    }

    #[test]
    fn find_is_keyed_by_name() {
        let vector = ImageVector::from_images(vec![ImageSource {
            name: "etcd".to_string(),
            repository: "quay.io/coreos/etcd".to_string(),
            tag: "v3.4.13".to_string(),
        }]);
        assert!(vector.find("etcd").is_some());
        assert!(vector.find("etcd-backup-restore").is_none());
    }
}
