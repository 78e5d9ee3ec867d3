//! Complete model image.

use crate::error::{ModelError, Result};
use crate::header::ModelHeader;
use crate::resources::{ResourceDescriptor, ResourceSizing};
use bytes::Bytes;
use std::path::Path;

/// A validated model image: header, descriptor and the raw bytes.
#[derive(Debug, Clone)]
pub struct ModelImage {
    header: ModelHeader,
    resources: ResourceDescriptor,
    data: Bytes,
}

impl ModelImage {
    /// Load a model image from file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or the image is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        tracing::info!("Loading model from: {}", path.display());

        if !path.exists() {
            return Err(ModelError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    /// Validate an in-memory image.
    ///
    /// # Errors
    ///
    /// Returns error if the header, declared size or metadata is invalid.
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let header = ModelHeader::parse(&data)?;
        header.check_upload_size(data.len() as u64)?;
        #[allow(clippy::cast_possible_truncation)]
        let public_len = header.public_data_length() as usize;
        let resources = ResourceDescriptor::from_public_data(&data[..public_len])?;
        Ok(Self {
            header,
            resources,
            data,
        })
    }

    /// Parsed header
    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    /// Parsed resource descriptor
    pub fn resources(&self) -> &ResourceDescriptor {
        &self.resources
    }

    /// Device-memory plan
    pub fn sizing(&self) -> ResourceSizing {
        ResourceSizing::plan(&self.header, &self.resources)
    }

    /// Whole image
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Header and metadata
    #[allow(clippy::cast_possible_truncation)]
    pub fn public_data(&self) -> Bytes {
        self.data.slice(..self.header.public_data_length() as usize)
    }

    /// Everything after the public data, code first
    #[allow(clippy::cast_possible_truncation)]
    pub fn payload(&self) -> Bytes {
        self.data.slice(self.header.public_data_length() as usize..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModelBuilder;
    use std::io::Write;

    #[test]
    fn from_file_roundtrip() {
        let image = ModelBuilder::new().code(vec![0xAB; 300]).build();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();

        let model = ModelImage::from_file(file.path()).unwrap();
        assert_eq!(model.payload().len(), 300);
        assert_eq!(model.public_data().len() as u64, model.header().public_data_length());
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelImage::from_file(dir.path().join("absent.tnpm")).unwrap_err();
        assert!(matches!(err, ModelError::FileNotFound { .. }));
    }

    #[test]
    fn declared_code_longer_than_image() {
        let image = ModelBuilder::new().code(vec![1; 64]).build();
        let cut = image.slice(..image.len() - 1);
        assert!(matches!(
            ModelImage::from_bytes(cut),
            Err(ModelError::Truncated { section: "model", .. })
        ));
    }
}
