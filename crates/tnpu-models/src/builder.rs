//! Model image builder, used by tooling and tests to produce valid images.

use crate::header::{ExecutionMode, ModelHeader, SecurityType, FORMAT_VERSION};
use crate::resources::{AreaKind, MemoryArea, ResourceDescriptor};
use bytes::{BufMut, Bytes, BytesMut};

/// Builder for [`ModelImage`](crate::ModelImage) byte streams.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    security: SecurityType,
    execution_mode: ExecutionMode,
    key_set: u32,
    hardware_target: u16,
    code: Vec<u8>,
    code_area: Option<u32>,
    pool_size: Option<u32>,
    page_table_pages: u32,
    layer_operations: Vec<u32>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    /// Plain, default-mode model with 64 bytes of code and one page-table page.
    pub fn new() -> Self {
        Self {
            security: SecurityType::Plain,
            execution_mode: ExecutionMode::Default,
            key_set: 0,
            hardware_target: 0,
            code: vec![0; 64],
            code_area: None,
            pool_size: None,
            page_table_pages: 1,
            layer_operations: Vec::new(),
        }
    }

    /// Code bytes carried in the payload.
    #[must_use]
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    /// Device code area size; defaults to the code length.
    #[must_use]
    pub fn code_area(mut self, size: u32) -> Self {
        self.code_area = Some(size);
        self
    }

    /// Declare a constant pool.
    #[must_use]
    pub fn pool(mut self, size: u32) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Page-table pages.
    #[must_use]
    pub fn page_table_pages(mut self, pages: u32) -> Self {
        self.page_table_pages = pages;
        self
    }

    /// Content protection and key set.
    #[must_use]
    pub fn security(mut self, security: SecurityType, key_set: u32) -> Self {
        self.security = security;
        self.key_set = key_set;
        self
    }

    /// Hardware revision the image targets.
    #[must_use]
    pub fn hardware_target(mut self, target: u16) -> Self {
        self.hardware_target = target;
        self
    }

    /// Build in profiling mode with the given operations per layer.
    #[must_use]
    pub fn profiling(mut self, layer_operations: Vec<u32>) -> Self {
        self.execution_mode = ExecutionMode::Profile;
        self.layer_operations = layer_operations;
        self
    }

    /// Descriptor the image will carry.
    pub fn descriptor(&self) -> ResourceDescriptor {
        let code_len = u32::try_from(self.code.len()).unwrap_or(u32::MAX);
        let mut areas = vec![MemoryArea {
            kind: AreaKind::Code,
            size: self.code_area.unwrap_or(code_len),
        }];
        if let Some(size) = self.pool_size {
            areas.push(MemoryArea {
                kind: AreaKind::Pool,
                size,
            });
        }
        ResourceDescriptor {
            areas,
            page_table_pages: self.page_table_pages,
            layer_operations: self.layer_operations.clone(),
        }
    }

    /// Serialize the image.
    pub fn build(&self) -> Bytes {
        let metadata = self.descriptor().encode();
        let header = ModelHeader {
            format_version: FORMAT_VERSION,
            security: self.security,
            execution_mode: self.execution_mode,
            metadata_length: u32::try_from(metadata.len()).unwrap_or(u32::MAX),
            code_length: u32::try_from(self.code.len()).unwrap_or(u32::MAX),
            key_set: self.key_set,
            hardware_target: self.hardware_target,
        };

        let mut out = BytesMut::with_capacity(
            crate::HEADER_SIZE + metadata.len() + self.code.len(),
        );
        out.put_slice(&header.to_bytes());
        out.put_slice(&metadata);
        out.put_slice(&self.code);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelImage;

    #[test]
    fn built_image_parses() {
        let image = ModelBuilder::new()
            .code(vec![7; 4096])
            .page_table_pages(16)
            .pool(100)
            .profiling(vec![1, 2])
            .build();
        let model = ModelImage::from_bytes(image).unwrap();
        let sizing = model.sizing();
        assert_eq!(sizing.code_size, 4096);
        assert_eq!(sizing.page_table_size, 64 * 1024);
        assert_eq!(sizing.pool_size, 4096);
        assert!(sizing.profiling);
        assert_eq!(model.resources().operation_count(), 3);
    }
}
