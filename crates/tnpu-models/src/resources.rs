//! Resource-sizing descriptor carried in the public metadata.
//!
//! ```text
//! area_count        u32
//! areas             area_count × { kind: u32 (0 code, 1 pool), size: u32 }
//! page_table_pages  u32
//! layer_count       u32
//! layers            layer_count × { operation_count: u32 }
//! ```

use crate::error::{ModelError, Result};
use crate::header::{ModelHeader, HEADER_SIZE};
use tnpu_chip::page::{align_up, PAGE_TABLE_PAGE_BYTES};
use tnpu_chip::ta::PROFILE_RECORD_SIZE;

/// Kind of a memory area declared by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    /// Executable command stream.
    Code,
    /// Constant pool (weights).
    Pool,
}

/// One memory area requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryArea {
    /// What the area holds
    pub kind: AreaKind,
    /// Size in bytes before page rounding
    pub size: u32,
}

/// Decoded metadata block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceDescriptor {
    /// Declared memory areas
    pub areas: Vec<MemoryArea>,
    /// Page-table pages the address-translation unit needs
    pub page_table_pages: u32,
    /// Operation count per layer, in execution order
    pub layer_operations: Vec<u32>,
}

struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn u32(&mut self, what: &str) -> Result<u32> {
        let end = self.at + 4;
        let bytes = self.data.get(self.at..end).ok_or_else(|| {
            ModelError::parse_error(format!("metadata ends before {what} at offset {}", self.at))
        })?;
        self.at = end;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl ResourceDescriptor {
    /// Parse the metadata block (the bytes following the header).
    ///
    /// # Errors
    ///
    /// Returns error if the block is truncated, declares an unknown area
    /// kind, or lacks a code area.
    pub fn parse(metadata: &[u8]) -> Result<Self> {
        let mut cur = Cursor {
            data: metadata,
            at: 0,
        };

        let area_count = cur.u32("area count")?;
        // Each area needs 8 bytes; refuse counts the block cannot hold before allocating.
        if u64::from(area_count) * 8 > metadata.len() as u64 {
            return Err(ModelError::InvalidField {
                field: "area_count",
                value: u64::from(area_count),
            });
        }
        let mut areas = Vec::with_capacity(area_count as usize);
        for _ in 0..area_count {
            let kind = match cur.u32("area kind")? {
                0 => AreaKind::Code,
                1 => AreaKind::Pool,
                other => {
                    return Err(ModelError::InvalidField {
                        field: "area kind",
                        value: u64::from(other),
                    })
                }
            };
            let size = cur.u32("area size")?;
            areas.push(MemoryArea { kind, size });
        }

        let page_table_pages = cur.u32("page table pages")?;
        let layer_count = cur.u32("layer count")?;
        if u64::from(layer_count) * 4 > metadata.len() as u64 {
            return Err(ModelError::InvalidField {
                field: "layer_count",
                value: u64::from(layer_count),
            });
        }
        let mut layer_operations = Vec::with_capacity(layer_count as usize);
        for _ in 0..layer_count {
            layer_operations.push(cur.u32("layer operation count")?);
        }

        let desc = Self {
            areas,
            page_table_pages,
            layer_operations,
        };
        if desc.area(AreaKind::Code).is_none() {
            return Err(ModelError::parse_error("metadata declares no code area"));
        }
        Ok(desc)
    }

    /// Parse the descriptor out of a complete public-data block (header included).
    ///
    /// # Errors
    ///
    /// Returns error if `public` is shorter than the header or the metadata is invalid.
    pub fn from_public_data(public: &[u8]) -> Result<Self> {
        let metadata = public.get(HEADER_SIZE..).ok_or_else(|| {
            ModelError::truncated("public data", HEADER_SIZE as u64, public.len() as u64)
        })?;
        Self::parse(metadata)
    }

    /// Serialize to the metadata layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.areas.len() * 8 + self.layer_operations.len() * 4);
        push_len(&mut out, self.areas.len());
        for area in &self.areas {
            let kind: u32 = match area.kind {
                AreaKind::Code => 0,
                AreaKind::Pool => 1,
            };
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(&area.size.to_le_bytes());
        }
        out.extend_from_slice(&self.page_table_pages.to_le_bytes());
        push_len(&mut out, self.layer_operations.len());
        for ops in &self.layer_operations {
            out.extend_from_slice(&ops.to_le_bytes());
        }
        out
    }

    /// First area of the given kind.
    pub fn area(&self, kind: AreaKind) -> Option<MemoryArea> {
        self.areas.iter().copied().find(|a| a.kind == kind)
    }

    /// Total operations over all layers.
    pub fn operation_count(&self) -> u64 {
        self.layer_operations.iter().map(|&n| u64::from(n)).sum()
    }

    /// Layer executing the `op`-th operation.
    pub fn layer_of_operation(&self, op: u64) -> Option<u32> {
        let mut end = 0u64;
        for (layer, &count) in self.layer_operations.iter().enumerate() {
            end += u64::from(count);
            if op < end {
                return u32::try_from(layer).ok();
            }
        }
        None
    }
}

fn push_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
}

/// Device-memory plan for one network, in page-rounded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSizing {
    /// Code region size
    pub code_size: u64,
    /// Page-table region size
    pub page_table_size: u64,
    /// Constant-pool region size, 0 when the model has no pool
    pub pool_size: u64,
    /// Profiling region size, 0 unless built in profiling mode
    pub profile_size: u64,
    /// Code and pool go to secure memory
    pub secure: bool,
    /// Profiling mode
    pub profiling: bool,
}

impl ResourceSizing {
    /// Derive the plan from a header and its descriptor.
    pub fn plan(header: &ModelHeader, desc: &ResourceDescriptor) -> Self {
        let code_size = desc
            .area(AreaKind::Code)
            .map_or(0, |a| align_up(u64::from(a.size)));
        let pool_size = desc
            .area(AreaKind::Pool)
            .map_or(0, |a| align_up(u64::from(a.size)));
        let page_table_size =
            align_up(PAGE_TABLE_PAGE_BYTES * u64::from(desc.page_table_pages));
        let profiling = header.is_profiling();
        let profile_size = if profiling {
            align_up(desc.operation_count() * PROFILE_RECORD_SIZE as u64)
        } else {
            0
        };
        Self {
            code_size,
            page_table_size,
            pool_size,
            profile_size,
            secure: header.is_secure(),
            profiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ExecutionMode, SecurityType, FORMAT_VERSION};

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor {
            areas: vec![
                MemoryArea {
                    kind: AreaKind::Code,
                    size: 4000,
                },
                MemoryArea {
                    kind: AreaKind::Pool,
                    size: 9000,
                },
            ],
            page_table_pages: 16,
            layer_operations: vec![2, 3],
        }
    }

    #[test]
    fn parse_encoded_descriptor() {
        let desc = descriptor();
        let parsed = ResourceDescriptor::parse(&desc.encode()).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.operation_count(), 5);
        assert_eq!(parsed.layer_of_operation(0), Some(0));
        assert_eq!(parsed.layer_of_operation(2), Some(1));
        assert_eq!(parsed.layer_of_operation(5), None);
    }

    #[test]
    fn truncated_metadata() {
        let bytes = descriptor().encode();
        let err = ResourceDescriptor::parse(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ModelError::ParseError { .. }));
    }

    #[test]
    fn absurd_area_count_rejected() {
        let mut bytes = descriptor().encode();
        bytes[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            ResourceDescriptor::parse(&bytes),
            Err(ModelError::InvalidField { field: "area_count", .. })
        ));
    }

    #[test]
    fn code_area_required() {
        let desc = ResourceDescriptor {
            areas: vec![],
            page_table_pages: 1,
            layer_operations: vec![],
        };
        assert!(ResourceDescriptor::parse(&desc.encode()).is_err());
    }

    #[test]
    fn sizing_rounds_to_pages() {
        let header = ModelHeader {
            format_version: FORMAT_VERSION,
            security: SecurityType::Secure,
            execution_mode: ExecutionMode::Profile,
            metadata_length: 0,
            code_length: 0,
            key_set: 0,
            hardware_target: 0,
        };
        let sizing = ResourceSizing::plan(&header, &descriptor());
        assert_eq!(sizing.code_size, 4096);
        assert_eq!(sizing.pool_size, 12288);
        assert_eq!(sizing.page_table_size, 65536);
        assert_eq!(sizing.profile_size, 4096);
        assert!(sizing.secure);
        assert!(sizing.profiling);
    }
}
