//! Scoring request buffer: parsing, validation, and a builder.
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ RequestHeader (48 bytes)     │
//! ├──────────────────────────────┤
//! │ BufferOverride × n      (16) │
//! │ LayerTypeOverride × n   (16) │
//! │ ActiveListOverride × n  (16) │
//! ├──────────────────────────────┤
//! │ PatchHeader (8) + payload    │ × patch_count
//! └──────────────────────────────┘ total == buffer length
//! ```
//!
//! All fields are little-endian. Records are read with `bytemuck` in host
//! byte order, which is little-endian on every platform the device ships on.
//! The parser computes the total length from the counts and patch sizes and
//! rejects the buffer before any field is acted on if it disagrees.

use crate::error::{GnaError, Result};
use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};
use gna_chip::layer::{self, BufferSlot, LAYER_DESCRIPTOR_SIZE};
use std::mem::size_of;

/// Fixed request header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RequestHeader {
    /// Operating mode, active-list enable, statistics level
    pub mode_flags: u32,
    /// Target memory identifier
    pub memory_id: u32,
    /// Configuration identifier for the override cache
    pub config_id: u64,
    /// Offset of the layer array inside the mapped buffer
    pub layer_base: u32,
    /// Number of layers
    pub layer_count: u32,
    /// Declared configuration size (header + patches)
    pub config_size: u32,
    /// Buffer overrides that follow
    pub buffer_override_count: u32,
    /// Layer-type overrides that follow
    pub layer_type_override_count: u32,
    /// Active-list overrides that follow
    pub active_list_override_count: u32,
    /// Memory patches that follow
    pub patch_count: u32,
    /// Must be zero
    pub reserved: u32,
}

/// Point a layer's buffer field at an offset in the mapped buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferOverride {
    /// Layer index
    pub layer: u32,
    /// Buffer kind (see [`BufferSlot`])
    pub kind: u32,
    /// Offset in the mapped buffer
    pub offset: u32,
    /// Must be zero
    pub reserved: u32,
}

/// Overwrite one field of a layer descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LayerTypeOverride {
    /// Layer index
    pub layer: u32,
    /// Byte offset inside the layer descriptor
    pub field: u16,
    /// Field width in bytes (1, 2 or 4)
    pub width: u16,
    /// New value, truncated to `width`
    pub value: u32,
    /// Must be zero
    pub reserved: u32,
}

/// Point a layer at an active list.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ActiveListOverride {
    /// Layer index
    pub layer: u32,
    /// Offset of the list in the mapped buffer
    pub list_offset: u32,
    /// Number of `u32` list entries
    pub list_count: u32,
    /// Must be zero
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct PatchHeader {
    offset: u32,
    size: u32,
}

/// Header size in bytes
pub const HEADER_SIZE: usize = size_of::<RequestHeader>();

/// Size of every override record
pub const OVERRIDE_SIZE: usize = 16;

/// Size of the header preceding each patch payload
pub const PATCH_HEADER_SIZE: usize = size_of::<PatchHeader>();

/// Smallest acceptable request
pub const MIN_REQUEST_SIZE: usize = HEADER_SIZE;

/// Operating modes accepted in `mode_flags` bits 0..1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Neural network layers
    Xnn,
    /// Gaussian mixture model
    Gmm,
}

impl OperatingMode {
    /// Raw register encoding
    pub const fn raw(self) -> u32 {
        match self {
            Self::Xnn => 0,
            Self::Gmm => 1,
        }
    }
}

/// `mode_flags` bit layout.
pub mod mode_flags {
    /// Operating mode field
    pub const MODE_MASK: u32 = 0b11;
    /// Active-list enable
    pub const ACTIVE_LIST: u32 = 1 << 2;
    /// Statistics level shift
    pub const STATS_SHIFT: u32 = 4;
    /// Statistics level field
    pub const STATS_MASK: u32 = 0xF << STATS_SHIFT;
}

/// One memory patch: bytes to copy into the mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch<'a> {
    /// Destination offset in the mapped buffer
    pub offset: u32,
    /// Payload
    pub data: &'a [u8],
}

impl Patch<'_> {
    fn end(&self) -> usize {
        self.offset as usize + self.data.len()
    }
}

/// A length-checked, semantically validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest<'a> {
    /// Header
    pub header: RequestHeader,
    /// Operating mode
    pub mode: OperatingMode,
    /// Active-list enable
    pub active_list: bool,
    /// Statistics level (0 disables)
    pub stats_level: u32,
    /// Buffer overrides
    pub buffer_overrides: Vec<BufferOverride>,
    /// Layer-type overrides
    pub layer_type_overrides: Vec<LayerTypeOverride>,
    /// Active-list overrides
    pub active_list_overrides: Vec<ActiveListOverride>,
    /// Memory patches
    pub patches: Vec<Patch<'a>>,
}

fn size_error(expected: usize, actual: usize) -> GnaError {
    GnaError::InvalidBufferSize { expected, actual }
}

fn records<T: Pod>(buf: &[u8], start: usize, count: usize) -> Vec<T> {
    buf[start..start + count * OVERRIDE_SIZE]
        .chunks_exact(OVERRIDE_SIZE)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Total length implied by the header and patch sizes.
fn expected_length(buf: &[u8], header: &RequestHeader) -> Result<usize> {
    let actual = buf.len();
    let overrides = [
        header.buffer_override_count,
        header.layer_type_override_count,
        header.active_list_override_count,
    ]
    .iter()
    .try_fold(0usize, |acc, &n| acc.checked_add(n as usize))
    .and_then(|n| n.checked_mul(OVERRIDE_SIZE))
    .and_then(|n| n.checked_add(HEADER_SIZE))
    .ok_or_else(|| size_error(usize::MAX, actual))?;

    let mut cursor = overrides;
    for _ in 0..header.patch_count {
        let body = cursor
            .checked_add(PATCH_HEADER_SIZE)
            .ok_or_else(|| size_error(usize::MAX, actual))?;
        if body > actual {
            return Err(size_error(body, actual));
        }
        let patch: PatchHeader = bytemuck::pod_read_unaligned(&buf[cursor..body]);
        cursor = body
            .checked_add(patch.size as usize)
            .ok_or_else(|| size_error(usize::MAX, actual))?;
    }
    Ok(cursor)
}

/// Parse and validate a raw request buffer.
///
/// # Errors
///
/// `InvalidBufferSize` when the buffer is shorter than a header or its
/// length disagrees with the header; `InvalidParameter` for an unknown
/// operating mode, a nonzero reserved field, or patches larger than the
/// declared configuration size.
pub fn parse(buf: &[u8]) -> Result<ParsedRequest<'_>> {
    if buf.len() < MIN_REQUEST_SIZE {
        return Err(size_error(MIN_REQUEST_SIZE, buf.len()));
    }
    let header: RequestHeader = bytemuck::pod_read_unaligned(&buf[..HEADER_SIZE]);

    let expected = expected_length(buf, &header)?;
    if expected != buf.len() {
        return Err(size_error(expected, buf.len()));
    }

    let mode = match header.mode_flags & mode_flags::MODE_MASK {
        0 => OperatingMode::Xnn,
        1 => OperatingMode::Gmm,
        other => {
            return Err(GnaError::invalid_parameter(format!(
                "operating mode {other}"
            )))
        }
    };

    let mut cursor = HEADER_SIZE;
    let buffer_overrides: Vec<BufferOverride> = records(buf, cursor, header.buffer_override_count as usize);
    cursor += buffer_overrides.len() * OVERRIDE_SIZE;
    let layer_type_overrides: Vec<LayerTypeOverride> = records(buf, cursor, header.layer_type_override_count as usize);
    cursor += layer_type_overrides.len() * OVERRIDE_SIZE;
    let active_list_overrides: Vec<ActiveListOverride> = records(buf, cursor, header.active_list_override_count as usize);
    cursor += active_list_overrides.len() * OVERRIDE_SIZE;

    let reserved_in_use = [
        ("request header", header.reserved != 0),
        ("buffer override", buffer_overrides.iter().any(|o| o.reserved != 0)),
        ("layer type override", layer_type_overrides.iter().any(|o| o.reserved != 0)),
        ("active list override", active_list_overrides.iter().any(|o| o.reserved != 0)),
    ];
    if let Some((record, _)) = reserved_in_use.iter().find(|(_, set)| *set) {
        return Err(GnaError::invalid_parameter(format!(
            "reserved field of {record} is not zero"
        )));
    }

    let mut patches = Vec::with_capacity(header.patch_count as usize);
    let mut config_bytes = HEADER_SIZE;
    for _ in 0..header.patch_count {
        let patch: PatchHeader = bytemuck::pod_read_unaligned(&buf[cursor..cursor + PATCH_HEADER_SIZE]);
        cursor += PATCH_HEADER_SIZE;
        let size = patch.size as usize;
        patches.push(Patch {
            offset: patch.offset,
            data: &buf[cursor..cursor + size],
        });
        cursor += size;
        config_bytes += PATCH_HEADER_SIZE + size;
    }
    if config_bytes > header.config_size as usize {
        return Err(GnaError::invalid_parameter(format!(
            "header and patches take {config_bytes} bytes, configuration size is {}",
            header.config_size
        )));
    }

    Ok(ParsedRequest {
        header,
        mode,
        active_list: header.mode_flags & mode_flags::ACTIVE_LIST != 0,
        stats_level: (header.mode_flags & mode_flags::STATS_MASK) >> mode_flags::STATS_SHIFT,
        buffer_overrides,
        layer_type_overrides,
        active_list_overrides,
        patches,
    })
}

impl ParsedRequest<'_> {
    /// Check every write the request implies against a mapped buffer of
    /// `user_size` bytes.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` naming the first out-of-range element.
    pub fn validate_against(&self, user_size: usize) -> Result<()> {
        let layers = self.header.layer_count;
        let layer_end = (self.header.layer_base as usize)
            .checked_add(layers as usize * LAYER_DESCRIPTOR_SIZE);
        if layer_end.is_none_or(|end| end > user_size) {
            return Err(GnaError::invalid_parameter(format!(
                "{layers} layers at {:#x} exceed the {user_size}-byte buffer",
                self.header.layer_base
            )));
        }
        let check_layer = |layer: u32| {
            if layer < layers {
                Ok(())
            } else {
                Err(GnaError::invalid_parameter(format!(
                    "layer {layer} out of range ({layers} layers)"
                )))
            }
        };

        for o in &self.buffer_overrides {
            check_layer(o.layer)?;
            if BufferSlot::from_raw(o.kind).is_none() {
                return Err(GnaError::invalid_parameter(format!("buffer kind {}", o.kind)));
            }
            if o.offset as usize >= user_size {
                return Err(GnaError::invalid_parameter(format!(
                    "buffer offset {:#x} outside the mapped buffer",
                    o.offset
                )));
            }
        }

        for o in &self.layer_type_overrides {
            check_layer(o.layer)?;
            if !matches!(o.width, 1 | 2 | 4) || o.field as usize + o.width as usize > LAYER_DESCRIPTOR_SIZE {
                return Err(GnaError::invalid_parameter(format!(
                    "layer field {:#x} width {}",
                    o.field, o.width
                )));
            }
        }

        for o in &self.active_list_overrides {
            check_layer(o.layer)?;
            let end = (o.list_offset as usize).checked_add(o.list_count as usize * 4);
            if end.is_none_or(|end| end > user_size) {
                return Err(GnaError::invalid_parameter(format!(
                    "active list at {:#x} ({} entries) outside the mapped buffer",
                    o.list_offset, o.list_count
                )));
            }
        }

        for (index, patch) in self.patches.iter().enumerate() {
            if patch.end() > user_size {
                return Err(GnaError::invalid_parameter(format!(
                    "patch {index} [{:#x}, {:#x}) outside the {user_size}-byte buffer",
                    patch.offset,
                    patch.end()
                )));
            }
        }
        Ok(())
    }

    /// Write every override into `user`, the mapped buffer.
    pub(crate) fn apply_overrides(&self, user: &mut [u8]) {
        let base = self.header.layer_base as usize;
        let at = |layer: u32, field: usize| base + layer::field_position(layer, field);

        for o in &self.buffer_overrides {
            if let Some(slot) = BufferSlot::from_raw(o.kind) {
                let pos = at(o.layer, slot.field_offset());
                user[pos..pos + 4].copy_from_slice(&o.offset.to_le_bytes());
            }
        }
        for o in &self.layer_type_overrides {
            let pos = at(o.layer, o.field as usize);
            let width = o.width as usize;
            user[pos..pos + width].copy_from_slice(&o.value.to_le_bytes()[..width]);
        }
        for o in &self.active_list_overrides {
            let pos = at(o.layer, layer::ACTIVE_LIST_BUFFER);
            user[pos..pos + 4].copy_from_slice(&o.list_offset.to_le_bytes());
            let pos = at(o.layer, layer::ACTIVE_LIST_COUNT);
            user[pos..pos + 4].copy_from_slice(&o.list_count.to_le_bytes());
        }
    }

    /// Copy every patch into `user`, the mapped buffer.
    pub(crate) fn apply_patches(&self, user: &mut [u8]) {
        for patch in &self.patches {
            user[patch.offset as usize..patch.end()].copy_from_slice(patch.data);
        }
    }
}

/// Builds well-formed request buffers.
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    header: RequestHeader,
    buffer_overrides: Vec<BufferOverride>,
    layer_type_overrides: Vec<LayerTypeOverride>,
    active_list_overrides: Vec<ActiveListOverride>,
    patches: Vec<(u32, Vec<u8>)>,
    config_size: Option<u32>,
}

impl RequestBuilder {
    /// Request against memory `memory_id` with configuration `config_id`
    pub fn new(memory_id: u32, config_id: u64) -> Self {
        Self {
            header: RequestHeader {
                memory_id,
                config_id,
                ..RequestHeader::default()
            },
            ..Self::default()
        }
    }

    /// Layer array location
    #[must_use]
    pub const fn layers(mut self, base: u32, count: u32) -> Self {
        self.header.layer_base = base;
        self.header.layer_count = count;
        self
    }

    /// Raw operating-mode bits
    #[must_use]
    pub const fn mode(mut self, mode: u32) -> Self {
        self.header.mode_flags =
            (self.header.mode_flags & !mode_flags::MODE_MASK) | (mode & mode_flags::MODE_MASK);
        self
    }

    /// Enable active lists
    #[must_use]
    pub const fn active_list(mut self) -> Self {
        self.header.mode_flags |= mode_flags::ACTIVE_LIST;
        self
    }

    /// Statistics level
    #[must_use]
    pub const fn stats(mut self, level: u32) -> Self {
        self.header.mode_flags = (self.header.mode_flags & !mode_flags::STATS_MASK)
            | ((level << mode_flags::STATS_SHIFT) & mode_flags::STATS_MASK);
        self
    }

    /// Add a buffer override
    #[must_use]
    pub fn buffer(mut self, layer: u32, slot: BufferSlot, offset: u32) -> Self {
        let kind = match slot {
            BufferSlot::Input => 0,
            BufferSlot::Output => 1,
            BufferSlot::OutputIntermediate => 2,
            BufferSlot::Weights => 3,
            BufferSlot::Bias => 4,
        };
        self.buffer_overrides.push(BufferOverride {
            layer,
            kind,
            offset,
            reserved: 0,
        });
        self
    }

    /// Add a layer-type override
    #[must_use]
    pub fn layer_field(mut self, layer: u32, field: u16, width: u16, value: u32) -> Self {
        self.layer_type_overrides.push(LayerTypeOverride {
            layer,
            field,
            width,
            value,
            reserved: 0,
        });
        self
    }

    /// Add an active-list override
    #[must_use]
    pub fn active_list_at(mut self, layer: u32, list_offset: u32, list_count: u32) -> Self {
        self.active_list_overrides.push(ActiveListOverride {
            layer,
            list_offset,
            list_count,
            reserved: 0,
        });
        self
    }

    /// Add a memory patch
    #[must_use]
    pub fn patch(mut self, offset: u32, data: &[u8]) -> Self {
        self.patches.push((offset, data.to_vec()));
        self
    }

    /// Declare a configuration size instead of the computed one
    #[must_use]
    pub const fn config_size(mut self, size: u32) -> Self {
        self.config_size = Some(size);
        self
    }

    /// Serialize
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Bytes {
        let mut header = self.header;
        header.buffer_override_count = self.buffer_overrides.len() as u32;
        header.layer_type_override_count = self.layer_type_overrides.len() as u32;
        header.active_list_override_count = self.active_list_overrides.len() as u32;
        header.patch_count = self.patches.len() as u32;
        let patch_bytes: usize = self
            .patches
            .iter()
            .map(|(_, data)| PATCH_HEADER_SIZE + data.len())
            .sum();
        header.config_size = self
            .config_size
            .unwrap_or((HEADER_SIZE + patch_bytes) as u32);

        let mut out = BytesMut::new();
        out.put_slice(bytemuck::bytes_of(&header));
        for o in &self.buffer_overrides {
            out.put_slice(bytemuck::bytes_of(o));
        }
        for o in &self.layer_type_overrides {
            out.put_slice(bytemuck::bytes_of(o));
        }
        for o in &self.active_list_overrides {
            out.put_slice(bytemuck::bytes_of(o));
        }
        for (offset, data) in &self.patches {
            out.put_slice(bytemuck::bytes_of(&PatchHeader {
                offset: *offset,
                size: data.len() as u32,
            }));
            out.put_slice(data);
        }
        out.freeze()
    }
}
