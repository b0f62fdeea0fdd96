//! XNN layer-descriptor layout.
//!
//! Layer descriptors live inside the application's mapped buffer as an
//! array of 128-byte records starting at the request's layer base. A
//! scoring request may patch the buffer pointers and active-list fields of
//! individual layers before the engine starts.

/// Size of one layer descriptor.
pub const LAYER_DESCRIPTOR_SIZE: usize = 128;

/// Operation code (`u8`).
pub const OP: usize = 0x00;
/// Flags (`u8`).
pub const FLAGS: usize = 0x01;
/// Input element count (`u16`).
pub const INPUT_ELEMENTS: usize = 0x02;
/// Output element count (`u16`).
pub const OUTPUT_ELEMENTS: usize = 0x04;
/// Active-list element count (`u32`).
pub const ACTIVE_LIST_COUNT: usize = 0x18;
/// Input buffer offset (`u32`).
pub const INPUT_BUFFER: usize = 0x20;
/// Activated output buffer offset (`u32`).
pub const OUTPUT_BUFFER: usize = 0x24;
/// Intermediate (pre-activation) output buffer offset (`u32`).
pub const OUTPUT_INTERMEDIATE_BUFFER: usize = 0x28;
/// Weights buffer offset (`u32`).
pub const WEIGHTS_BUFFER: usize = 0x2C;
/// Bias buffer offset (`u32`).
pub const BIAS_BUFFER: usize = 0x30;
/// Active-list buffer offset (`u32`).
pub const ACTIVE_LIST_BUFFER: usize = 0x34;

/// Buffer slots a request may redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// Input activations.
    Input,
    /// Activated outputs.
    Output,
    /// Pre-activation outputs.
    OutputIntermediate,
    /// Weights.
    Weights,
    /// Bias.
    Bias,
}

impl BufferSlot {
    /// Decode the wire value of a buffer kind.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            2 => Some(Self::OutputIntermediate),
            3 => Some(Self::Weights),
            4 => Some(Self::Bias),
            _ => None,
        }
    }

    /// Field offset inside the layer descriptor.
    #[must_use]
    pub const fn field_offset(self) -> usize {
        match self {
            Self::Input => INPUT_BUFFER,
            Self::Output => OUTPUT_BUFFER,
            Self::OutputIntermediate => OUTPUT_INTERMEDIATE_BUFFER,
            Self::Weights => WEIGHTS_BUFFER,
            Self::Bias => BIAS_BUFFER,
        }
    }
}

/// Byte offset of `field` of layer `index`, relative to the layer base.
#[must_use]
pub const fn field_position(index: u32, field: usize) -> usize {
    index as usize * LAYER_DESCRIPTOR_SIZE + field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_slots_round_trip_wire_values() {
        for raw in 0..5 {
            assert!(BufferSlot::from_raw(raw).is_some());
        }
        assert_eq!(BufferSlot::from_raw(5), None);
        assert_eq!(BufferSlot::Bias.field_offset(), BIAS_BUFFER);
    }

    #[test]
    fn fields_stay_inside_the_record() {
        assert!(ACTIVE_LIST_BUFFER + 4 <= LAYER_DESCRIPTOR_SIZE);
        assert_eq!(field_position(2, INPUT_BUFFER), 256 + 0x20);
    }
}
