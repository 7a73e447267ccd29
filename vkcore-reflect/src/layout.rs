//! std140 uniform block layout.
//!
//! Offsets are accumulated in 4-byte units, the way the uniform block
//! rules are usually stated: scalars and vectors pack tightly unless they
//! would straddle a 16-byte (4-unit) boundary, while arrays and structs
//! always start on and occupy whole 16-byte slots. Results are returned in
//! bytes.

use crate::types::ParamDataType;

/// One member of a uniform block (or of a struct nested in one).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockField {
    pub name: String,
    pub kind: FieldKind,
    /// Number of array elements. `1` for non-array members.
    pub array_len: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Data(ParamDataType),
    Struct(Vec<BlockField>),
}

impl BlockField {
    pub fn data(name: impl Into<String>, ty: ParamDataType) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Data(ty),
            array_len: 1,
        }
    }

    pub fn array(name: impl Into<String>, ty: ParamDataType, len: u32) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Data(ty),
            array_len: len,
        }
    }

    pub fn structure(
        name: impl Into<String>,
        fields: Vec<BlockField>,
        len: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Struct(fields),
            array_len: len,
        }
    }
}

/// Placement of a single top-level field, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub offset: u32,
    pub element_size: u32,
    pub array_stride: u32,
    pub array_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    /// Total block size in bytes, always a multiple of 16.
    pub total_size: u32,
    /// One entry per input field, in input order.
    pub fields: Vec<FieldLayout>,
}

/// Compute std140 offsets for `fields`.
pub fn compute_block_layout(fields: &[BlockField]) -> BlockLayout {
    let mut offset = 0;
    let placed = fields
        .iter()
        .map(|field| {
            let layout = place_field(field, &mut offset);
            FieldLayout {
                offset: layout.offset * 4,
                element_size: layout.element_size * 4,
                array_stride: layout.array_stride * 4,
                array_len: layout.array_len,
            }
        })
        .collect();
    BlockLayout {
        total_size: offset.next_multiple_of(4) * 4,
        fields: placed,
    }
}

/// Place `field` at or after `offset` (in units) and advance `offset`
/// past it. The returned layout is in units.
fn place_field(field: &BlockField, offset: &mut u32) -> FieldLayout {
    let array_len = field.array_len.max(1);
    match &field.kind {
        FieldKind::Struct(members) => {
            let element_size = struct_size(members);
            let stride = element_size.next_multiple_of(4);
            *offset = offset.next_multiple_of(4);
            let layout = FieldLayout {
                offset: *offset,
                element_size,
                array_stride: stride,
                array_len,
            };
            *offset += stride * array_len;
            layout
        }
        FieldKind::Data(ty) => {
            let element_size = ty.info().size / 4;
            let array_stride = if array_len > 1 {
                element_size.next_multiple_of(4)
            } else {
                element_size
            };
            let stride = align_data_member(*ty, array_len, offset);
            let layout = FieldLayout {
                offset: *offset,
                element_size,
                array_stride,
                array_len,
            };
            *offset += stride * array_len;
            layout
        }
    }
}

/// Size of a struct's members in units, before trailing padding.
fn struct_size(members: &[BlockField]) -> u32 {
    let mut offset = 0;
    for member in members {
        place_field(member, &mut offset);
    }
    offset
}

/// Align `offset` for a data member and return the per-element stride.
fn align_data_member(ty: ParamDataType, array_len: u32, offset: &mut u32) -> u32 {
    let info = ty.info();
    let mut size = info.size / 4;
    *offset = offset.next_multiple_of(info.alignment / 4);
    if array_len > 1 {
        size = size.next_multiple_of(4);
        *offset = offset.next_multiple_of(4);
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParamDataType::*;

    #[test]
    fn float_vec3_vec4_array() {
        let layout = compute_block_layout(&[
            BlockField::data("a", Float1),
            BlockField::data("b", Float3),
            BlockField::array("c", Float4, 2),
        ]);
        let offsets: Vec<u32> = layout.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 16, 32]);
        assert_eq!(layout.fields[2].array_stride, 16);
        assert_eq!(layout.total_size, 64);
        assert_eq!(layout.total_size % 16, 0);
    }

    #[test]
    fn scalars_pack_after_vec3() {
        let layout = compute_block_layout(&[
            BlockField::data("dir", Float3),
            BlockField::data("intensity", Float1),
            BlockField::data("uv", Float2),
        ]);
        let offsets: Vec<u32> = layout.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 12, 16]);
        assert_eq!(layout.total_size, 32);
    }

    #[test]
    fn scalar_arrays_use_vec4_stride() {
        let layout = compute_block_layout(&[
            BlockField::data("x", Float1),
            BlockField::array("weights", Float1, 3),
            BlockField::data("y", Float1),
        ]);
        let w = layout.fields[1];
        assert_eq!(w.offset, 16);
        assert_eq!(w.element_size, 4);
        assert_eq!(w.array_stride, 16);
        assert_eq!(layout.fields[2].offset, 64);
        assert_eq!(layout.total_size, 80);
    }

    #[test]
    fn matrices_occupy_whole_columns() {
        let layout = compute_block_layout(&[
            BlockField::data("flag", Bool),
            BlockField::data("normal", Mat3x3),
            BlockField::data("after", Float1),
        ]);
        assert_eq!(layout.fields[1].offset, 16);
        assert_eq!(layout.fields[1].element_size, 48);
        assert_eq!(layout.fields[2].offset, 64);
    }

    #[test]
    fn structs_round_to_vec4() {
        let light = vec![
            BlockField::data("pos", Float3),
            BlockField::data("range", Float1),
            BlockField::data("color", Float3),
        ];
        let layout = compute_block_layout(&[
            BlockField::data("count", Int1),
            BlockField::structure("lights", light, 2),
            BlockField::data("ambient", Float1),
        ]);
        let lights = layout.fields[1];
        assert_eq!(lights.offset, 16);
        assert_eq!(lights.element_size, 28);
        assert_eq!(lights.array_stride, 32);
        assert_eq!(layout.fields[2].offset, 80);
        assert_eq!(layout.total_size, 96);
    }

    #[test]
    fn empty_block_has_zero_size() {
        let layout = compute_block_layout(&[]);
        assert_eq!(layout.total_size, 0);
        assert!(layout.fields.is_empty());
    }
}
