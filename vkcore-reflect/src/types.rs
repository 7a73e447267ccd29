//! Data-parameter types and their std140 size/alignment table.

use serde::{Deserialize, Serialize};

/// Type of a plain data member inside a uniform block.
///
/// Matrices are named `MatCxR` (C columns, R rows) and are stored
/// column-major, matching GLSL's `matCxR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDataType {
    Float1,
    Float2,
    Float3,
    Float4,
    Int1,
    Int2,
    Int3,
    Int4,
    UInt1,
    UInt2,
    UInt3,
    UInt4,
    Bool,
    Bool2,
    Bool3,
    Bool4,
    Mat2x2,
    Mat2x3,
    Mat2x4,
    Mat3x2,
    Mat3x3,
    Mat3x4,
    Mat4x2,
    Mat4x3,
    Mat4x4,
}

/// Component class used when mapping reflected scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
    Bool,
}

/// Size and alignment of a [`ParamDataType`] under std140, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub columns: u32,
    pub rows: u32,
    pub size: u32,
    pub alignment: u32,
}

const fn vector(rows: u32) -> TypeInfo {
    TypeInfo {
        columns: 1,
        rows,
        size: rows * 4,
        alignment: if rows == 1 {
            4
        } else if rows == 2 {
            8
        } else {
            16
        },
    }
}

// Every column of a std140 matrix is padded out to a vec4.
const fn matrix(columns: u32, rows: u32) -> TypeInfo {
    TypeInfo {
        columns,
        rows,
        size: columns * 16,
        alignment: 16,
    }
}

/// Indexed by `ParamDataType as usize`; order must match the enum.
static TYPE_INFO: [TypeInfo; 25] = [
    vector(1),
    vector(2),
    vector(3),
    vector(4),
    vector(1),
    vector(2),
    vector(3),
    vector(4),
    vector(1),
    vector(2),
    vector(3),
    vector(4),
    vector(1),
    vector(2),
    vector(3),
    vector(4),
    matrix(2, 2),
    matrix(2, 3),
    matrix(2, 4),
    matrix(3, 2),
    matrix(3, 3),
    matrix(3, 4),
    matrix(4, 2),
    matrix(4, 3),
    matrix(4, 4),
];

impl ParamDataType {
    pub fn info(self) -> &'static TypeInfo {
        &TYPE_INFO[self as usize]
    }

    pub fn is_matrix(self) -> bool {
        self.info().columns > 1
    }

    /// Scalar or vector type with `components` lanes of `kind`.
    pub fn from_components(kind: ScalarKind, components: u32) -> Option<Self> {
        use ParamDataType::*;
        let ty = match (kind, components) {
            (ScalarKind::Float, 1) => Float1,
            (ScalarKind::Float, 2) => Float2,
            (ScalarKind::Float, 3) => Float3,
            (ScalarKind::Float, 4) => Float4,
            (ScalarKind::Int, 1) => Int1,
            (ScalarKind::Int, 2) => Int2,
            (ScalarKind::Int, 3) => Int3,
            (ScalarKind::Int, 4) => Int4,
            (ScalarKind::UInt, 1) => UInt1,
            (ScalarKind::UInt, 2) => UInt2,
            (ScalarKind::UInt, 3) => UInt3,
            (ScalarKind::UInt, 4) => UInt4,
            (ScalarKind::Bool, 1) => Bool,
            (ScalarKind::Bool, 2) => Bool2,
            (ScalarKind::Bool, 3) => Bool3,
            (ScalarKind::Bool, 4) => Bool4,
            _ => return None,
        };
        Some(ty)
    }

    /// Float matrix with the given column and row counts.
    pub fn matrix(columns: u32, rows: u32) -> Option<Self> {
        use ParamDataType::*;
        let ty = match (columns, rows) {
            (2, 2) => Mat2x2,
            (2, 3) => Mat2x3,
            (2, 4) => Mat2x4,
            (3, 2) => Mat3x2,
            (3, 3) => Mat3x3,
            (3, 4) => Mat3x4,
            (4, 2) => Mat4x2,
            (4, 3) => Mat4x3,
            (4, 4) => Mat4x4,
            _ => return None,
        };
        Some(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_order_matches_enum() {
        assert_eq!(ParamDataType::Float3.info().size, 12);
        assert_eq!(ParamDataType::Float3.info().alignment, 16);
        assert_eq!(ParamDataType::Int2.info().alignment, 8);
        assert_eq!(ParamDataType::Bool.info().size, 4);
        assert_eq!(ParamDataType::Bool3.info().alignment, 16);
        assert_eq!(ParamDataType::Mat2x2.info().columns, 2);
        assert_eq!(ParamDataType::Mat4x4.info().size, 64);
        assert_eq!(ParamDataType::Mat3x3.info().size, 48);
        assert_eq!(ParamDataType::Mat2x4.info().columns, 2);
        assert_eq!(ParamDataType::Mat2x4.info().rows, 4);
    }

    #[test]
    fn constructors_reject_unknown_shapes() {
        assert_eq!(
            ParamDataType::from_components(ScalarKind::UInt, 3),
            Some(ParamDataType::UInt3)
        );
        assert_eq!(
            ParamDataType::from_components(ScalarKind::Bool, 2),
            Some(ParamDataType::Bool2)
        );
        assert_eq!(ParamDataType::from_components(ScalarKind::Bool, 5), None);
        assert_eq!(ParamDataType::matrix(4, 3), Some(ParamDataType::Mat4x3));
        assert_eq!(ParamDataType::matrix(1, 4), None);
        assert!(ParamDataType::Mat3x2.is_matrix());
        assert!(!ParamDataType::Float4.is_matrix());
    }
}
