//! Vertex input semantics derived from attribute names.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexSemantic {
    Position,
    Normal,
    Tangent,
    Bitangent,
    TexCoord,
    Color,
    BlendWeights,
    BlendIndices,
}

static PREFIXES: &[(&str, VertexSemantic)] = &[
    ("bs_position", VertexSemantic::Position),
    ("bs_normal", VertexSemantic::Normal),
    ("bs_tangent", VertexSemantic::Tangent),
    ("bs_bitangent", VertexSemantic::Bitangent),
    ("bs_texcoord", VertexSemantic::TexCoord),
    ("bs_color", VertexSemantic::Color),
    ("bs_blendweights", VertexSemantic::BlendWeights),
    ("bs_blendindices", VertexSemantic::BlendIndices),
    ("POSITION", VertexSemantic::Position),
    ("NORMAL", VertexSemantic::Normal),
    ("TANGENT", VertexSemantic::Tangent),
    ("BITANGENT", VertexSemantic::Bitangent),
    ("TEXCOORD", VertexSemantic::TexCoord),
    ("COLOR", VertexSemantic::Color),
    ("BLENDWEIGHT", VertexSemantic::BlendWeights),
    ("BLENDINDICES", VertexSemantic::BlendIndices),
];

/// Map an attribute name such as `bs_texcoord1` or `COLOR` to its
/// semantic and semantic index.
///
/// The remainder after the prefix must be empty (index 0) or a decimal
/// index. Anything else is not a recognised semantic.
pub fn parse_semantic(name: &str) -> Option<(VertexSemantic, u32)> {
    PREFIXES.iter().find_map(|&(prefix, semantic)| {
        let rest = name.strip_prefix(prefix)?;
        if rest.is_empty() {
            Some((semantic, 0))
        } else if rest.bytes().all(|b| b.is_ascii_digit()) {
            rest.parse().ok().map(|index| (semantic, index))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_and_hlsl_style_names() {
        assert_eq!(
            parse_semantic("bs_position"),
            Some((VertexSemantic::Position, 0))
        );
        assert_eq!(
            parse_semantic("bs_texcoord1"),
            Some((VertexSemantic::TexCoord, 1))
        );
        assert_eq!(parse_semantic("COLOR2"), Some((VertexSemantic::Color, 2)));
        assert_eq!(
            parse_semantic("BLENDINDICES"),
            Some((VertexSemantic::BlendIndices, 0))
        );
    }

    #[test]
    fn bitangent_is_not_mistaken_for_anything_else() {
        assert_eq!(
            parse_semantic("bs_bitangent"),
            Some((VertexSemantic::Bitangent, 0))
        );
        assert_eq!(
            parse_semantic("BITANGENT3"),
            Some((VertexSemantic::Bitangent, 3))
        );
    }

    #[test]
    fn unknown_names() {
        assert_eq!(parse_semantic("gl_VertexIndex"), None);
        assert_eq!(parse_semantic("bs_positionx"), None);
        assert_eq!(parse_semantic("inPos"), None);
    }
}
