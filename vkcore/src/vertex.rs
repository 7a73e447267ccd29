//! Mesh vertex declarations and their match against a vertex program.

use thiserror::Error;
use vkcore_reflect::manifest::VertexInputDesc;
use vkcore_reflect::semantic::VertexSemantic;

use crate::mapping::VertexElementType;
use crate::pipeline::{VertexAttributeDesc, VertexBindingDesc, VertexInputLayout};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VertexInputError {
    #[error("Mesh provides no {semantic:?}{index} element required by input '{name}'")]
    MissingElement {
        name: String,
        semantic: VertexSemantic,
        index: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    /// Vertex buffer binding the element is read from.
    pub stream: u32,
    pub offset: u32,
    pub ty: VertexElementType,
    pub semantic: VertexSemantic,
    pub semantic_index: u32,
    pub per_instance: bool,
}

/// The elements a mesh stores per vertex, across one or more streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexDeclaration {
    elements: Vec<VertexElement>,
}

impl VertexDeclaration {
    pub fn new(elements: Vec<VertexElement>) -> Self {
        Self { elements }
    }

    /// Build a declaration by packing `(semantic, index, type)` tightly in
    /// stream 0, in order.
    pub fn packed(elements: &[(VertexSemantic, u32, VertexElementType)]) -> Self {
        let mut offset = 0;
        let elements = elements
            .iter()
            .map(|&(semantic, semantic_index, ty)| {
                let element = VertexElement {
                    stream: 0,
                    offset,
                    ty,
                    semantic,
                    semantic_index,
                    per_instance: false,
                };
                offset += ty.size();
                element
            })
            .collect();
        Self { elements }
    }

    pub fn elements(&self) -> &[VertexElement] {
        &self.elements
    }

    pub fn find(&self, semantic: VertexSemantic, index: u32) -> Option<&VertexElement> {
        self.elements
            .iter()
            .find(|e| e.semantic == semantic && e.semantic_index == index)
    }

    /// Bytes per vertex in `stream`.
    pub fn stride(&self, stream: u32) -> u32 {
        self.elements
            .iter()
            .filter(|e| e.stream == stream)
            .map(|e| e.offset + e.ty.size())
            .max()
            .unwrap_or(0)
    }

    /// The vertex input layout feeding `inputs` from this declaration.
    ///
    /// Every shader input must find an element with the same semantic and
    /// index. Mesh elements the shader does not read are left out, as are
    /// streams that end up unused.
    pub fn input_layout(&self, inputs: &[VertexInputDesc]) -> Result<VertexInputLayout, VertexInputError> {
        let mut layout = VertexInputLayout::default();
        for input in inputs {
            let element = self.find(input.semantic, input.semantic_index).ok_or_else(|| {
                VertexInputError::MissingElement {
                    name: input.name.clone(),
                    semantic: input.semantic,
                    index: input.semantic_index,
                }
            })?;
            layout.attributes.push(VertexAttributeDesc {
                location: input.location,
                binding: element.stream,
                format: element.ty.into(),
                offset: element.offset,
            });
            if !layout.bindings.iter().any(|b| b.binding == element.stream) {
                layout.bindings.push(VertexBindingDesc {
                    binding: element.stream,
                    stride: self.stride(element.stream),
                    per_instance: element.per_instance,
                });
            }
        }
        layout.attributes.sort_by_key(|a| a.location);
        layout.bindings.sort_by_key(|b| b.binding);
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;

    fn input(name: &str, semantic: VertexSemantic, index: u32, location: u32) -> VertexInputDesc {
        VertexInputDesc {
            name: name.to_owned(),
            semantic,
            semantic_index: index,
            location,
            data_type: None,
        }
    }

    fn mesh() -> VertexDeclaration {
        VertexDeclaration::packed(&[
            (VertexSemantic::Position, 0, VertexElementType::Float3),
            (VertexSemantic::Normal, 0, VertexElementType::Float3),
            (VertexSemantic::TexCoord, 0, VertexElementType::Float2),
            (VertexSemantic::TexCoord, 1, VertexElementType::Float2),
            (VertexSemantic::Color, 0, VertexElementType::Color),
        ])
    }

    #[test]
    fn packed_offsets_and_stride() {
        let decl = mesh();
        let offsets: Vec<u32> = decl.elements().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 32, 40]);
        assert_eq!(decl.stride(0), 44);
        assert_eq!(decl.stride(1), 0);
    }

    #[test]
    fn matches_by_semantic_not_order() {
        let inputs = [
            input("bs_texcoord1", VertexSemantic::TexCoord, 1, 0),
            input("bs_position", VertexSemantic::Position, 0, 1),
        ];
        let layout = mesh().input_layout(&inputs).unwrap();
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].stride, 44);
        assert_eq!(layout.attributes.len(), 2);
        assert_eq!(layout.attributes[0].location, 0);
        assert_eq!(layout.attributes[0].offset, 32);
        assert_eq!(layout.attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(layout.attributes[1].offset, 0);
        assert_eq!(layout.attributes[1].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn missing_semantic_is_reported() {
        let inputs = [input("TANGENT", VertexSemantic::Tangent, 0, 3)];
        let err = mesh().input_layout(&inputs).unwrap_err();
        assert_eq!(
            err,
            VertexInputError::MissingElement {
                name: "TANGENT".into(),
                semantic: VertexSemantic::Tangent,
                index: 0,
            }
        );
    }

    #[test]
    fn instance_streams_keep_their_rate() {
        let mut elements = mesh().elements().to_vec();
        elements.push(VertexElement {
            stream: 1,
            offset: 0,
            ty: VertexElementType::Float4,
            semantic: VertexSemantic::BlendWeights,
            semantic_index: 0,
            per_instance: true,
        });
        let decl = VertexDeclaration::new(elements);
        let inputs = [
            input("POSITION", VertexSemantic::Position, 0, 0),
            input("BLENDWEIGHT", VertexSemantic::BlendWeights, 0, 1),
        ];
        let layout = decl.input_layout(&inputs).unwrap();
        assert_eq!(layout.bindings.len(), 2);
        assert!(!layout.bindings[0].per_instance);
        assert!(layout.bindings[1].per_instance);
        assert_eq!(layout.bindings[1].stride, 16);
    }
}
