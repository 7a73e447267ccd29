//! Image subresource range arithmetic.
//!
//! A [`SubresourceRange`] is a rectangle in (array layer × mip level)
//! space. Layout tracking splits and merges these rectangles so that
//! every tracked piece carries exactly one layout.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn new(base_mip: u32, mip_count: u32, base_layer: u32, layer_count: u32) -> Self {
        Self {
            base_mip,
            mip_count,
            base_layer,
            layer_count,
        }
    }

    /// Every subresource of an image with the given dimensions.
    pub fn whole(mip_count: u32, layer_count: u32) -> Self {
        Self::new(0, mip_count, 0, layer_count)
    }

    pub fn single(mip: u32, layer: u32) -> Self {
        Self::new(mip, 1, layer, 1)
    }

    pub fn end_mip(&self) -> u32 {
        self.base_mip + self.mip_count
    }

    pub fn end_layer(&self) -> u32 {
        self.base_layer + self.layer_count
    }

    pub fn is_empty(&self) -> bool {
        self.mip_count == 0 || self.layer_count == 0
    }

    pub fn len(&self) -> usize {
        (self.mip_count * self.layer_count) as usize
    }

    /// Strict overlap: sharing an edge is not overlapping.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.base_layer < other.end_layer()
            && other.base_layer < self.end_layer()
            && self.base_mip < other.end_mip()
            && other.base_mip < self.end_mip()
    }

    pub fn contains(&self, other: &Self) -> bool {
        other.base_layer >= self.base_layer
            && other.end_layer() <= self.end_layer()
            && other.base_mip >= self.base_mip
            && other.end_mip() <= self.end_mip()
    }

    pub fn contains_subresource(&self, mip: u32, layer: u32) -> bool {
        (self.base_mip..self.end_mip()).contains(&mip)
            && (self.base_layer..self.end_layer()).contains(&layer)
    }

    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let base_mip = self.base_mip.max(other.base_mip);
        let base_layer = self.base_layer.max(other.base_layer);
        Some(Self::new(
            base_mip,
            self.end_mip().min(other.end_mip()) - base_mip,
            base_layer,
            self.end_layer().min(other.end_layer()) - base_layer,
        ))
    }

    /// `(mip, layer)` pairs, mip-major.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.base_mip..self.end_mip())
            .flat_map(move |mip| (self.base_layer..self.end_layer()).map(move |l| (mip, l)))
    }

    pub fn to_vk(&self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: self.base_mip,
            level_count: self.mip_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

/// Split the interval `[base, base + count)` by `[cut_base, cut_base +
/// cut_count)`. Pieces come back as `(base, count, inside_cut)`.
fn split_axis(base: u32, count: u32, cut_base: u32, cut_count: u32) -> Vec<(u32, u32, bool)> {
    let clamp = |v: i64| v.clamp(0, count as i64) as u32;
    let lo = clamp(cut_base as i64 - base as i64);
    let hi = clamp(cut_base as i64 + cut_count as i64 - base as i64);

    let mut pieces = Vec::with_capacity(3);
    if lo > 0 {
        pieces.push((base, lo, false));
    }
    if hi > lo {
        pieces.push((base + lo, hi - lo, true));
    }
    if hi < count {
        pieces.push((base + hi, count - hi, false));
    }
    if pieces.is_empty() {
        pieces.push((base, count, false));
    }
    pieces
}

/// Partition `to_cut` into at most five disjoint rectangles such that
/// each piece lies either fully inside or fully outside `cut_with`.
///
/// Layers are split first; only the layer band inside `cut_with` is split
/// again along mips. A range that does not overlap `cut_with` comes back
/// unchanged as the single piece.
pub fn cut_range(to_cut: SubresourceRange, cut_with: SubresourceRange) -> Vec<SubresourceRange> {
    let mut pieces = Vec::with_capacity(5);
    let bands = split_axis(
        to_cut.base_layer,
        to_cut.layer_count,
        cut_with.base_layer,
        cut_with.layer_count,
    );
    for (base_layer, layer_count, inside) in bands {
        let band = SubresourceRange {
            base_layer,
            layer_count,
            ..to_cut
        };
        if !inside {
            pieces.push(band);
            continue;
        }
        for (base_mip, mip_count, _) in split_axis(
            to_cut.base_mip,
            to_cut.mip_count,
            cut_with.base_mip,
            cut_with.mip_count,
        ) {
            pieces.push(SubresourceRange {
                base_mip,
                mip_count,
                ..band
            });
        }
    }
    pieces
}

/// Greedily merge a grid of per-subresource values into rectangles.
///
/// Scans `range` mip-major; from each unvisited cell the rectangle grows
/// across layers first and then across mips while every covered cell
/// holds the same value. Each subresource ends up in exactly one output
/// rectangle.
pub fn merge_uniform<L, F>(range: SubresourceRange, value_at: F) -> Vec<(SubresourceRange, L)>
where
    L: Copy + PartialEq,
    F: Fn(u32, u32) -> L,
{
    let layers = range.layer_count as usize;
    let mips = range.mip_count as usize;
    let mut visited = vec![false; layers * mips];
    let cell = |mip: usize, layer: usize| mip * layers + layer;
    let value = |mip: usize, layer: usize| {
        value_at(range.base_mip + mip as u32, range.base_layer + layer as u32)
    };

    let mut out = Vec::new();
    for mip in 0..mips {
        for layer in 0..layers {
            if visited[cell(mip, layer)] {
                continue;
            }
            let current = value(mip, layer);

            let mut layer_end = layer + 1;
            while layer_end < layers
                && !visited[cell(mip, layer_end)]
                && value(mip, layer_end) == current
            {
                layer_end += 1;
            }

            let mut mip_end = mip + 1;
            while mip_end < mips
                && (layer..layer_end)
                    .all(|l| !visited[cell(mip_end, l)] && value(mip_end, l) == current)
            {
                mip_end += 1;
            }

            for m in mip..mip_end {
                for l in layer..layer_end {
                    visited[cell(m, l)] = true;
                }
            }
            out.push((
                SubresourceRange::new(
                    range.base_mip + mip as u32,
                    (mip_end - mip) as u32,
                    range.base_layer + layer as u32,
                    (layer_end - layer) as u32,
                ),
                current,
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn assert_partition(whole: SubresourceRange, pieces: &[SubresourceRange]) {
        let mut seen = HashSet::new();
        for piece in pieces {
            assert!(!piece.is_empty(), "empty piece {piece:?}");
            assert!(whole.contains(piece), "{piece:?} escapes {whole:?}");
            for sub in piece.iter() {
                assert!(seen.insert(sub), "{sub:?} covered twice");
            }
        }
        assert_eq!(seen.len(), whole.len());
    }

    #[test]
    fn overlap_is_strict() {
        let a = SubresourceRange::new(0, 2, 0, 2);
        assert!(a.overlaps(&SubresourceRange::new(1, 4, 1, 1)));
        assert!(!a.overlaps(&SubresourceRange::new(2, 1, 0, 2)));
        assert!(!a.overlaps(&SubresourceRange::new(0, 2, 2, 1)));
        assert_eq!(
            a.intersection(&SubresourceRange::new(1, 4, 1, 3)),
            Some(SubresourceRange::new(1, 1, 1, 1))
        );
    }

    #[test]
    fn cut_from_the_middle_yields_five_pieces() {
        let to_cut = SubresourceRange::whole(5, 6);
        let cut_with = SubresourceRange::new(1, 2, 2, 2);
        let pieces = cut_range(to_cut, cut_with);
        assert_eq!(pieces.len(), 5);
        assert_partition(to_cut, &pieces);
        assert_eq!(
            pieces.iter().filter(|p| cut_with.contains(p)).count(),
            1,
            "exactly one piece is the overlap"
        );
        for piece in &pieces {
            assert!(cut_with.contains(piece) || !cut_with.overlaps(piece));
        }
    }

    #[test]
    fn disjoint_cut_returns_input() {
        let to_cut = SubresourceRange::new(0, 2, 0, 2);
        let pieces = cut_range(to_cut, SubresourceRange::new(0, 2, 4, 1));
        assert_eq!(pieces, [to_cut]);
    }

    #[test]
    fn covering_cut_returns_input() {
        let to_cut = SubresourceRange::new(1, 2, 3, 1);
        let pieces = cut_range(to_cut, SubresourceRange::whole(8, 8));
        assert_eq!(pieces, [to_cut]);
    }

    #[test]
    fn cutting_is_idempotent() {
        let to_cut = SubresourceRange::whole(4, 4);
        let cut_with = SubresourceRange::new(2, 2, 0, 3);
        for piece in cut_range(to_cut, cut_with) {
            assert_eq!(cut_range(piece, cut_with), [piece]);
        }
    }

    #[test]
    fn uniform_grid_merges_to_one_rect() {
        let range = SubresourceRange::whole(3, 6);
        let merged = merge_uniform(range, |_, _| 7u8);
        assert_eq!(merged, [(range, 7)]);
    }

    #[test]
    fn merge_covers_every_subresource_once() {
        let range = SubresourceRange::new(1, 4, 2, 3);
        let value = |mip: u32, layer: u32| (mip >= 3 && layer == 3) as u8;
        let merged = merge_uniform(range, value);
        let rects: Vec<_> = merged.iter().map(|(r, _)| *r).collect();
        assert_partition(range, &rects);
        for (rect, v) in &merged {
            assert!(rect.iter().all(|(m, l)| value(m, l) == *v));
        }
        assert!(merged.contains(&(SubresourceRange::new(3, 2, 3, 1), 1)));
    }

    #[test]
    fn checkerboard_does_not_merge() {
        let range = SubresourceRange::whole(2, 2);
        let merged = merge_uniform(range, |m, l| (m + l) % 2);
        assert_eq!(merged.len(), 4);
    }
}
