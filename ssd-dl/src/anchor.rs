//! Deterministic anchor (prior box) generation.

use crate::common::*;
use bbox::CyCxHw;

/// One feature-map level of the anchor grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Cells per side of the (square) feature map.
    pub feature_size: usize,
    /// Pixels per cell on the input image.
    pub step: usize,
    /// Base anchor size in pixels.
    pub min_size: f32,
    /// If set, adds a square anchor of size sqrt(min_size * max_size).
    pub max_size: Option<f32>,
    /// Aspect ratios beyond 1; each ratio contributes the ratio and its
    /// reciprocal.
    pub aspect_ratios: Vec<f32>,
}

impl LevelConfig {
    /// Anchors emitted at every cell of this level.
    pub fn anchors_per_cell(&self) -> usize {
        1 + self.max_size.iter().count() + 2 * self.aspect_ratios.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorGeneratorInit {
    /// Input image side length in pixels.
    pub image_size: usize,
    pub levels: Vec<LevelConfig>,
    /// Clamp anchor extents to the unit square.
    pub clip: bool,
}

impl AnchorGeneratorInit {
    pub fn build(self) -> Result<AnchorGenerator> {
        let Self {
            image_size,
            levels,
            clip,
        } = self;

        ensure!(image_size > 0, "image_size must be positive");
        ensure!(!levels.is_empty(), "at least one feature-map level is required");
        for (index, level) in levels.iter().enumerate() {
            ensure!(
                level.feature_size > 0 && level.step > 0,
                "level {}: feature_size and step must be positive",
                index
            );
            ensure!(
                level.min_size > 0.0,
                "level {}: min_size must be positive",
                index
            );
            if let Some(max_size) = level.max_size {
                ensure!(
                    max_size > level.min_size,
                    "level {}: max_size must exceed min_size",
                    index
                );
            }
            ensure!(
                level.aspect_ratios.iter().all(|&ratio| ratio > 0.0),
                "level {}: aspect ratios must be positive",
                index
            );
        }

        Ok(AnchorGenerator {
            image_size,
            levels,
            clip,
        })
    }
}

/// Produces the fixed anchor set for one input resolution.
///
/// The output ordering is the positional contract with the prediction
/// heads: levels in declared order, cells row-major within a level, and
/// within a cell the min-size square, the sqrt(min * max) square, then
/// one pair of boxes per aspect ratio.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    image_size: usize,
    levels: Vec<LevelConfig>,
    clip: bool,
}

impl AnchorGenerator {
    pub fn num_anchors(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.feature_size * level.feature_size * level.anchors_per_cell())
            .sum()
    }

    pub fn levels(&self) -> &[LevelConfig] {
        &self.levels
    }

    pub fn generate(&self) -> Vec<CyCxHw<f32>> {
        let image_size = self.image_size as f32;
        let mut anchors = Vec::with_capacity(self.num_anchors());

        for level in &self.levels {
            let step = level.step as f32 / image_size;
            let min_ratio = level.min_size / image_size;

            for (row, col) in iproduct!(0..level.feature_size, 0..level.feature_size) {
                let cy = (row as f32 + 0.5) * step;
                let cx = (col as f32 + 0.5) * step;

                let mut push = |h: f32, w: f32| {
                    let anchor = CyCxHw::try_new(cy, cx, h, w)
                        .expect("anchor sizes are validated at build time");
                    anchors.push(if self.clip { anchor.clamp_unit() } else { anchor });
                };

                push(min_ratio, min_ratio);
                if let Some(max_size) = level.max_size {
                    let prime = (min_ratio * max_size / image_size).sqrt();
                    push(prime, prime);
                }
                for &ratio in &level.aspect_ratios {
                    let sqrt_ratio = ratio.sqrt();
                    push(min_ratio / sqrt_ratio, min_ratio * sqrt_ratio);
                    push(min_ratio * sqrt_ratio, min_ratio / sqrt_ratio);
                }
            }
        }

        debug_assert_eq!(anchors.len(), self.num_anchors());
        anchors
    }
}
