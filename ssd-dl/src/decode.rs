//! Inference-time decoding of raw predictions into ranked detections.

use crate::{
    common::*,
    loss::{filter_negative_anchors, refine_anchors},
    prediction::{softmax_rows, HeadOutput, RefineOutput},
};
use bbox::{BoxTransform, CyCxHw, Tlbr};

/// One retained prediction, in image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: usize,
    pub score: R64,
    pub rect: Tlbr<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectionKey {
    pub class: usize,
    pub image: usize,
}

/// Detection lists for a full evaluation run, keyed by (class, image).
///
/// Pairs with no detections are not stored; lookups for them return an
/// empty list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TableEntry>", into = "Vec<TableEntry>")]
pub struct DetectionTable {
    entries: IndexMap<DetectionKey, Vec<Detection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableEntry {
    class: usize,
    image: usize,
    detections: Vec<Detection>,
}

impl From<Vec<TableEntry>> for DetectionTable {
    fn from(entries: Vec<TableEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| {
                let TableEntry {
                    class,
                    image,
                    detections,
                } = entry;
                (DetectionKey { class, image }, detections)
            })
            .collect();
        Self { entries }
    }
}

impl From<DetectionTable> for Vec<TableEntry> {
    fn from(table: DetectionTable) -> Self {
        table
            .entries
            .into_iter()
            .map(|(key, detections)| TableEntry {
                class: key.class,
                image: key.image,
                detections,
            })
            .collect()
    }
}

impl DetectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: usize, image: usize, detections: Vec<Detection>) {
        if detections.is_empty() {
            return;
        }
        self.entries
            .entry(DetectionKey { class, image })
            .or_insert_with(Vec::new)
            .extend(detections);
    }

    pub fn get(&self, class: usize, image: usize) -> &[Detection] {
        self.entries
            .get(&DetectionKey { class, image })
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn num_detections(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All detections of one class across images.
    pub fn detections_for_class(
        &self,
        class: usize,
    ) -> impl Iterator<Item = (usize, &Detection)> + '_ {
        self.entries
            .iter()
            .filter(move |(key, _)| key.class == class)
            .flat_map(|(key, detections)| {
                detections.iter().map(move |detection| (key.image, detection))
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionDecoderInit {
    /// Number of confidence columns, background included.
    pub num_classes: usize,
    pub confidence_thresh: f32,
    /// Maximum detections retained per image.
    pub top_k: usize,
    /// Refine variant only: ARM background-probability ceiling applied
    /// before decoding the ODM head.
    pub neg_anchor_thresh: f32,
    pub transform: BoxTransform<f32>,
}

impl DetectionDecoderInit {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            confidence_thresh: 0.01,
            top_k: 200,
            neg_anchor_thresh: 0.99,
            transform: BoxTransform::default(),
        }
    }

    pub fn build(self) -> Result<DetectionDecoder> {
        let Self {
            num_classes,
            confidence_thresh,
            top_k,
            neg_anchor_thresh,
            transform,
        } = self;

        ensure!(
            num_classes >= 2,
            "num_classes must cover background and at least one object class"
        );
        ensure!(
            confidence_thresh > 0.0 && confidence_thresh < 1.0,
            "confidence_thresh must be in (0, 1), got {}",
            confidence_thresh
        );
        ensure!(top_k >= 1, "top_k must be at least 1");
        ensure!(
            neg_anchor_thresh > 0.0 && neg_anchor_thresh <= 1.0,
            "neg_anchor_thresh must be in (0, 1], got {}",
            neg_anchor_thresh
        );

        Ok(DetectionDecoder {
            num_classes,
            confidence_thresh,
            top_k,
            neg_anchor_thresh,
            transform,
        })
    }
}

/// Converts one image's raw predictions into per-class, score-sorted
/// detection lists in pixel coordinates.
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    num_classes: usize,
    confidence_thresh: f32,
    top_k: usize,
    neg_anchor_thresh: f32,
    transform: BoxTransform<f32>,
}

impl DetectionDecoder {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Single-stage decode. The result is indexed by class; index 0
    /// (background) is always empty.
    pub fn decode(
        &self,
        prediction: &HeadOutput,
        anchors: &[CyCxHw<f32>],
        image_height: usize,
        image_width: usize,
    ) -> Result<Vec<Vec<Detection>>> {
        prediction.validate(anchors.len(), self.num_classes)?;

        let scores = softmax_rows(&prediction.conf.view());
        let mut per_class: Vec<Vec<Detection>> = vec![Vec::new(); self.num_classes];

        for class in 1..self.num_classes {
            let mut detections = Vec::new();
            for (anchor_ix, anchor) in anchors.iter().enumerate() {
                let score = scores[[anchor_ix, class]];
                if score <= self.confidence_thresh {
                    continue;
                }
                let row = prediction.loc.row(anchor_ix);
                let rect = self
                    .transform
                    .decode([row[0], row[1], row[2], row[3]], anchor)
                    .to_tlbr()
                    .scale_xy(image_width as f32, image_height as f32);
                detections.push(Detection {
                    class,
                    score: r64(score as f64),
                    rect,
                });
            }
            detections.sort_by_key(|detection| -detection.score);
            per_class[class] = detections;
        }

        Ok(cap_by_score(per_class, self.top_k))
    }

    /// Refine decode: ODM offsets are decoded from the ARM-refined
    /// anchors, after the same negative-anchor filter used in training
    /// (with the inference threshold).
    pub fn decode_refine(
        &self,
        prediction: &RefineOutput,
        anchors: &[CyCxHw<f32>],
        image_height: usize,
        image_width: usize,
    ) -> Result<Vec<Vec<Detection>>> {
        prediction.arm.validate(anchors.len(), 2)?;
        prediction.odm.validate(anchors.len(), self.num_classes)?;

        let refined = refine_anchors(&self.transform, &prediction.arm.loc.view(), anchors);
        let survivors =
            filter_negative_anchors(&prediction.arm.conf.view(), self.neg_anchor_thresh);

        let odm = prediction.odm.select_rows(&survivors);
        let odm_anchors: Vec<CyCxHw<f32>> = survivors.iter().map(|&ix| refined[ix]).collect();
        self.decode(&odm, &odm_anchors, image_height, image_width)
    }
}

/// Keep the `top_k` highest-scoring detections of one image, preserving
/// the per-class grouping and each class's score order.
fn cap_by_score(per_class: Vec<Vec<Detection>>, top_k: usize) -> Vec<Vec<Detection>> {
    let total: usize = per_class.iter().map(Vec::len).sum();
    if total <= top_k {
        return per_class;
    }

    let cutoff = {
        let mut scores: Vec<R64> = per_class
            .iter()
            .flatten()
            .map(|detection| detection.score)
            .collect();
        scores.sort_unstable_by_key(|&score| -score);
        scores[top_k - 1]
    };

    let mut remaining = top_k;
    per_class
        .into_iter()
        .map(|detections| {
            detections
                .into_iter()
                .filter(|detection| {
                    let keep = detection.score >= cutoff && remaining > 0;
                    if keep {
                        remaining -= 1;
                    }
                    keep
                })
                .collect()
        })
        .collect()
}
