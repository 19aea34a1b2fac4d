//! Batch sources feeding the training loop.

use crate::common::*;
use rand::prelude::*;

/// Identity and pixel dimensions of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub index: usize,
    pub height: usize,
    pub width: usize,
}

/// One batch of images and their ground truth. Images within a batch
/// may carry differing numbers of boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingBatch {
    pub images: Vec<ImageInfo>,
    pub targets: Vec<Vec<GroundTruth>>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Yields training batches; `restart` begins a new pass without
/// touching any state derived elsewhere.
pub trait BatchSource {
    fn num_images(&self) -> usize;
    fn next_batch(&mut self, batch_size: usize) -> Option<TrainingBatch>;
    fn restart(&mut self);
}

/// One label row: a box of `class` on image `image`, corners in ratio
/// units. A row with class 0 registers the image without a box.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LabelRecord {
    image: usize,
    width: usize,
    height: usize,
    class: usize,
    t: f32,
    l: f32,
    b: f32,
    r: f32,
}

/// Labeled boxes loaded from a CSV file, grouped per image.
#[derive(Debug, Clone)]
pub struct CsvDataset {
    images: Vec<ImageInfo>,
    targets: Vec<Vec<GroundTruth>>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
}

impl CsvDataset {
    pub fn open<P>(label_file: P, shuffle: bool) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let mut reader = csv::Reader::from_path(label_file.as_ref()).with_context(|| {
            format!("failed to open label file '{}'", label_file.as_ref().display())
        })?;

        let mut by_image: Vec<(ImageInfo, Vec<GroundTruth>)> = Vec::new();
        for result in reader.deserialize() {
            let record: LabelRecord = result?;
            let LabelRecord {
                image,
                width,
                height,
                class,
                t,
                l,
                b,
                r,
            } = record;
            ensure!(
                width > 0 && height > 0,
                "image {} has non-positive dimensions",
                image
            );

            let slot_index = match by_image.iter().position(|(info, _)| info.index == image) {
                Some(position) => {
                    let info = by_image[position].0;
                    ensure!(
                        info.height == height && info.width == width,
                        "image {} has inconsistent dimensions across rows",
                        image
                    );
                    position
                }
                None => {
                    by_image.push((
                        ImageInfo {
                            index: image,
                            height,
                            width,
                        },
                        Vec::new(),
                    ));
                    by_image.len() - 1
                }
            };
            let slot = &mut by_image[slot_index].1;

            if class != ssd_dl::label::BACKGROUND_CLASS {
                let rect = Tlbr::try_new(t, l, b, r)
                    .with_context(|| format!("invalid box on image {}", image))?;
                slot.push(GroundTruth::try_new(rect, class)?);
            }
        }
        ensure!(!by_image.is_empty(), "label file contains no images");

        by_image.sort_by_key(|(info, _)| info.index);
        let (images, targets): (Vec<ImageInfo>, Vec<Vec<GroundTruth>>) =
            by_image.into_iter().unzip();
        let order = (0..images.len()).collect();

        Ok(Self {
            images,
            targets,
            order,
            cursor: 0,
            shuffle,
        })
    }

    pub fn targets(&self) -> &[Vec<GroundTruth>] {
        &self.targets
    }
}

impl BatchSource for CsvDataset {
    fn num_images(&self) -> usize {
        self.images.len()
    }

    fn next_batch(&mut self, batch_size: usize) -> Option<TrainingBatch> {
        if self.cursor >= self.order.len() || batch_size == 0 {
            return None;
        }
        let end = (self.cursor + batch_size).min(self.order.len());
        let picks = &self.order[self.cursor..end];
        let batch = TrainingBatch {
            images: picks.iter().map(|&ix| self.images[ix]).collect(),
            targets: picks.iter().map(|&ix| self.targets[ix].clone()).collect(),
        };
        self.cursor = end;
        Some(batch)
    }

    fn restart(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut rand::thread_rng());
        }
    }
}
