use crate::error::{HsslError, Result};
use burn::data::dataset::Dataset;
use ndarray::{s, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// One tissue section: an RGB image, its segmentation and per-segment counts.
#[derive(Debug, Clone)]
pub struct Slide {
    image: Array3<u8>,
    label: Array2<u32>,
    counts: Array2<f32>,
    /// Indexed by label id; true for background and for segments whose
    /// count row is all zeros.
    zero_ids: Vec<bool>,
}

impl Slide {
    /// `image` is (H, W, 3), `label` is (H, W) and `counts` is (N, G) with
    /// row `i` holding the counts of label id `i + 1`.
    pub fn new(image: Array3<u8>, label: Array2<u32>, counts: Array2<f32>) -> Result<Self> {
        let (height, width, channels) = image.dim();
        if channels != 3 {
            return Err(HsslError::DimensionMismatch {
                what: "image channels",
                expected: vec![3],
                found: vec![channels],
            });
        }
        if label.dim() != (height, width) {
            return Err(HsslError::DimensionMismatch {
                what: "label size",
                expected: vec![height, width],
                found: vec![label.nrows(), label.ncols()],
            });
        }
        let max_label = label.iter().copied().max().unwrap_or(0) as usize;
        if max_label > counts.nrows() {
            return Err(HsslError::DimensionMismatch {
                what: "count rows for label ids",
                expected: vec![max_label],
                found: vec![counts.nrows()],
            });
        }

        let mut zero_ids = Vec::with_capacity(counts.nrows() + 1);
        zero_ids.push(true);
        zero_ids.extend(counts.rows().into_iter().map(|row| row.sum() == 0.0));

        Ok(Self {
            image,
            label,
            counts,
            zero_ids,
        })
    }

    pub fn height(&self) -> usize {
        self.label.nrows()
    }

    pub fn width(&self) -> usize {
        self.label.ncols()
    }

    pub fn num_segments(&self) -> usize {
        self.counts.nrows()
    }

    pub fn num_genes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn image(&self) -> &Array3<u8> {
        &self.image
    }

    pub fn label(&self) -> &Array2<u32> {
        &self.label
    }

    pub fn counts(&self) -> &Array2<f32> {
        &self.counts
    }

    /// Label ids treated as background when clearing truncated segments.
    pub fn zero_ids(&self) -> BTreeSet<u32> {
        self.zero_ids
            .iter()
            .enumerate()
            .filter(|(_, zero)| **zero)
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// Extract the patch whose top-left corner is `(top, left)`.
    ///
    /// Returns `None` if the window leaves the slide or if no segment with
    /// counts is fully visible inside it.
    pub fn patch_at(&self, top: usize, left: usize, [height, width]: [usize; 2]) -> Option<Patch> {
        if top + height > self.height() || left + width > self.width() {
            return None;
        }

        let mut label = self
            .label
            .slice(s![top..top + height, left..left + width])
            .to_owned();
        clear_truncated(&mut label, &self.zero_ids);

        let mut ids: BTreeSet<u32> = label.iter().copied().collect();
        ids.insert(0);
        let ids: Vec<u32> = ids.into_iter().collect();
        let rows: Vec<usize> = ids[1..].iter().map(|&id| id as usize - 1).collect();
        if rows.is_empty() {
            return None;
        }

        let counts = self.counts.select(ndarray::Axis(0), &rows);
        let label = label.mapv(|id| ids.binary_search(&id).unwrap_or_else(|pos| pos) as i64);
        let image = self
            .image
            .slice(s![top..top + height, left..left + width, ..])
            .permuted_axes([2, 0, 1])
            .mapv(|v| v as f32 / 255.0 * 2.0 - 1.0);

        Some(Patch {
            image,
            label,
            counts,
            kind: PatchKind::SpatialTranscriptomics,
        })
    }
}

/// Zero every label pixel that is reachable from the crop border without
/// crossing a background or zero-count pixel.
///
/// This is the complement of the hole fill of the zero-id mask under
/// 4-connectivity: segments cut by the border are removed, fully enclosed
/// segments survive.
fn clear_truncated(label: &mut Array2<u32>, zero_ids: &[bool]) {
    let (height, width) = label.dim();
    let is_zero = |id: u32| zero_ids.get(id as usize).copied().unwrap_or(false);
    let mut reached = Array2::from_elem((height, width), false);
    let mut stack = Vec::new();

    for y in 0..height {
        for x in 0..width {
            let border = y == 0 || x == 0 || y + 1 == height || x + 1 == width;
            if border && !is_zero(label[[y, x]]) {
                reached[[y, x]] = true;
                stack.push((y, x));
            }
        }
    }

    while let Some((y, x)) = stack.pop() {
        let neighbours = [
            (y.wrapping_sub(1), x),
            (y + 1, x),
            (y, x.wrapping_sub(1)),
            (y, x + 1),
        ];
        for (ny, nx) in neighbours {
            if ny < height && nx < width && !reached[[ny, nx]] && !is_zero(label[[ny, nx]]) {
                reached[[ny, nx]] = true;
                stack.push((ny, nx));
            }
        }
    }

    ndarray::Zip::from(label)
        .and(&reached)
        .for_each(|id, &reached| {
            if reached {
                *id = 0;
            }
        });
}

/// Tag describing the modality a patch was drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    SpatialTranscriptomics,
}

/// A training example cut from a [`Slide`].
#[derive(Debug, Clone)]
pub struct Patch {
    /// (3, h, w) in [-1, 1].
    pub image: Array3<f32>,
    /// (h, w) dense segment ranks, 0 = background.
    pub label: Array2<i64>,
    /// (k, G) counts of segments 1..=k.
    pub counts: Array2<f32>,
    pub kind: PatchKind,
}

impl Patch {
    pub fn num_segments(&self) -> usize {
        self.counts.nrows()
    }
}

/// Slide and patch dimensions a sampler positions patches within.
#[derive(Debug, Clone, Copy)]
pub struct PatchGeometry {
    pub height: usize,
    pub width: usize,
    pub patch: [usize; 2],
}

/// Strategy mapping dataset indices to patch positions.
pub trait PatchSampler: Send + Sync {
    /// Top-left corner of the patch for `idx`.
    fn position(&self, idx: usize, geometry: &PatchGeometry) -> (usize, usize);

    fn len(&self, geometry: &PatchGeometry) -> usize;
}

/// Uniformly random positions; `epoch_size` indices per epoch.
#[derive(Debug)]
pub struct RandomPatches {
    epoch_size: usize,
    rng: Mutex<StdRng>,
}

impl RandomPatches {
    pub fn new(epoch_size: usize, seed: u64) -> Self {
        Self {
            epoch_size,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl PatchSampler for RandomPatches {
    fn position(&self, _idx: usize, geometry: &PatchGeometry) -> (usize, usize) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let top = rng.gen_range(0..=geometry.height - geometry.patch[0]);
        let left = rng.gen_range(0..=geometry.width - geometry.patch[1]);
        (top, left)
    }

    fn len(&self, _geometry: &PatchGeometry) -> usize {
        self.epoch_size
    }
}

/// Non-overlapping row-major grid of patches.
#[derive(Debug, Default, Clone, Copy)]
pub struct GridPatches;

impl PatchSampler for GridPatches {
    fn position(&self, idx: usize, geometry: &PatchGeometry) -> (usize, usize) {
        let cols = geometry.width / geometry.patch[1];
        let row = idx / cols;
        let col = idx % cols;
        (row * geometry.patch[0], col * geometry.patch[1])
    }

    fn len(&self, geometry: &PatchGeometry) -> usize {
        (geometry.height / geometry.patch[0]) * (geometry.width / geometry.patch[1])
    }
}

/// Patches of one slide, skipping windows without a visible segment.
#[derive(Debug)]
pub struct PatchDataset<S> {
    slide: Arc<Slide>,
    geometry: PatchGeometry,
    sampler: S,
}

impl<S: PatchSampler> PatchDataset<S> {
    pub fn new(slide: Arc<Slide>, patch: [usize; 2], sampler: S) -> Result<Self> {
        if patch[0] == 0 || patch[1] == 0 || patch[0] > slide.height() || patch[1] > slide.width() {
            return Err(HsslError::DimensionMismatch {
                what: "patch size within slide",
                expected: vec![slide.height(), slide.width()],
                found: patch.to_vec(),
            });
        }
        let geometry = PatchGeometry {
            height: slide.height(),
            width: slide.width(),
            patch,
        };
        Ok(Self {
            slide,
            geometry,
            sampler,
        })
    }

    pub fn slide(&self) -> &Slide {
        &self.slide
    }
}

impl<S: PatchSampler> Dataset<Patch> for PatchDataset<S> {
    /// The patch for `index`, or for the next index that yields one.
    ///
    /// Every index is tried at most once, so a slide without any fully
    /// visible segment gives `None` rather than looping.
    fn get(&self, index: usize) -> Option<Patch> {
        let len = self.sampler.len(&self.geometry);
        if index >= len {
            return None;
        }
        (0..len).find_map(|attempt| {
            let idx = (index + attempt) % len;
            let (top, left) = self.sampler.position(idx, &self.geometry);
            self.slide.patch_at(top, left, self.geometry.patch)
        })
    }

    fn len(&self) -> usize {
        self.sampler.len(&self.geometry)
    }
}
