//! Reassembly of images transmitted as independently delivered segments.
//!
//! Segments may arrive out of order, more than once, or interleaved with the
//! segments of other images on the same stream. Each image is tracked by a
//! [SegmentAssembler]; [SegmentedImages] multiplexes assemblers by image id.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ndarray::{s, Array2, ArrayView2};
use tracing::{debug, info};

use crate::{info::ImageInfo, Error, Result};

pub type ImageId = u16;

/// Shared view of per-segment completion.
///
/// Clones share the same flags, so an observer (e.g., a progress poller on another
/// thread) can hold one without owning the assembler.
#[derive(Debug, Clone)]
pub struct SegmentProgress {
    done: Arc<[AtomicBool]>,
}

impl SegmentProgress {
    fn new(num_segments: usize) -> Self {
        Self {
            done: (0..num_segments).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Mark `index` done, returning `true` if it was not already done.
    fn mark(&self, index: usize) -> bool {
        !self.done[index].swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.done.len()
    }

    #[must_use]
    pub fn is_done(&self, index: usize) -> bool {
        self.done
            .get(index)
            .is_some_and(|d| d.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.done
            .iter()
            .filter(|d| d.load(Ordering::Acquire))
            .count()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done.iter().all(|d| d.load(Ordering::Acquire))
    }
}

/// Assembles one image from `num_segments` tiles stacked vertically.
///
/// # Example
/// ```
/// use satproducts::segment::SegmentAssembler;
///
/// let mut img = SegmentAssembler::new(2, 4, 1, 42);
/// let progress = img.progress();
///
/// img.push_segment(&[2u8; 4], 1).unwrap();
/// assert!(!progress.is_complete());
/// img.push_segment(&[1u8; 4], 0).unwrap();
/// assert!(progress.is_complete());
/// assert_eq!(img.mosaic()[[1, 0]], 2);
/// ```
#[derive(Debug)]
pub struct SegmentAssembler {
    image_id: ImageId,
    segment_width: usize,
    segment_height: usize,
    progress: SegmentProgress,
    mosaic: Array2<u8>,
    pub info: ImageInfo,
}

impl SegmentAssembler {
    #[must_use]
    pub fn new(
        num_segments: usize,
        segment_width: usize,
        segment_height: usize,
        image_id: ImageId,
    ) -> Self {
        Self {
            image_id,
            segment_width,
            segment_height,
            progress: SegmentProgress::new(num_segments),
            mosaic: Array2::zeros((num_segments * segment_height, segment_width)),
            info: ImageInfo::default(),
        }
    }

    #[must_use]
    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.progress.total()
    }

    #[must_use]
    pub fn segment_width(&self) -> usize {
        self.segment_width
    }

    #[must_use]
    pub fn segment_height(&self) -> usize {
        self.segment_height
    }

    /// Handle to the completion flags that can be polled independently.
    #[must_use]
    pub fn progress(&self) -> SegmentProgress {
        self.progress.clone()
    }

    #[must_use]
    pub fn mosaic(&self) -> ArrayView2<u8> {
        self.mosaic.view()
    }

    #[must_use]
    pub fn into_mosaic(self) -> Array2<u8> {
        self.mosaic
    }

    /// Write segment `index` into the mosaic.
    ///
    /// Returns `Ok(false)` if the segment was ignored, because `index` is out of
    /// range or the segment was already received.
    ///
    /// # Errors
    /// [Error::SegmentContract] if `data` is not exactly one tile.
    pub fn push_segment(&mut self, data: &[u8], index: usize) -> Result<bool> {
        if index >= self.num_segments() {
            debug!(image_id = self.image_id, segment = index, "segment out of range; ignoring");
            return Ok(false);
        }
        if self.progress.is_done(index) {
            debug!(image_id = self.image_id, segment = index, "duplicate segment; ignoring");
            return Ok(false);
        }
        let tile_len = self.segment_width * self.segment_height;
        if data.len() != tile_len {
            return Err(Error::SegmentContract(format!(
                "image {} segment {index} has {} bytes, expected {tile_len}",
                self.image_id,
                data.len()
            )));
        }

        let start = index * self.segment_height;
        let tile = ArrayView2::from_shape((self.segment_height, self.segment_width), data)
            .map_err(|err| Error::SegmentContract(err.to_string()))?;
        self.mosaic
            .slice_mut(s![start..start + self.segment_height, ..])
            .assign(&tile);
        self.progress.mark(index);

        Ok(true)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }

    /// Check that a segment described by the given geometry belongs to this image.
    ///
    /// # Errors
    /// [Error::SegmentContract] if the count, tile size, or id differ.
    pub fn check_layout(&self, header: &SegmentHeader) -> Result<()> {
        if header.image_id != self.image_id
            || header.num_segments != self.num_segments()
            || header.segment_width != self.segment_width
            || header.segment_height != self.segment_height
        {
            return Err(Error::SegmentContract(format!(
                "image {} is {}x{}x{}, got segment header {header:?}",
                self.image_id,
                self.num_segments(),
                self.segment_width,
                self.segment_height,
            )));
        }
        Ok(())
    }
}

/// Describes where a segment belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub image_id: ImageId,
    pub index: usize,
    pub num_segments: usize,
    pub segment_width: usize,
    pub segment_height: usize,
}

/// Tracks any number of concurrently in-flight segmented images on one stream.
///
/// The ids of the last [SegmentedImages::RECENTLY_COMPLETED] finished images are
/// remembered, and late retransmissions of their segments are ignored. A segment
/// for a remembered id with a different layout starts a new image.
///
/// # Example
/// ```
/// use satproducts::segment::{SegmentHeader, SegmentedImages};
///
/// let mut images = SegmentedImages::default();
/// let header = SegmentHeader {
///     image_id: 7,
///     index: 0,
///     num_segments: 1,
///     segment_width: 2,
///     segment_height: 2,
/// };
/// let done = images.push(&header, &[1, 2, 3, 4]).unwrap().unwrap();
/// assert_eq!(done.image_id(), 7);
/// assert!(images.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SegmentedImages {
    assemblers: HashMap<ImageId, SegmentAssembler>,
    completed: VecDeque<SegmentHeader>,
}

impl SegmentedImages {
    pub const RECENTLY_COMPLETED: usize = 16;

    fn completed_position(&self, header: &SegmentHeader) -> Option<usize> {
        self.completed
            .iter()
            .position(|done| done.image_id == header.image_id)
    }

    /// Push a segment, returning the finished image once its last segment arrives.
    ///
    /// # Errors
    /// [Error::SegmentContract] if the segment's geometry differs from the in-flight
    /// image with the same id, or the data is not exactly one tile.
    pub fn push(
        &mut self,
        header: &SegmentHeader,
        data: &[u8],
    ) -> Result<Option<SegmentAssembler>> {
        if !self.assemblers.contains_key(&header.image_id) {
            if let Some(pos) = self.completed_position(header) {
                let done = self.completed[pos];
                if (done.num_segments, done.segment_width, done.segment_height)
                    == (header.num_segments, header.segment_width, header.segment_height)
                {
                    debug!(image_id = header.image_id, segment = header.index, "image already complete; ignoring");
                    return Ok(None);
                }
                self.completed.remove(pos);
            }
        }

        let assembler = self.assemblers.entry(header.image_id).or_insert_with(|| {
            debug!(image_id = header.image_id, segments = header.num_segments, "new segmented image");
            SegmentAssembler::new(
                header.num_segments,
                header.segment_width,
                header.segment_height,
                header.image_id,
            )
        });
        assembler.check_layout(header)?;
        assembler.push_segment(data, header.index)?;

        if !assembler.is_complete() {
            return Ok(None);
        }
        info!(image_id = header.image_id, "segmented image complete");
        if self.completed.len() >= Self::RECENTLY_COMPLETED {
            self.completed.pop_front();
        }
        self.completed.push_back(*header);
        Ok(self.assemblers.remove(&header.image_id))
    }

    /// Access an in-flight image, e.g., to set its [ImageInfo].
    pub fn get_mut(&mut self, image_id: ImageId) -> Option<&mut SegmentAssembler> {
        self.assemblers.get_mut(&image_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assemblers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assemblers.is_empty()
    }

    /// Remove and return all images still waiting on segments.
    pub fn drain_incomplete(&mut self) -> Vec<SegmentAssembler> {
        self.assemblers.drain().map(|(_, a)| a).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn completes_only_after_all_segments() {
        let mut img = SegmentAssembler::new(3, 2, 2, 1);
        for (n, idx) in [2, 0, 1].into_iter().enumerate() {
            assert!(!img.is_complete());
            assert!(img.push_segment(&[idx as u8; 4], idx).unwrap());
            assert_eq!(img.progress().completed(), n + 1);
        }
        assert!(img.is_complete());

        let mosaic = img.into_mosaic();
        assert_eq!(mosaic.dim(), (6, 2));
        for row in 0..6 {
            assert_eq!(mosaic[[row, 0]], (row / 2) as u8);
        }
    }

    #[test]
    fn duplicate_and_out_of_range_are_ignored() {
        let mut img = SegmentAssembler::new(2, 2, 1, 1);
        assert!(img.push_segment(&[5, 5], 0).unwrap());
        assert!(!img.push_segment(&[9, 9], 0).unwrap());
        assert!(!img.push_segment(&[9, 9], 2).unwrap());
        assert_eq!(img.mosaic().row(0).to_vec(), vec![5, 5]);
        assert_eq!(img.progress().completed(), 1);
        assert!(!img.is_complete());
    }

    #[test]
    fn wrong_tile_size_is_fatal() {
        let mut img = SegmentAssembler::new(2, 2, 1, 1);
        let zult = img.push_segment(&[1, 2, 3], 0);
        assert!(matches!(zult, Err(Error::SegmentContract(_))), "got {zult:?}");
        assert!(!img.progress().is_done(0));
    }

    #[test]
    fn ignored_segments_are_not_validated() {
        let mut img = SegmentAssembler::new(2, 2, 1, 1);
        assert!(!img.push_segment(&[1, 2, 3], 5).unwrap());
        assert!(img.push_segment(&[1, 2], 0).unwrap());
        assert!(!img.push_segment(&[], 0).unwrap());
        assert_eq!(img.mosaic().row(0).to_vec(), vec![1, 2]);
    }

    #[test]
    fn progress_is_shared_across_threads() {
        let mut img = SegmentAssembler::new(4, 1, 1, 1);
        let progress = img.progress();

        let observer = thread::spawn(move || {
            while !progress.is_complete() {
                thread::yield_now();
            }
            progress.completed()
        });

        for idx in 0..4 {
            img.push_segment(&[1], idx).unwrap();
        }
        assert_eq!(observer.join().unwrap(), 4);
    }

    fn header(image_id: ImageId, index: usize) -> SegmentHeader {
        SegmentHeader {
            image_id,
            index,
            num_segments: 2,
            segment_width: 1,
            segment_height: 1,
        }
    }

    #[test]
    fn multiplexes_by_image_id() {
        let mut images = SegmentedImages::default();
        assert!(images.push(&header(1, 0), &[1]).unwrap().is_none());
        assert!(images.push(&header(2, 1), &[2]).unwrap().is_none());
        assert_eq!(images.len(), 2);

        let done = images.push(&header(2, 0), &[3]).unwrap().unwrap();
        assert_eq!(done.image_id(), 2);
        assert_eq!(done.mosaic().column(0).to_vec(), vec![3, 2]);
        assert_eq!(images.len(), 1);

        let incomplete = images.drain_incomplete();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].image_id(), 1);
    }

    #[test]
    fn retransmission_after_completion_is_ignored() {
        let mut images = SegmentedImages::default();
        images.push(&header(3, 0), &[1]).unwrap();
        assert!(images.push(&header(3, 1), &[2]).unwrap().is_some());

        assert!(images.push(&header(3, 1), &[9]).unwrap().is_none());
        assert!(images.push(&header(3, 0), &[9]).unwrap().is_none());
        assert!(images.is_empty());

        // same id with a new layout is a new image
        let mut reused = header(3, 0);
        reused.num_segments = 1;
        let done = images.push(&reused, &[7]).unwrap().unwrap();
        assert_eq!(done.mosaic()[[0, 0]], 7);
    }

    #[test]
    fn completed_ids_are_bounded() {
        let mut images = SegmentedImages::default();
        let total = SegmentedImages::RECENTLY_COMPLETED as u16 + 1;
        for id in 0..total {
            images.push(&header(id, 0), &[1]).unwrap();
            assert!(images.push(&header(id, 1), &[1]).unwrap().is_some());
        }
        assert_eq!(images.completed.len(), SegmentedImages::RECENTLY_COMPLETED);

        // oldest id was forgotten, so it starts over
        assert!(images.push(&header(0, 0), &[1]).unwrap().is_none());
        assert_eq!(images.len(), 1);
        assert!(images.push(&header(total - 1, 0), &[1]).unwrap().is_none());
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn changed_geometry_is_fatal() {
        let mut images = SegmentedImages::default();
        images.push(&header(1, 0), &[1]).unwrap();

        let mut changed = header(1, 1);
        changed.segment_width = 2;
        let zult = images.push(&changed, &[1, 1]);
        assert!(matches!(zult, Err(Error::SegmentContract(_))), "got {zult:?}");

        let mut changed = header(1, 1);
        changed.num_segments = 3;
        assert!(images.push(&changed, &[1]).is_err());

        // original image is still intact
        assert!(images.push(&header(1, 1), &[2]).unwrap().is_some());
    }
}
