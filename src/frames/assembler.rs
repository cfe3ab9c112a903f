//! Frame assembler.
//!
//! The camera hands back one flat buffer per start: `kinFrames` row-major
//! blocks of `height x width` pixels back to back. [`reshape`] splits that
//! buffer into frames; [`append_shot`] stacks a new shot under the previous
//! ones along the row axis, one stack per kinetic index. [`RawFrameSet`] keeps
//! those stacks for the lifetime of one acquisition loop.

use crate::error::{CamError, CamResult};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

/// Split `buffer` into `frame_count` frames of `height` rows by `width` columns.
pub fn reshape(
    buffer: &[i32],
    frame_count: usize,
    width: usize,
    height: usize,
) -> CamResult<Vec<Array2<i32>>> {
    let frame_len = width * height;
    let expected = frame_count * frame_len;
    if buffer.len() != expected {
        return Err(CamError::Shape(format!(
            "buffer holds {} pixels, expected {frame_count} x {height} x {width} = {expected}",
            buffer.len()
        )));
    }
    if frame_len == 0 {
        return Err(CamError::Shape(format!(
            "frame size {height} x {width} is empty"
        )));
    }

    buffer
        .chunks_exact(frame_len)
        .map(|chunk| {
            Array2::from_shape_vec((height, width), chunk.to_vec())
                .map_err(|e| CamError::Shape(e.to_string()))
        })
        .collect()
}

/// Inverse of [`reshape`]: concatenate frames in order, each row-major.
pub fn flatten(frames: &[Array2<i32>]) -> Vec<i32> {
    let total = frames.iter().map(Array2::len).sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        out.extend(frame.iter().copied());
    }
    out
}

/// Row-concatenate each frame of `new` under the same-indexed frame of `existing`.
///
/// An empty `existing` is the first shot of a loop and yields `new` unchanged.
pub fn append_shot(
    existing: &[Array2<i32>],
    new: &[Array2<i32>],
) -> CamResult<Vec<Array2<i32>>> {
    if existing.is_empty() {
        return Ok(new.to_vec());
    }
    if existing.len() != new.len() {
        return Err(CamError::Shape(format!(
            "shot has {} kinetic frames, previous shots had {}",
            new.len(),
            existing.len()
        )));
    }

    existing
        .iter()
        .zip(new)
        .enumerate()
        .map(|(index, (stack, frame))| {
            if stack.ncols() != frame.ncols() {
                return Err(CamError::Shape(format!(
                    "kinetic frame {index} has {} columns, stack has {}",
                    frame.ncols(),
                    stack.ncols()
                )));
            }
            concatenate(Axis(0), &[stack.view(), frame.view()])
                .map_err(|e| CamError::Shape(e.to_string()))
        })
        .collect()
}

/// Raw frames of one acquisition loop, indexed `[shot][kinetic]`.
///
/// Stored as one stacked array per kinetic index, shots growing the row axis,
/// which is also the layout written to disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrameSet {
    stacks: Vec<Array2<i32>>,
    frame_height: usize,
    shots: usize,
}

impl RawFrameSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one shot's kinetic frames.
    pub fn push_shot(&mut self, frames: Vec<Array2<i32>>) -> CamResult<()> {
        let height = frames.first().map(Array2::nrows).unwrap_or(0);
        if frames.iter().any(|f| f.nrows() != height) {
            return Err(CamError::Shape(
                "kinetic frames of one shot differ in height".to_string(),
            ));
        }
        if self.shots > 0 && height != self.frame_height {
            return Err(CamError::Shape(format!(
                "shot frames have {height} rows, previous shots had {}",
                self.frame_height
            )));
        }

        self.stacks = append_shot(&self.stacks, &frames)?;
        self.frame_height = height;
        self.shots += 1;
        Ok(())
    }

    /// Number of shots collected.
    pub fn shot_count(&self) -> usize {
        self.shots
    }

    /// Number of kinetic frames per shot.
    pub fn kinetic_count(&self) -> usize {
        self.stacks.len()
    }

    /// Total frames collected.
    pub fn frame_count(&self) -> usize {
        self.shots * self.stacks.len()
    }

    /// True before the first shot.
    pub fn is_empty(&self) -> bool {
        self.shots == 0
    }

    /// `(rows, cols)` of a single frame.
    pub fn frame_shape(&self) -> Option<(usize, usize)> {
        self.stacks
            .first()
            .map(|stack| (self.frame_height, stack.ncols()))
    }

    /// Stacked arrays, one per kinetic index.
    pub fn stacks(&self) -> &[Array2<i32>] {
        &self.stacks
    }

    /// View of the frame taken at `shot`, kinetic index `kinetic`.
    pub fn frame(&self, shot: usize, kinetic: usize) -> Option<ArrayView2<'_, i32>> {
        if shot >= self.shots {
            return None;
        }
        let stack = self.stacks.get(kinetic)?;
        let start = shot * self.frame_height;
        Some(stack.slice(s![start..start + self.frame_height, ..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reshape_splits_in_frame_order() {
        let buffer: Vec<i32> = (0..12).collect();
        let frames = reshape(&buffer, 2, 3, 2).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], array![[0, 1, 2], [3, 4, 5]]);
        assert_eq!(frames[1], array![[6, 7, 8], [9, 10, 11]]);
    }

    #[test]
    fn reshape_rejects_wrong_length() {
        let err = reshape(&[1, 2, 3], 2, 1, 1).unwrap_err();
        assert!(matches!(err, CamError::Shape(_)));
    }

    #[test]
    fn flatten_round_trips() {
        let frames = vec![array![[1, 2], [3, 4], [5, 6]], array![[7, 8], [9, 10], [11, 12]]];
        let flat = flatten(&frames);
        assert_eq!(reshape(&flat, 2, 2, 3).unwrap(), frames);
    }

    #[test]
    fn append_shot_rejects_column_mismatch() {
        let existing = vec![Array2::<i32>::zeros((2, 3))];
        let new = vec![Array2::<i32>::zeros((2, 4))];
        assert!(matches!(
            append_shot(&existing, &new),
            Err(CamError::Shape(_))
        ));
    }

    #[test]
    fn three_shots_stack_along_rows() {
        let mut set = RawFrameSet::new();
        for shot in 0..3 {
            set.push_shot(vec![Array2::from_elem((100, 100), shot)]).unwrap();
        }
        assert_eq!(set.shot_count(), 3);
        assert_eq!(set.kinetic_count(), 1);
        assert_eq!(set.stacks()[0].dim(), (300, 100));
        assert_eq!(set.frame_shape(), Some((100, 100)));
        let second = set.frame(1, 0).unwrap();
        assert!(second.iter().all(|v| *v == 1));
        assert!(set.frame(3, 0).is_none());
    }

    #[test]
    fn frames_are_indexed_by_shot_then_kinetic() {
        let mut set = RawFrameSet::new();
        set.push_shot(vec![array![[1]], array![[2]]]).unwrap();
        set.push_shot(vec![array![[3]], array![[4]]]).unwrap();
        assert_eq!(set.frame(0, 1).unwrap()[[0, 0]], 2);
        assert_eq!(set.frame(1, 0).unwrap()[[0, 0]], 3);
        assert_eq!(set.frame_count(), 4);
    }
}
