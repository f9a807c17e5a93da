use std::collections::VecDeque;

use crate::frame::Frame;

/// Client frames held back while the upstream socket is not yet open.
///
/// Frames come out of [`drain`](Self::drain) in exactly the order they were
/// pushed. Once drained the buffer stays empty for the rest of the session;
/// the session forwards directly from then on.
#[derive(Debug, Default)]
pub struct PreOpenBuffer {
    frames: VecDeque<Frame>,
    bytes: usize,
}

impl PreOpenBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.bytes += frame.len();
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total payload bytes currently held.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Remove every frame, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.bytes = 0;
        self.frames.drain(..)
    }
}
