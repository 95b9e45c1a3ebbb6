//! Per-stream progress accounting for a shared device buffer window.
//!
//! A device serving several streams can only advance its write pointer once
//! every attached stream has covered the frames in question. Each entry
//! tracks how far into the current window one stream has written (playback)
//! or read (capture); the device commits the minimum and everyone's count
//! drops by the committed amount.

/// Tracks per-id offsets into the current buffer window.
pub struct BufferShare {
    window_frames: u32,
    entries: Vec<Entry>,
}

struct Entry {
    id: u32,
    offset: u32,
}

impl BufferShare {
    pub fn new(window_frames: u32) -> Self {
        Self {
            window_frames,
            entries: Vec::new(),
        }
    }

    pub fn window_frames(&self) -> u32 {
        self.window_frames
    }

    pub fn add_id(&mut self, id: u32) {
        if self.entries.iter().any(|e| e.id == id) {
            return;
        }
        self.entries.push(Entry { id, offset: 0 });
    }

    pub fn rm_id(&mut self, id: u32) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `id` has covered `offset` frames of the current window.
    /// Offsets are clamped to the window size.
    pub fn set_frames(&mut self, id: u32, offset: u32) {
        let window = self.window_frames;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.offset = offset.min(window);
        }
    }

    pub fn frames(&self, id: u32) -> u32 {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.offset)
            .unwrap_or(0)
    }

    /// Frames every id has covered; how far the device may advance.
    pub fn min_frames(&self) -> u32 {
        self.entries
            .iter()
            .map(|e| e.offset)
            .min()
            .unwrap_or(0)
    }

    /// Advance the window by `frames`, reducing every entry.
    pub fn advance(&mut self, frames: u32) {
        for entry in self.entries.iter_mut() {
            entry.offset = entry.offset.saturating_sub(frames);
        }
    }

    /// Forget all progress, e.g. after a device reset.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BufferShare;

    #[test]
    fn device_advances_by_minimum() {
        let mut share = BufferShare::new(1024);
        share.add_id(1);
        share.add_id(2);
        share.set_frames(1, 480);
        share.set_frames(2, 240);
        assert_eq!(share.min_frames(), 240);

        share.advance(240);
        assert_eq!(share.frames(1), 240);
        assert_eq!(share.frames(2), 0);
        assert_eq!(share.min_frames(), 0);
    }

    #[test]
    fn offsets_clamp_to_window() {
        let mut share = BufferShare::new(100);
        share.add_id(7);
        share.set_frames(7, 500);
        assert_eq!(share.frames(7), 100);
    }

    #[test]
    fn removing_a_straggler_unblocks_commit() {
        let mut share = BufferShare::new(1024);
        share.add_id(1);
        share.add_id(2);
        share.set_frames(1, 512);
        assert_eq!(share.min_frames(), 0);
        share.rm_id(2);
        assert_eq!(share.min_frames(), 512);
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut share = BufferShare::new(64);
        share.add_id(3);
        share.set_frames(3, 32);
        share.add_id(3);
        assert_eq!(share.frames(3), 32);
    }
}
