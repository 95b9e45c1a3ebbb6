//! Linear-interpolation sample rate conversion.
//!
//! The resampler tracks cumulative input and output frame counts so the
//! output position never drifts from the ideal `out = in * to_rate /
//! from_rate` line, regardless of chunk sizes. One frame of history is kept
//! to interpolate across chunk boundaries.

use crate::format::frames_at_rate;

pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    /// Total input frames consumed since creation or reset.
    in_total: u64,
    /// Total output frames produced since creation or reset.
    out_total: u64,
    /// Last frame of the previous chunk, for interpolation continuity.
    history: Vec<f32>,
    has_history: bool,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> Self {
        Self {
            from_rate,
            to_rate,
            channels,
            in_total: 0,
            out_total: 0,
            history: vec![0.0; channels],
            has_history: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Upper bound of output frames produced for `in_frames` input frames.
    pub fn in_frames_to_out(&self, in_frames: u32) -> u32 {
        frames_at_rate(in_frames, self.from_rate, self.to_rate)
    }

    /// Input frames required to produce `out_frames` output frames.
    pub fn out_frames_to_in(&self, out_frames: u32) -> u32 {
        frames_at_rate(out_frames, self.to_rate, self.from_rate)
    }

    /// Drop all state, e.g. after an underrun reset.
    pub fn reset(&mut self) {
        self.in_total = 0;
        self.out_total = 0;
        self.has_history = false;
    }

    /// Resample `input` (interleaved frames) into `output`, returning the
    /// number of output frames written. `output` must hold at least
    /// `in_frames_to_out(input frames)` frames.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let ch = self.channels;
        let in_frames = input.len() / ch;
        if in_frames == 0 {
            return 0;
        }
        if self.is_identity() {
            output[..in_frames * ch].copy_from_slice(&input[..in_frames * ch]);
            self.in_total += in_frames as u64;
            self.out_total += in_frames as u64;
            return in_frames;
        }

        // Cumulative frame budget: everything below the ideal line that has
        // not been produced yet belongs to this chunk.
        let new_in_total = self.in_total + in_frames as u64;
        let target_out = new_in_total * u64::from(self.to_rate) / u64::from(self.from_rate);
        let produce = (target_out - self.out_total) as usize;

        // Frame index of the first input frame of this chunk, one earlier
        // if history from the previous chunk is available.
        let chunk_base = self.in_total;
        for k in 0..produce {
            let out_index = self.out_total + k as u64;
            // Source position in input frames, as (integer, fraction).
            let num = out_index * u64::from(self.from_rate);
            let src_index = num / u64::from(self.to_rate);
            let frac =
                (num % u64::from(self.to_rate)) as f32 / self.to_rate as f32;

            let (lo, hi) = self.frame_pair(input, in_frames, chunk_base, src_index);
            for c in 0..ch {
                let a = lo[c];
                let b = hi[c];
                output[k * ch + c] = a + (b - a) * frac;
            }
        }

        // Save the last input frame for the next chunk.
        self.history.copy_from_slice(&input[(in_frames - 1) * ch..in_frames * ch]);
        self.has_history = true;
        self.in_total = new_in_total;
        self.out_total += produce as u64;
        produce
    }

    /// Fetch the interpolation pair for global input frame `src_index`,
    /// clamping at the chunk edges.
    fn frame_pair<'a>(
        &'a self,
        input: &'a [f32],
        in_frames: usize,
        chunk_base: u64,
        src_index: u64,
    ) -> (&'a [f32], &'a [f32]) {
        let lo = self.frame_at(input, in_frames, chunk_base, src_index);
        let hi = self.frame_at(input, in_frames, chunk_base, src_index + 1);
        (lo, hi)
    }

    fn frame_at<'a>(
        &'a self,
        input: &'a [f32],
        in_frames: usize,
        chunk_base: u64,
        idx: u64,
    ) -> &'a [f32] {
        let ch = self.channels;
        if idx < chunk_base {
            // Frame from the previous chunk.
            if self.has_history {
                return &self.history;
            }
            return &input[0..ch];
        }
        let rel = ((idx - chunk_base) as usize).min(in_frames - 1);
        &input[rel * ch..rel * ch + ch]
    }
}
