//! Whole-format conversion: sample codec, channel remap and rate change.

use crate::error::DspError;
use crate::format::{frames_at_rate, AudioFormat};
use crate::matrix::MixMatrix;
use crate::rate::Resampler;
use crate::sample::{decode_buffer, encode_buffer};

/// Converts interleaved PCM between two [`AudioFormat`]s.
///
/// Handles any combination of sample-format change, channel remap/mix and
/// rate change. When the two formats are equal the converter is an identity
/// and [`convert`](FormatConverter::convert) degrades to a copy without
/// touching the scratch buffers.
pub struct FormatConverter {
    from: AudioFormat,
    to: AudioFormat,
    matrix: Option<MixMatrix>,
    resampler: Option<Resampler>,
    decoded: Vec<f32>,
    remapped: Vec<f32>,
    resampled: Vec<f32>,
}

impl FormatConverter {
    /// Build a converter sized for chunks of up to `max_frames` input
    /// frames. Larger chunks still work; the scratch buffers grow.
    pub fn new(from: AudioFormat, to: AudioFormat, max_frames: usize) -> Result<Self, DspError> {
        if from.frame_rate == 0 || from.num_channels == 0 {
            return Err(DspError::DegenerateFormat {
                frame_rate: from.frame_rate,
                num_channels: from.num_channels,
            });
        }
        if to.frame_rate == 0 || to.num_channels == 0 {
            return Err(DspError::DegenerateFormat {
                frame_rate: to.frame_rate,
                num_channels: to.num_channels,
            });
        }

        let identity = !from.conversion_needed(&to);
        let matrix = if identity
            || (from.num_channels == to.num_channels && from.channel_layout == to.channel_layout)
        {
            None
        } else {
            Some(MixMatrix::create(&from, &to)?)
        };
        let resampler = if identity || from.frame_rate == to.frame_rate {
            None
        } else {
            Some(Resampler::new(
                from.frame_rate,
                to.frame_rate,
                to.num_channels as usize,
            ))
        };

        let max_out = frames_at_rate(max_frames as u32, from.frame_rate, to.frame_rate) as usize;
        let (decoded, remapped, resampled) = if identity {
            (Vec::new(), Vec::new(), Vec::new())
        } else {
            (
                vec![0.0; max_frames * from.num_channels as usize],
                vec![0.0; max_frames * to.num_channels as usize],
                vec![0.0; (max_out + 1) * to.num_channels as usize],
            )
        };

        Ok(Self {
            from,
            to,
            matrix,
            resampler,
            decoded,
            remapped,
            resampled,
        })
    }

    pub fn from_format(&self) -> &AudioFormat {
        &self.from
    }

    pub fn to_format(&self) -> &AudioFormat {
        &self.to
    }

    pub fn is_identity(&self) -> bool {
        self.matrix.is_none()
            && self.resampler.is_none()
            && self.from.sample_format == self.to.sample_format
    }

    /// Upper bound of output frames for `frames` input frames.
    pub fn in_frames_to_out(&self, frames: u32) -> u32 {
        frames_at_rate(frames, self.from.frame_rate, self.to.frame_rate)
    }

    /// Input frames needed to yield `frames` output frames.
    pub fn out_frames_to_in(&self, frames: u32) -> u32 {
        frames_at_rate(frames, self.to.frame_rate, self.from.frame_rate)
    }

    /// Drop resampler history, e.g. after a device reset.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Convert all frames of `input`, writing converted frames to `output`.
    /// Returns the number of output frames produced.
    pub fn convert(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, DspError> {
        let in_frames = input.len() / self.from.frame_bytes();
        if in_frames == 0 {
            return Ok(0);
        }

        if self.is_identity() {
            let bytes = in_frames * self.from.frame_bytes();
            if output.len() < bytes {
                return Err(DspError::OutputTooSmall {
                    capacity: output.len() / self.to.frame_bytes(),
                    needed: in_frames,
                });
            }
            output[..bytes].copy_from_slice(&input[..bytes]);
            return Ok(in_frames);
        }

        let from_ch = self.from.num_channels as usize;
        let to_ch = self.to.num_channels as usize;

        let decoded_len = in_frames * from_ch;
        if self.decoded.len() < decoded_len {
            self.decoded.resize(decoded_len, 0.0);
        }
        decode_buffer(input, self.from.sample_format, &mut self.decoded[..decoded_len]);

        let remapped_len = in_frames * to_ch;
        if self.remapped.len() < remapped_len {
            self.remapped.resize(remapped_len, 0.0);
        }
        match self.matrix.as_ref() {
            Some(matrix) => {
                matrix.apply(&self.decoded[..decoded_len], &mut self.remapped[..remapped_len]);
            },
            None => self.remapped[..remapped_len].copy_from_slice(&self.decoded[..decoded_len]),
        }

        let (converted, out_frames) = match self.resampler.as_mut() {
            Some(resampler) => {
                let max_out = frames_at_rate(
                    in_frames as u32,
                    self.from.frame_rate,
                    self.to.frame_rate,
                ) as usize;
                if self.resampled.len() < (max_out + 1) * to_ch {
                    self.resampled.resize((max_out + 1) * to_ch, 0.0);
                }
                let produced =
                    resampler.process(&self.remapped[..remapped_len], &mut self.resampled);
                (&self.resampled[..produced * to_ch], produced)
            },
            None => (&self.remapped[..remapped_len], in_frames),
        };

        let out_bytes = out_frames * self.to.frame_bytes();
        if output.len() < out_bytes {
            return Err(DspError::OutputTooSmall {
                capacity: output.len() / self.to.frame_bytes(),
                needed: out_frames,
            });
        }
        encode_buffer(converted, self.to.sample_format, output);
        Ok(out_frames)
    }
}
