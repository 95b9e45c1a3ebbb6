//! Channel conversion matrices.
//!
//! When source and destination layouts name the same set of semantic slots
//! the matrix is a pure permutation. Otherwise a small set of generic
//! up/down mixes applies: mono fans out to every destination channel and a
//! destination of mono averages every source channel.

use crate::error::DspError;
use crate::format::{AudioFormat, CH_MAX};

/// Coefficient matrix mapping input channels to output channels.
#[derive(Debug, Clone)]
pub struct MixMatrix {
    coef: Vec<Vec<f32>>,
    in_channels: usize,
    out_channels: usize,
}

impl MixMatrix {
    pub fn create(from: &AudioFormat, to: &AudioFormat) -> Result<Self, DspError> {
        let in_ch = from.num_channels as usize;
        let out_ch = to.num_channels as usize;
        if in_ch == 0 || out_ch == 0 {
            return Err(DspError::DegenerateFormat {
                frame_rate: from.frame_rate,
                num_channels: from.num_channels.min(to.num_channels),
            });
        }

        let mut coef = vec![vec![0.0f32; in_ch]; out_ch];

        if layouts_pair_up(from, to) {
            for slot in 0..CH_MAX {
                let src = from.channel_layout[slot];
                let dst = to.channel_layout[slot];
                if src >= 0 && dst >= 0 {
                    coef[dst as usize][src as usize] = 1.0;
                }
            }
            return Ok(Self {
                coef,
                in_channels: in_ch,
                out_channels: out_ch,
            });
        }

        if in_ch == 1 {
            for row in coef.iter_mut() {
                row[0] = 1.0;
            }
        } else if out_ch == 1 {
            let weight = 1.0 / in_ch as f32;
            for cell in coef[0].iter_mut() {
                *cell = weight;
            }
        } else {
            return Err(DspError::UnsupportedChannelConversion {
                from: from.num_channels,
                to: to.num_channels,
            });
        }

        Ok(Self {
            coef,
            in_channels: in_ch,
            out_channels: out_ch,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Apply the matrix to interleaved frames.
    pub fn apply(&self, input: &[f32], output: &mut [f32]) {
        let frames = input.len() / self.in_channels;
        for frame in 0..frames {
            let in_base = frame * self.in_channels;
            let out_base = frame * self.out_channels;
            for (o, row) in self.coef.iter().enumerate() {
                let mut acc = 0.0f32;
                for (i, &c) in row.iter().enumerate() {
                    if c != 0.0 {
                        acc += input[in_base + i] * c;
                    }
                }
                output[out_base + o] = acc;
            }
        }
    }
}

/// True when every slot is either present in both layouts or absent in both,
/// which lets a permutation matrix carry the conversion.
fn layouts_pair_up(from: &AudioFormat, to: &AudioFormat) -> bool {
    (0..CH_MAX).all(|slot| {
        let src = from.channel_layout[slot];
        let dst = to.channel_layout[slot];
        (src >= 0) == (dst >= 0)
    })
}

#[cfg(test)]
mod tests {
    use crate::format::{AudioFormat, SampleFormat};

    use super::MixMatrix;

    fn fmt(channels: u32) -> AudioFormat {
        AudioFormat::new(SampleFormat::S16LE, 48000, channels)
    }

    #[test]
    fn stereo_permutation_swaps_channels() {
        let from = fmt(2);
        let mut to = fmt(2);
        let mut layout = to.channel_layout;
        layout[0] = 1;
        layout[1] = 0;
        to.set_channel_layout(layout).unwrap();

        let matrix = MixMatrix::create(&from, &to).unwrap();
        let input = [0.25f32, -0.5, 0.75, 1.0];
        let mut output = [0.0f32; 4];
        matrix.apply(&input, &mut output);
        assert_eq!(output, [-0.5, 0.25, 1.0, 0.75]);
    }

    #[test]
    fn mono_fans_out_to_stereo() {
        let matrix = MixMatrix::create(&fmt(1), &fmt(2)).unwrap();
        let input = [0.5f32, -0.25];
        let mut output = [0.0f32; 4];
        matrix.apply(&input, &mut output);
        assert_eq!(output, [0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn stereo_averages_to_mono() {
        let matrix = MixMatrix::create(&fmt(2), &fmt(1)).unwrap();
        let input = [0.8f32, 0.2];
        let mut output = [0.0f32; 1];
        matrix.apply(&input, &mut output);
        assert!((output[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mismatched_wide_layouts_are_rejected() {
        let mut from = fmt(4);
        let mut layout = from.channel_layout;
        layout[0] = 0;
        layout[1] = 1;
        layout[2] = 2;
        layout[3] = 3;
        from.set_channel_layout(layout).unwrap();
        assert!(MixMatrix::create(&from, &fmt(2)).is_err());
    }
}
