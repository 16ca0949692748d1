use std::sync::Mutex;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::NesError;

/// Single-producer, single-consumer PCM ring shared between the emulation
/// thread and an audio callback.
///
/// Underruns replay the most recently consumed samples instead of emitting
/// silence. Overflow drops the excess and logs once per overflow episode.
pub struct AudioQueue {
    ring: Mutex<Ring>,
    sample_rate: u32,
    channels: u16,
}

struct Ring {
    buf: Vec<i16>,
    first: usize,
    size: usize,
    paused: bool,
    overflowing: bool,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn last(&self) -> usize {
        (self.first + self.size) % self.capacity()
    }

    fn push(&mut self, samples: &[i16]) -> usize {
        let count = samples.len().min(self.capacity() - self.size);
        let start = self.last();
        let seg1 = count.min(self.capacity() - start);
        self.buf[start..start + seg1].copy_from_slice(&samples[..seg1]);
        self.buf[..count - seg1].copy_from_slice(&samples[seg1..count]);
        self.size += count;
        count
    }

    fn pop(&mut self, out: &mut [i16]) {
        let count = out.len();
        debug_assert!(count <= self.size);
        let seg1 = count.min(self.capacity() - self.first);
        out[..seg1].copy_from_slice(&self.buf[self.first..self.first + seg1]);
        out[seg1..].copy_from_slice(&self.buf[..count - seg1]);
        self.first = (self.first + count) % self.capacity();
        self.size -= count;
    }

    fn unpop(&mut self, count: usize) {
        debug_assert!(self.size + count <= self.capacity());
        self.first = (self.first + self.capacity() - count) % self.capacity();
        self.size += count;
    }

    fn clear(&mut self) {
        // Underruns replay from `buf`, so stale audio must not survive.
        self.buf.fill(0);
        self.first = 0;
        self.size = 0;
        self.overflowing = false;
    }
}

impl AudioQueue {
    /// `capacity` is in samples per channel.
    pub fn new(sample_rate: u32, channels: u16, capacity: usize) -> Result<Self> {
        if !matches!(channels, 1 | 2) {
            return Err(NesError::InvalidChannelConfig(channels).into());
        }
        let len = capacity.max(1) * channels as usize;
        Ok(Self {
            ring: Mutex::new(Ring {
                buf: vec![0; len],
                first: 0,
                size: 0,
                paused: false,
                overflowing: false,
            }),
            sample_rate,
            channels,
        })
    }

    /// Ring sized `audio_buffer_samples * channels` at the configured rate.
    pub fn from_config(config: &Config) -> Result<Self> {
        let queue = Self::new(
            config.sample_rate,
            config.channels,
            config.audio_buffer_samples,
        )?;
        info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            capacity = queue.capacity(),
            "audio queue ready"
        );
        Ok(queue)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total slots, counting every channel.
    pub fn capacity(&self) -> usize {
        self.ring.lock().map(|r| r.capacity()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|r| r.size).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes interleaved samples; returns how many were accepted.
    pub fn push_samples(&self, samples: &[i16]) -> usize {
        let Ok(mut ring) = self.ring.lock() else {
            return 0;
        };
        if ring.paused || samples.is_empty() {
            return 0;
        }

        let accepted = ring.push(samples);
        if accepted < samples.len() {
            if !ring.overflowing {
                warn!(
                    dropped = samples.len() - accepted,
                    capacity = ring.capacity(),
                    "audio queue full, dropping samples"
                );
            }
            ring.overflowing = true;
        } else {
            ring.overflowing = false;
        }
        accepted
    }

    /// Quantizes mono mixer output and fans it out to every channel.
    pub fn push_mono(&self, samples: &[f32]) -> usize {
        let channels = self.channels as usize;
        let mut pcm = Vec::with_capacity(samples.len() * channels);
        for &s in samples {
            let q = quantize(s);
            pcm.extend(std::iter::repeat_n(q, channels));
        }
        self.push_samples(&pcm)
    }

    /// Fills `out` completely. Missing data is covered by replaying the
    /// tail of what was already played.
    pub fn pop_samples(&self, out: &mut [i16]) {
        let Ok(mut ring) = self.ring.lock() else {
            out.fill(0);
            return;
        };
        if ring.paused {
            out.fill(0);
            return;
        }

        let available = out.len().min(ring.size);
        ring.pop(&mut out[..available]);

        let mut filled = available;
        while filled < out.len() {
            let n = (out.len() - filled).min(ring.capacity());
            ring.unpop(n);
            ring.pop(&mut out[filled..filled + n]);
            filled += n;
        }
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.clear();
        }
    }

    pub fn set_paused(&self, paused: bool) {
        let Ok(mut ring) = self.ring.lock() else {
            return;
        };
        if ring.paused != paused {
            ring.clear();
            ring.paused = paused;
        }
    }
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(feature = "audio-output")]
pub use output::AudioOutput;

#[cfg(feature = "audio-output")]
mod output {
    use std::sync::Arc;

    use anyhow::{Context, Result, anyhow};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::error;

    use super::AudioQueue;

    /// Default output device draining an [`AudioQueue`].
    pub struct AudioOutput {
        _stream: cpal::Stream,
        queue: Arc<AudioQueue>,
    }

    impl AudioOutput {
        pub fn new(queue: Arc<AudioQueue>) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| anyhow!("no default audio output device"))?;
            let supported = device
                .default_output_config()
                .context("failed to query default audio config")?;

            let stream_config = cpal::StreamConfig {
                channels: queue.channels(),
                sample_rate: cpal::SampleRate(queue.sample_rate()),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_fn = |err| error!("audio stream error: {err}");

            let stream = match supported.sample_format() {
                cpal::SampleFormat::I16 => {
                    let queue = Arc::clone(&queue);
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _| queue.pop_samples(data),
                        err_fn,
                        None,
                    )?
                }
                cpal::SampleFormat::F32 => {
                    let queue = Arc::clone(&queue);
                    let mut scratch = Vec::new();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _| {
                            scratch.resize(data.len(), 0);
                            queue.pop_samples(&mut scratch);
                            for (out, &s) in data.iter_mut().zip(&scratch) {
                                *out = s as f32 / i16::MAX as f32;
                            }
                        },
                        err_fn,
                        None,
                    )?
                }
                cpal::SampleFormat::U16 => {
                    let queue = Arc::clone(&queue);
                    let mut scratch = Vec::new();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [u16], _| {
                            scratch.resize(data.len(), 0);
                            queue.pop_samples(&mut scratch);
                            for (out, &s) in data.iter_mut().zip(&scratch) {
                                *out = (s as i32 + 0x8000) as u16;
                            }
                        },
                        err_fn,
                        None,
                    )?
                }
                other => return Err(anyhow!("unsupported audio sample format: {other:?}")),
            };

            stream
                .play()
                .context("failed to start audio output stream")?;

            Ok(Self {
                _stream: stream,
                queue,
            })
        }

        pub fn queue(&self) -> &Arc<AudioQueue> {
            &self.queue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_channel_count() {
        for channels in [0u16, 3, 8] {
            let err = AudioQueue::new(44_100, channels, 64).err().unwrap();
            assert!(matches!(
                err.downcast_ref::<NesError>(),
                Some(NesError::InvalidChannelConfig(c)) if *c == channels
            ));
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let q = AudioQueue::new(44_100, 1, 8).unwrap();
        q.push_samples(&[1, 2, 3]);
        let mut out = [0i16; 3];
        q.pop_samples(&mut out);
        assert_eq!(out, [1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn underrun_repeats_recent_samples() {
        let q = AudioQueue::new(44_100, 1, 8).unwrap();
        q.push_samples(&[10, 20, 30, 40]);
        let mut out = [0i16; 6];
        q.pop_samples(&mut out);
        // Two missing samples are filled with the last two played.
        assert_eq!(out, [10, 20, 30, 40, 30, 40]);
    }

    #[test]
    fn underrun_with_empty_queue_replays_tail() {
        let q = AudioQueue::new(44_100, 1, 4).unwrap();
        q.push_samples(&[5, 6, 7, 8]);
        let mut out = [0i16; 4];
        q.pop_samples(&mut out);
        let mut again = [0i16; 2];
        q.pop_samples(&mut again);
        assert_eq!(again, [7, 8]);
    }

    #[test]
    fn overflow_drops_excess() {
        let q = AudioQueue::new(44_100, 1, 4).unwrap();
        assert_eq!(q.push_samples(&[1, 2, 3]), 3);
        assert_eq!(q.push_samples(&[4, 5, 6]), 1);
        assert_eq!(q.len(), 4);
        let mut out = [0i16; 4];
        q.pop_samples(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn wraps_around_ring_boundary() {
        let q = AudioQueue::new(44_100, 1, 4).unwrap();
        q.push_samples(&[1, 2, 3]);
        let mut out = [0i16; 2];
        q.pop_samples(&mut out);
        q.push_samples(&[4, 5, 6]);
        let mut rest = [0i16; 4];
        q.pop_samples(&mut rest);
        assert_eq!(rest, [3, 4, 5, 6]);
    }

    #[test]
    fn stereo_duplicates_mono_samples() {
        let q = AudioQueue::new(48_000, 2, 16).unwrap();
        q.push_mono(&[1.0, -1.0, 2.0]);
        let mut out = [0i16; 6];
        q.pop_samples(&mut out);
        assert_eq!(out, [i16::MAX, i16::MAX, -i16::MAX, -i16::MAX, i16::MAX, i16::MAX]);
    }

    #[test]
    fn from_config_sizes_ring_per_channel() {
        let config = Config {
            sample_rate: 48_000,
            channels: 2,
            audio_buffer_samples: 512,
            ..Config::default()
        };
        let q = AudioQueue::from_config(&config).unwrap();
        assert_eq!(q.capacity(), 1024);
        assert_eq!(q.channels(), 2);
        assert_eq!(q.sample_rate(), 48_000);

        let bad = Config {
            channels: 3,
            ..Config::default()
        };
        let err = AudioQueue::from_config(&bad).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<NesError>(),
            Some(NesError::InvalidChannelConfig(3))
        ));
    }

    #[test]
    fn underrun_after_clear_is_silent() {
        let q = AudioQueue::new(44_100, 1, 4).unwrap();
        q.push_samples(&[5, 6, 7, 8]);
        let mut out = [0i16; 4];
        q.pop_samples(&mut out);
        q.clear();
        let mut again = [1i16; 3];
        q.pop_samples(&mut again);
        assert_eq!(again, [0, 0, 0]);
    }

    #[test]
    fn paused_queue_outputs_silence_and_ignores_pushes() {
        let q = AudioQueue::new(44_100, 1, 8).unwrap();
        q.push_samples(&[9, 9]);
        q.set_paused(true);
        assert_eq!(q.push_samples(&[1, 2]), 0);
        let mut out = [7i16; 3];
        q.pop_samples(&mut out);
        assert_eq!(out, [0, 0, 0]);
    }
}
