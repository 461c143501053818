use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::time::Duration;
use std::vec;

use parking_lot::RwLock;

pub struct RetroAudio {
    pub rx: Receiver<Vec<i16>>,
    pub current_frame: vec::IntoIter<i16>,
    pub base_sample_rate: f32,
    pub speed_factor: Arc<RwLock<f32>>,
}

impl rodio::Source for RetroAudio {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.current_frame.len().max(1))
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        let speed_factor = *self.speed_factor.read();

        (speed_factor * self.base_sample_rate) as u32
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Iterator for RetroAudio {
    type Item = i16;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = match self.current_frame.next() {
            Some(sample) => Some(sample),
            None => {
                println!("should not happen more than once");
                self.current_frame = match self.rx.recv() {
                    Ok(current_frame) => current_frame.into_iter(),
                    Err(err) => {
                        eprintln!("Failed to receive audio frames: {err}");
                        return None;
                    }
                };

                self.current_frame.next()
            }
        };

        if self.current_frame.len() == 0 {
            self.current_frame = match self.rx.recv() {
                Ok(current_frame) => current_frame.into_iter(),
                Err(err) => {
                    eprintln!("Failed to receive audio frames: {err}");
                    return None;
                }
            };
        }

        if sample.is_none() {
            eprintln!("returning empty sample!");
        }

        sample
    }
}

/// The audio half of the core/platform bridge (spec.md §4.D): owns the
/// send side of the channel a [`RetroAudio`] source drains, plus the
/// rewind/fast-forward sample-dropping gate described for the audio
/// callback. Speed changes are applied by reporting a scaled sample rate
/// to the rodio source rather than resampling in-process.
pub struct AudioBridge {
    tx: SyncSender<Vec<i16>>,
    base_sample_rate: f32,
    speed_factor: Arc<RwLock<f32>>,
    rewind_audio_enabled: bool,
    ff_audio_enabled: bool,
}

impl AudioBridge {
    /// `channel_depth` bounds how many frames of audio can queue up before
    /// the core callback starts blocking; a handful of frames is enough
    /// slack to smooth out scheduling jitter without audible lag building
    /// up during a stall.
    pub fn new(base_sample_rate: f32, rewind_audio_enabled: bool, ff_audio_enabled: bool, channel_depth: usize) -> (Self, RetroAudio) {
        let (tx, rx) = sync_channel(channel_depth);
        let speed_factor = Arc::new(RwLock::new(1.0));
        let bridge = AudioBridge {
            tx,
            base_sample_rate,
            speed_factor: speed_factor.clone(),
            rewind_audio_enabled,
            ff_audio_enabled,
        };
        let source = RetroAudio {
            rx,
            current_frame: Vec::new().into_iter(),
            base_sample_rate,
            speed_factor,
        };
        (bridge, source)
    }

    pub fn set_speed_factor(&mut self, factor: f32) {
        *self.speed_factor.write() = factor;
    }

    /// §4.D: drop samples while rewinding unless rewind audio is enabled,
    /// and while fast-forwarding unless fast-forward audio is enabled.
    /// A full channel drops the frame too rather than blocking the core
    /// thread on audio backpressure.
    pub fn forward(&self, samples: &[i16], rewinding: bool, fast_forwarding: bool) {
        if rewinding && !self.rewind_audio_enabled {
            return;
        }
        if fast_forwarding && !self.ff_audio_enabled {
            return;
        }
        if self.tx.try_send(samples.to_vec()).is_err() {
            eprintln!("WARNING: audio sink backlog full, dropping a frame of samples");
        }
    }

    pub fn base_sample_rate(&self) -> f32 {
        self.base_sample_rate
    }
}
