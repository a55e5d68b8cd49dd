//! Sound effect mixer
//!
//! Overlays up to [`MAX_STREAMS`] preloaded sounds (menu sounds, background
//! music) on top of the core's audio after resampling. Streams are stored as
//! interleaved stereo `f32` at the output rate, so mixing is a plain
//! multiply-add per sample.
//!
//! Features:
//! - One-shot, looped and sequential playback (sequential hands over to the
//!   next occupied slot when a stream ends)
//! - Per-stream volume plus a global gain and mute
//! - WAV loading through `hound`, resampled to the output rate

use crate::resampler::{self, ResamplerQuality};
use crate::{AudioError, Result};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Number of mixer slots
pub const MAX_STREAMS: usize = 16;

/// Playback state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    /// Loaded, not playing
    Stopped,
    /// Playing once
    Playing,
    /// Playing in a loop
    PlayingLooped,
    /// Playing once, then starting the next occupied slot
    PlayingSequential,
}

impl MixerState {
    /// Whether the stream contributes to the mix
    pub fn is_playing(self) -> bool {
        !matches!(self, MixerState::Stopped)
    }
}

/// Who owns a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Loaded by the user (music playlist)
    User,
    /// Loaded by the frontend (menu sounds)
    System,
}

#[derive(Debug, Clone)]
struct MixerStream {
    name: String,
    /// Interleaved stereo at the mixer rate
    samples: Arc<[f32]>,
    /// Next frame to play
    position: usize,
    volume: f32,
    state: MixerState,
    stream_type: StreamType,
}

impl MixerStream {
    fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// Sound effect overlay
#[derive(Debug)]
pub struct Mixer {
    slots: Vec<Option<MixerStream>>,
    rate: u32,
    gain: f32,
    mute: bool,
}

impl Mixer {
    /// Create an empty mixer producing audio at `rate`
    pub fn new(rate: u32) -> Self {
        Mixer {
            slots: vec![None; MAX_STREAMS],
            rate,
            gain: 1.0,
            mute: false,
        }
    }

    /// Output rate in Hz
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Global linear gain
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    /// Global linear gain
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Silence the mixer without stopping its streams
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Whether the mixer is muted
    pub fn is_muted(&self) -> bool {
        self.mute
    }

    /// Whether any stream is playing
    pub fn is_active(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|stream| stream.state.is_playing())
    }

    /// Add interleaved stereo samples at the mixer rate; returns the slot
    ///
    /// # Errors
    ///
    /// [`AudioError::Allocation`] when every slot is taken.
    pub fn add_stream(
        &mut self,
        name: &str,
        samples: Vec<f32>,
        stream_type: StreamType,
    ) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| AudioError::Allocation(format!("No free mixer slot for '{name}'")))?;

        let mut samples = samples;
        samples.truncate(samples.len() / 2 * 2);
        self.slots[slot] = Some(MixerStream {
            name: name.to_string(),
            samples: samples.into(),
            position: 0,
            volume: 1.0,
            state: MixerState::Stopped,
            stream_type,
        });
        Ok(slot)
    }

    /// Load a WAV file into a free slot
    pub fn load_wav<P: AsRef<Path>>(&mut self, path: P, stream_type: StreamType) -> Result<usize> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let reader = hound::WavReader::open(path)?;
        self.load_wav_reader(&name, reader, stream_type)
    }

    /// Load WAV data from any reader into a free slot
    pub fn load_wav_from<R: Read>(
        &mut self,
        name: &str,
        reader: R,
        stream_type: StreamType,
    ) -> Result<usize> {
        let reader = hound::WavReader::new(reader)?;
        self.load_wav_reader(name, reader, stream_type)
    }

    fn load_wav_reader<R: Read>(
        &mut self,
        name: &str,
        reader: hound::WavReader<R>,
        stream_type: StreamType,
    ) -> Result<usize> {
        let spec = reader.spec();
        let channels = usize::from(spec.channels);
        if channels == 0 || spec.sample_rate == 0 {
            return Err(AudioError::Config(format!(
                "'{name}' has an invalid WAV header"
            )));
        }

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        // Mono is duplicated, extra channels are dropped
        let stereo: Vec<f32> = samples
            .chunks_exact(channels)
            .flat_map(|frame| {
                let left = frame[0];
                let right = if channels > 1 { frame[1] } else { left };
                [left, right]
            })
            .collect();

        let stereo = if spec.sample_rate == self.rate {
            stereo
        } else {
            let ratio = f64::from(self.rate) / f64::from(spec.sample_rate);
            let mut rs = resampler::create(ResamplerQuality::Normal, 2);
            let mut out = Vec::with_capacity((stereo.len() as f64 * ratio) as usize + 2);
            rs.process(&stereo, ratio, &mut out);
            out
        };

        self.add_stream(name, stereo, stream_type)
    }

    fn stream(&self, slot: usize) -> Option<&MixerStream> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn stream_mut(&mut self, slot: usize) -> Option<&mut MixerStream> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn set_state(&mut self, slot: usize, state: MixerState) -> bool {
        match self.stream_mut(slot) {
            Some(stream) => {
                stream.state = state;
                stream.position = 0;
                true
            }
            None => false,
        }
    }

    /// Play a slot once from the start; false if the slot is empty
    pub fn play(&mut self, slot: usize) -> bool {
        self.set_state(slot, MixerState::Playing)
    }

    /// Play a slot in a loop from the start
    pub fn play_looped(&mut self, slot: usize) -> bool {
        self.set_state(slot, MixerState::PlayingLooped)
    }

    /// Play a slot, then the following occupied slots in order
    pub fn play_sequential(&mut self, slot: usize) -> bool {
        self.set_state(slot, MixerState::PlayingSequential)
    }

    /// Stop a slot and rewind it
    pub fn stop(&mut self, slot: usize) -> bool {
        self.set_state(slot, MixerState::Stopped)
    }

    /// Free a slot
    pub fn remove(&mut self, slot: usize) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) => entry.take().is_some(),
            None => false,
        }
    }

    /// Set the linear volume of a slot
    pub fn set_volume(&mut self, slot: usize, volume: f32) -> bool {
        match self.stream_mut(slot) {
            Some(stream) => {
                stream.volume = volume;
                true
            }
            None => false,
        }
    }

    /// Linear volume of a slot
    pub fn volume(&self, slot: usize) -> Option<f32> {
        self.stream(slot).map(|s| s.volume)
    }

    /// Playback state of a slot; `None` when empty
    pub fn state(&self, slot: usize) -> Option<MixerState> {
        self.stream(slot).map(|s| s.state)
    }

    /// Name of the stream in a slot
    pub fn name(&self, slot: usize) -> Option<&str> {
        self.stream(slot).map(|s| s.name.as_str())
    }

    /// Owner of the stream in a slot
    pub fn stream_type(&self, slot: usize) -> Option<StreamType> {
        self.stream(slot).map(|s| s.stream_type)
    }

    /// Length of a slot in frames
    pub fn frames(&self, slot: usize) -> Option<usize> {
        self.stream(slot).map(MixerStream::frames)
    }

    /// First occupied slot after `slot`
    fn next_occupied(&self, slot: usize) -> Option<usize> {
        (slot + 1..MAX_STREAMS).find(|&next| self.slots[next].is_some())
    }

    /// Add every playing stream into interleaved stereo `out`
    pub fn mix_into(&mut self, out: &mut [f32]) {
        if self.mute {
            // Streams keep advancing so timing matches an unmuted mix
            self.advance(out.len() / 2, None);
        } else {
            self.advance(out.len() / 2, Some(out));
        }
    }

    fn advance(&mut self, frames: usize, mut out: Option<&mut [f32]>) {
        let gain = self.gain;
        // Frame at which a sequentially started slot joins the mix
        let mut start_at = [0usize; MAX_STREAMS];
        for slot in 0..MAX_STREAMS {
            let mut done = start_at[slot];
            while done < frames {
                let Some(stream) = self.slots[slot].as_mut() else {
                    break;
                };
                if !stream.state.is_playing() || stream.frames() == 0 {
                    break;
                }

                let n = (frames - done).min(stream.frames() - stream.position);
                if let Some(out) = out.as_deref_mut() {
                    let volume = stream.volume * gain;
                    let src = &stream.samples[stream.position * 2..(stream.position + n) * 2];
                    for (dst, s) in out[done * 2..(done + n) * 2].iter_mut().zip(src) {
                        *dst += s * volume;
                    }
                }
                stream.position += n;
                done += n;

                if stream.position < stream.frames() {
                    continue;
                }

                stream.position = 0;
                match stream.state {
                    MixerState::PlayingLooped => {}
                    MixerState::PlayingSequential => {
                        stream.state = MixerState::Stopped;
                        // Remaining frames of this call go to the next stream
                        if let Some(next) = self.next_occupied(slot) {
                            if let Some(next_stream) = self.slots[next].as_mut() {
                                next_stream.state = MixerState::PlayingSequential;
                                next_stream.position = 0;
                                start_at[next] = done;
                            }
                        }
                        break;
                    }
                    _ => {
                        stream.state = MixerState::Stopped;
                        break;
                    }
                }
            }
        }
    }
}
