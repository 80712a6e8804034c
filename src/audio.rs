use crate::EventLog;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{unbounded, Receiver};
use log::{info, warn};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use symphonia::core::{
    audio::{SampleBuffer, SignalSpec},
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};

#[derive(thiserror::Error, Debug)]
pub enum AudioError {
    #[error("failed to open mask track: {0}")]
    Open(io::Error),
    #[error("failed to decode mask track: {0}")]
    Decode(String),
    #[error("mask track has no playable audio")]
    Empty,
    #[error("no default audio output device")]
    NoDevice,
    #[error("no audio player available for the mask")]
    NoPlayer,
    #[error("audio output stream failed: {0}")]
    Stream(String),
    #[error("mask track not loaded")]
    NotLoaded,
    #[error("failed to write mask event: {0}")]
    Log(#[from] io::Error),
}

/// Playback capability for the mask track: load once, loop, stop, release.
///
/// `play_looping` must return as soon as playback is running; the audio itself
/// runs on the backend's own thread.
pub trait MaskPlayer {
    fn load(&mut self, path: &Path) -> Result<(), AudioError>;
    fn play_looping(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
    fn release(&mut self);

    /// Errors reported by the playback thread since the last call.
    fn drain_errors(&mut self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskState {
    Idle,
    Playing,
    Stopped,
}

/// Looping background noise that hides the transducer's audible buzz.
pub struct AudioMask {
    player: Box<dyn MaskPlayer>,
    path: PathBuf,
    state: MaskState,
    loaded: bool,
}

impl AudioMask {
    pub fn new(path: impl Into<PathBuf>, player: Box<dyn MaskPlayer>) -> Self {
        Self {
            player,
            path: path.into(),
            state: MaskState::Idle,
            loaded: false,
        }
    }

    pub fn state(&self) -> MaskState {
        self.state
    }

    /// Starts looping playback and returns immediately. Calling it again while
    /// playing does nothing.
    pub fn start(&mut self, log: &mut EventLog) -> Result<(), AudioError> {
        if self.state != MaskState::Idle {
            return Ok(());
        }
        info!("Audio mask starting...");
        if !self.loaded {
            self.player.load(&self.path)?;
            self.loaded = true;
        }
        self.player.play_looping()?;
        self.state = MaskState::Playing;
        log.log("mask_start", &self.path.display().to_string())?;
        Ok(())
    }

    /// Stops playback and releases the track. Safe before, during or after a
    /// failed `start`, and on repeated calls.
    pub fn stop(&mut self, log: &mut EventLog) -> Result<(), AudioError> {
        if self.state == MaskState::Stopped {
            return Ok(());
        }
        let was_playing = self.state == MaskState::Playing;
        self.state = MaskState::Stopped;

        let result = if was_playing {
            info!("Audio mask stopping...");
            self.player.stop()
        } else {
            Ok(())
        };
        if self.loaded {
            self.player.release();
            self.loaded = false;
        }
        if was_playing {
            log.log("mask_stop", "")?;
        }
        result
    }

    pub fn drain_errors(&mut self) -> Vec<String> {
        self.player.drain_errors()
    }
}

impl Drop for AudioMask {
    fn drop(&mut self) {
        if self.state == MaskState::Playing {
            if let Err(e) = self.player.stop() {
                warn!("Audio mask stop failed during drop: {e}");
            }
        }
        if self.loaded {
            self.player.release();
        }
    }
}

/// Fully decoded track, interleaved.
#[derive(Debug, Clone)]
pub struct DecodedTrack {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedTrack {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate.max(1) as f64)
    }
}

pub fn decode_file(path: &Path) -> Result<DecodedTrack, AudioError> {
    let file = File::open(path).map_err(AudioError::Open)?;
    let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(format!("probe failed: {e}")))?;
    let mut format = probed.format;
    let track = format.default_track().ok_or(AudioError::Empty)?;
    let track_id = track.id;
    let params = track.codec_params.clone();
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("missing sample rate".to_string()))?;
    let channels = params.channels.map(|c| c.count()).unwrap_or(0);
    if channels == 0 {
        return Err(AudioError::Decode("missing channel layout".to_string()));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("decoder init failed: {e}")))?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                let needs_realloc = match sample_buf.as_ref() {
                    None => true,
                    Some(buf) => buf.capacity() < audio_buf.capacity(),
                };
                if needs_realloc {
                    let spec = SignalSpec::new(audio_buf.spec().rate, audio_buf.spec().channels);
                    sample_buf = Some(SampleBuffer::<f32>::new(
                        audio_buf.capacity() as u64,
                        spec,
                    ));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(audio_buf);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        }
    }

    if samples.is_empty() {
        return Err(AudioError::Empty);
    }
    Ok(DecodedTrack {
        samples: samples.into(),
        sample_rate,
        channels,
    })
}

/// Endless reader over a decoded track, mapped to the output layout.
///
/// Output channels beyond the source's repeat its last channel; rate
/// conversion is linear interpolation between neighbouring frames.
struct LoopingSource {
    samples: Arc<[f32]>,
    in_channels: usize,
    out_channels: usize,
    frames: usize,
    step: f64,
    position: f64,
}

impl LoopingSource {
    fn new(track: &DecodedTrack, out_rate: u32, out_channels: usize) -> Self {
        Self {
            samples: Arc::clone(&track.samples),
            in_channels: track.channels.max(1),
            out_channels: out_channels.max(1),
            frames: track.frames().max(1),
            step: track.sample_rate as f64 / out_rate.max(1) as f64,
            position: 0.0,
        }
    }

    fn sample(&self, frame: usize, channel: usize) -> f32 {
        let ch = channel.min(self.in_channels - 1);
        self.samples
            .get(frame * self.in_channels + ch)
            .copied()
            .unwrap_or(0.0)
    }

    /// Writes one output frame into `out` (length `out_channels`).
    fn next_frame(&mut self, out: &mut [f32]) {
        let base = self.position.floor();
        let frac = (self.position - base) as f32;
        let i0 = base as usize % self.frames;
        let i1 = (i0 + 1) % self.frames;
        for (channel, slot) in out.iter_mut().enumerate() {
            let a = self.sample(i0, channel);
            let b = self.sample(i1, channel);
            *slot = a + (b - a) * frac;
        }
        self.position += self.step;
        if self.position >= self.frames as f64 {
            self.position -= self.frames as f64;
        }
    }

    fn fill_f32(&mut self, data: &mut [f32]) {
        for frame in data.chunks_mut(self.out_channels) {
            self.next_frame(frame);
        }
    }

    fn fill_i16(&mut self, data: &mut [i16]) {
        let mut frame = vec![0.0; self.out_channels];
        for out in data.chunks_mut(self.out_channels) {
            self.next_frame(&mut frame);
            for (slot, v) in out.iter_mut().zip(&frame) {
                *slot = f32_to_i16(*v);
            }
        }
    }

    fn fill_u16(&mut self, data: &mut [u16]) {
        let mut frame = vec![0.0; self.out_channels];
        for out in data.chunks_mut(self.out_channels) {
            self.next_frame(&mut frame);
            for (slot, v) in out.iter_mut().zip(&frame) {
                *slot = f32_to_u16(*v);
            }
        }
    }
}

fn f32_to_i16(v: f32) -> i16 {
    let v = v.clamp(-1.0, 1.0);
    (v * i16::MAX as f32) as i16
}

fn f32_to_u16(v: f32) -> u16 {
    let v = v.clamp(-1.0, 1.0);
    let normalized = (v + 1.0) * 0.5;
    (normalized * u16::MAX as f32) as u16
}

/// Plays the mask on the default output device through `cpal`.
#[derive(Default)]
pub struct CpalPlayer {
    track: Option<DecodedTrack>,
    stream: Option<cpal::Stream>,
    errors: Option<Receiver<String>>,
}

impl CpalPlayer {
    pub fn new() -> Self {
        Default::default()
    }
}

impl MaskPlayer for CpalPlayer {
    fn load(&mut self, path: &Path) -> Result<(), AudioError> {
        let track = decode_file(path)?;
        info!(
            "Mask track loaded: {} Hz, {} ch, {:.1} s",
            track.sample_rate,
            track.channels,
            track.duration().as_secs_f64()
        );
        self.track = Some(track);
        Ok(())
    }

    fn play_looping(&mut self) -> Result<(), AudioError> {
        let track = self.track.as_ref().ok_or(AudioError::NotLoaded)?;
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        let stream_config: cpal::StreamConfig = config.clone().into();
        let mut source = LoopingSource::new(
            track,
            config.sample_rate(),
            config.channels() as usize,
        );

        let (tx, rx) = unbounded();
        let on_error = move |err: cpal::StreamError| {
            let _ = tx.send(err.to_string());
        };
        let timeout = Some(Duration::from_millis(200));
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _| source.fill_f32(data),
                on_error,
                timeout,
            ),
            cpal::SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _| source.fill_i16(data),
                on_error,
                timeout,
            ),
            cpal::SampleFormat::U16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [u16], _| source.fill_u16(data),
                on_error,
                timeout,
            ),
            other => {
                return Err(AudioError::Stream(format!(
                    "unsupported output sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| AudioError::Stream(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        self.stream = Some(stream);
        self.errors = Some(rx);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| AudioError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.stream = None;
        self.track = None;
        self.errors = None;
    }

    fn drain_errors(&mut self) -> Vec<String> {
        self.errors
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{AudioError, MaskPlayer};
    use std::{
        path::Path,
        sync::{Arc, Mutex},
    };

    /// Records player calls; can refuse to load and report playback errors.
    #[derive(Default)]
    pub struct FakePlayer {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub fail_load: bool,
        pub pending_errors: Vec<String>,
    }

    impl FakePlayer {
        pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.calls)
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl MaskPlayer for FakePlayer {
        fn load(&mut self, _path: &Path) -> Result<(), AudioError> {
            self.record("load");
            if self.fail_load {
                return Err(AudioError::Empty);
            }
            Ok(())
        }

        fn play_looping(&mut self) -> Result<(), AudioError> {
            self.record("play");
            Ok(())
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            self.record("stop");
            Ok(())
        }

        fn release(&mut self) {
            self.record("release");
        }

        fn drain_errors(&mut self) -> Vec<String> {
            std::mem::take(&mut self.pending_errors)
        }
    }
}
