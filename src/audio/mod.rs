use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};
use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;
pub const WAV_MIME_TYPE: &str = "audio/wav";
const STOP_SIGNAL_DEBOUNCE_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

/// One finalized recording. Immutable after capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    bytes: Vec<u8>,
    mime_type: String,
    duration_hint: Duration,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>, duration_hint: Duration) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            duration_hint,
        }
    }

    /// Encodes mono samples as 16-bit PCM WAV. Returns `None` when nothing was captured.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Result<Option<Self>, AudioError> {
        if samples.is_empty() {
            return Ok(None);
        }
        let bytes = encode_wav(samples, sample_rate)?;
        let duration_hint =
            Duration::from_millis(samples.len() as u64 * 1_000 / sample_rate.max(1) as u64);
        Ok(Some(Self::new(bytes, WAV_MIME_TYPE, duration_hint)))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn duration_hint(&self) -> Duration {
        self.duration_hint
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn file_name(&self) -> &'static str {
        match self.mime_type.split(';').next().map(str::trim) {
            Some("audio/webm") => "clip.webm",
            Some("audio/ogg") => "clip.ogg",
            Some("audio/mpeg") => "clip.mp3",
            _ => "clip.wav",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub max_capture_duration: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_capture_duration: Duration::from_millis(3_000),
        }
    }
}

/// Cancellation and stop signals shared between the async controller and a
/// blocking recorder thread. Cancel discards the recording; stop finalizes it.
#[derive(Debug, Clone)]
pub struct CaptureSignals {
    cancel: CancellationToken,
    stop: Arc<AtomicBool>,
}

impl CaptureSignals {
    pub fn new(cancel: CancellationToken, stop: Arc<AtomicBool>) -> Self {
        Self { cancel, stop }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("failed to query input devices: {0}")]
    Devices(cpal::DevicesError),
    #[error("no input device is available")]
    MissingInputDevice,
    #[error("requested input device '{0}' was not found")]
    DeviceNotFound(String),
    #[error("failed to query default input config: {0}")]
    DefaultInputConfig(cpal::DefaultStreamConfigError),
    #[error("failed to build input stream: {0}")]
    BuildStream(cpal::BuildStreamError),
    #[error("failed to start input stream: {0}")]
    PlayStream(cpal::PlayStreamError),
    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),
    #[error("audio stream runtime error: {0}")]
    RuntimeStream(String),
    #[error("failed to encode WAV clip: {0}")]
    Encode(#[from] hound::Error),
    #[error("audio capture cancelled")]
    Cancelled,
}

impl AudioError {
    /// Errors meaning the microphone is denied, missing or cannot be opened.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(
            self,
            AudioError::Devices(_)
                | AudioError::MissingInputDevice
                | AudioError::DeviceNotFound(_)
                | AudioError::DefaultInputConfig(_)
                | AudioError::BuildStream(_)
                | AudioError::PlayStream(_)
                | AudioError::UnsupportedSampleFormat(_)
        )
    }
}

/// Blocking source of bounded clips. Implementations run on a blocking thread
/// and must poll `signals` often enough for stop and cancel to feel immediate.
pub trait ClipRecorder: Send + Sync {
    fn probe(&self) -> Result<(), AudioError>;

    fn record_clip(
        &self,
        options: CaptureOptions,
        signals: &CaptureSignals,
    ) -> Result<Option<AudioClip>, AudioError>;
}

#[derive(Debug, Clone)]
pub struct MicrophoneRecorder {
    pub target_sample_rate: u32,
    pub input_device: Option<String>,
}

impl Default for MicrophoneRecorder {
    fn default() -> Self {
        Self {
            target_sample_rate: TARGET_SAMPLE_RATE,
            input_device: None,
        }
    }
}

impl MicrophoneRecorder {
    pub fn with_input_device(input_device: Option<String>) -> Self {
        Self {
            input_device,
            ..Self::default()
        }
    }

    pub fn list_input_devices(&self) -> Vec<String> {
        let host = cpal::default_host();
        let Ok(devices) = host.input_devices() else {
            return Vec::new();
        };
        devices.filter_map(|d| d.name().ok()).collect()
    }

    pub fn normalize_frame(&self, frame: AudioFrame) -> Vec<f32> {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        resample_linear(&mono, frame.sample_rate, self.target_sample_rate)
    }

    pub fn probe_input_device(&self) -> Result<(), AudioError> {
        let host = cpal::default_host();
        let device = self.select_input_device(&host)?;
        let _ = device
            .default_input_config()
            .map_err(AudioError::DefaultInputConfig)?;
        Ok(())
    }

    pub fn capture_samples_from_microphone(
        &self,
        options: CaptureOptions,
        signals: &CaptureSignals,
    ) -> Result<Vec<f32>, AudioError> {
        let host = cpal::default_host();
        let device = self.select_input_device(&host)?;
        let supported_config = device
            .default_input_config()
            .map_err(AudioError::DefaultInputConfig)?;

        let sample_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels();
        let stream_config: StreamConfig = supported_config.clone().into();
        let sample_format = supported_config.sample_format();

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        let (error_tx, error_rx) = mpsc::channel::<String>();

        let stream =
            build_input_stream(&device, &stream_config, sample_format, audio_tx, error_tx)?;
        stream.play().map_err(AudioError::PlayStream)?;
        debug!(sample_rate, channels, "microphone stream started");

        let samples = self.collect_samples_from_stream(
            sample_rate,
            channels,
            audio_rx,
            error_rx,
            options,
            signals,
        );

        drop(stream);
        samples
    }

    fn select_input_device(&self, host: &cpal::Host) -> Result<cpal::Device, AudioError> {
        if let Some(name) = self.input_device.as_deref() {
            let devices = host.input_devices().map_err(AudioError::Devices)?;
            for device in devices {
                if device.name().is_ok_and(|device_name| device_name == name) {
                    return Ok(device);
                }
            }
            if let Some(default_device) = host.default_input_device() {
                warn!(
                    requested = name,
                    "input device not found; falling back to default input device"
                );
                return Ok(default_device);
            }
            return Err(AudioError::DeviceNotFound(name.to_string()));
        }

        host.default_input_device()
            .ok_or(AudioError::MissingInputDevice)
    }

    fn collect_samples_from_stream(
        &self,
        sample_rate: u32,
        channels: u16,
        audio_rx: Receiver<Vec<f32>>,
        error_rx: Receiver<String>,
        options: CaptureOptions,
        signals: &CaptureSignals,
    ) -> Result<Vec<f32>, AudioError> {
        let started = Instant::now();
        let stop_debounce = Duration::from_millis(STOP_SIGNAL_DEBOUNCE_MS);
        let mut captured = Vec::new();

        while started.elapsed() <= options.max_capture_duration {
            if signals.is_cancelled() {
                return Err(AudioError::Cancelled);
            }
            // A tap shorter than the debounce still yields a short clip.
            if signals.stop_requested() && started.elapsed() >= stop_debounce {
                break;
            }
            if let Ok(stream_err) = error_rx.try_recv() {
                return Err(AudioError::RuntimeStream(stream_err));
            }

            match audio_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(raw_chunk) => captured.extend(self.normalize_frame(AudioFrame {
                    sample_rate,
                    channels,
                    samples: raw_chunk,
                })),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while let Ok(raw_chunk) = audio_rx.try_recv() {
            captured.extend(self.normalize_frame(AudioFrame {
                sample_rate,
                channels,
                samples: raw_chunk,
            }));
        }

        Ok(captured)
    }
}

impl ClipRecorder for MicrophoneRecorder {
    fn probe(&self) -> Result<(), AudioError> {
        self.probe_input_device()
    }

    fn record_clip(
        &self,
        options: CaptureOptions,
        signals: &CaptureSignals,
    ) -> Result<Option<AudioClip>, AudioError> {
        let samples = self.capture_samples_from_microphone(options, signals)?;
        AudioClip::from_samples(&samples, self.target_sample_rate)
    }
}

fn build_input_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    sample_format: SampleFormat,
    audio_tx: Sender<Vec<f32>>,
    error_tx: Sender<String>,
) -> Result<Stream, AudioError> {
    match sample_format {
        SampleFormat::F32 => device
            .build_input_stream(
                stream_config,
                move |data: &[f32], _| {
                    let _ = audio_tx.send(data.to_vec());
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        SampleFormat::I16 => device
            .build_input_stream(
                stream_config,
                move |data: &[i16], _| {
                    let converted = data
                        .iter()
                        .map(|sample| *sample as f32 / i16::MAX as f32)
                        .collect::<Vec<_>>();
                    let _ = audio_tx.send(converted);
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        SampleFormat::U16 => device
            .build_input_stream(
                stream_config,
                move |data: &[u16], _| {
                    let converted = data
                        .iter()
                        .map(|sample| (*sample as f32 / u16::MAX as f32) * 2.0 - 1.0)
                        .collect::<Vec<_>>();
                    let _ = audio_tx.send(converted);
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        _ => Err(AudioError::UnsupportedSampleFormat(format!(
            "{sample_format:?}"
        ))),
    }
}

pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}

pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let ch = channels as usize;
    samples
        .chunks(ch)
        .map(|chunk| chunk.iter().copied().sum::<f32>() / chunk.len() as f32)
        .collect()
}

pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(output_len);

    for idx in 0..output_len {
        let src_pos = idx as f64 / ratio;
        let left_idx = (src_pos.floor() as usize).min(samples.len() - 1);
        let right_idx = (left_idx + 1).min(samples.len() - 1);
        let alpha = (src_pos - left_idx as f64) as f32;
        let left = samples[left_idx];
        let right = samples[right_idx];
        out.push(left + alpha * (right - left));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> (CancellationToken, Arc<AtomicBool>, CaptureSignals) {
        let cancel = CancellationToken::new();
        let stop = Arc::new(AtomicBool::new(false));
        let signals = CaptureSignals::new(cancel.clone(), stop.clone());
        (cancel, stop, signals)
    }

    #[test]
    fn stereo_downmix_is_averaged() {
        let stereo = vec![1.0, -1.0, 0.5, 0.5];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn resample_changes_length() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let out = resample_linear(&samples, 8_000, 16_000);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn empty_samples_produce_no_clip() {
        let clip = AudioClip::from_samples(&[], TARGET_SAMPLE_RATE).expect("encode should succeed");
        assert!(clip.is_none());
    }

    #[test]
    fn samples_encode_as_riff_wav() {
        let samples = vec![0.25_f32; 1_600];
        let clip = AudioClip::from_samples(&samples, TARGET_SAMPLE_RATE)
            .expect("encode should succeed")
            .expect("clip should exist");
        assert_eq!(&clip.bytes()[..4], b"RIFF");
        assert_eq!(clip.mime_type(), WAV_MIME_TYPE);
        assert_eq!(clip.file_name(), "clip.wav");
        assert_eq!(clip.duration_hint(), Duration::from_millis(100));
        // 44-byte header plus two bytes per sample.
        assert_eq!(clip.bytes().len(), 44 + samples.len() * 2);
    }

    #[test]
    fn webm_clips_keep_their_extension() {
        let clip = AudioClip::new(vec![1, 2, 3], "audio/webm;codecs=opus", Duration::ZERO);
        assert_eq!(clip.file_name(), "clip.webm");
    }

    #[test]
    fn stop_is_debounced_then_finalizes_captured_audio() {
        let recorder = MicrophoneRecorder::default();
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        let (_error_tx, error_rx) = mpsc::channel::<String>();
        let (_cancel, stop, signals) = signals();
        let options = CaptureOptions {
            max_capture_duration: Duration::from_secs(2),
        };

        audio_tx
            .send(vec![0.1_f32; 320])
            .expect("test frame should be queued");
        stop.store(true, Ordering::Relaxed);

        let started = Instant::now();
        let samples = recorder
            .collect_samples_from_stream(
                recorder.target_sample_rate,
                1,
                audio_rx,
                error_rx,
                options,
                &signals,
            )
            .expect("capture should complete");

        assert!(started.elapsed() >= Duration::from_millis(STOP_SIGNAL_DEBOUNCE_MS));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(samples.len(), 320);
    }

    #[test]
    fn cancel_discards_capture() {
        let recorder = MicrophoneRecorder::default();
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        let (_error_tx, error_rx) = mpsc::channel::<String>();
        let (cancel, _stop, signals) = signals();

        audio_tx
            .send(vec![0.1_f32; 320])
            .expect("test frame should be queued");
        cancel.cancel();

        let result = recorder.collect_samples_from_stream(
            recorder.target_sample_rate,
            1,
            audio_rx,
            error_rx,
            CaptureOptions::default(),
            &signals,
        );
        assert!(matches!(result, Err(AudioError::Cancelled)));
    }

    #[test]
    fn capture_ends_at_max_duration() {
        let recorder = MicrophoneRecorder::default();
        let (_audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        let (_error_tx, error_rx) = mpsc::channel::<String>();
        let (_cancel, _stop, signals) = signals();
        let options = CaptureOptions {
            max_capture_duration: Duration::from_millis(60),
        };

        let samples = recorder
            .collect_samples_from_stream(
                recorder.target_sample_rate,
                1,
                audio_rx,
                error_rx,
                options,
                &signals,
            )
            .expect("capture should complete");
        assert!(samples.is_empty());
    }

    #[test]
    fn stream_errors_surface_as_runtime_errors() {
        let recorder = MicrophoneRecorder::default();
        let (_audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        let (error_tx, error_rx) = mpsc::channel::<String>();
        let (_cancel, _stop, signals) = signals();
        error_tx
            .send("device unplugged".to_string())
            .expect("error should be queued");

        let result = recorder.collect_samples_from_stream(
            recorder.target_sample_rate,
            1,
            audio_rx,
            error_rx,
            CaptureOptions::default(),
            &signals,
        );
        assert!(matches!(
            result,
            Err(AudioError::RuntimeStream(message)) if message == "device unplugged"
        ));
    }

    #[test]
    fn device_errors_are_classified() {
        assert!(AudioError::MissingInputDevice.is_device_unavailable());
        assert!(AudioError::DeviceNotFound("x".to_string()).is_device_unavailable());
        assert!(!AudioError::Cancelled.is_device_unavailable());
        assert!(!AudioError::RuntimeStream("x".to_string()).is_device_unavailable());
    }
}
