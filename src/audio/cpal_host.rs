//! cpal-backed microphone and speaker
//!
//! Capture opens the default input device at the requested rate when the
//! device supports it, otherwise at its default config; samples are
//! downmixed and resampled to the requested rate before delivery.
//!
//! Playback mixes scheduled sources onto a timeline kept at the requested
//! rate, so source placement is exact in that rate's frames. The output
//! callback renders the timeline in 10ms blocks and converts the mix to the
//! device rate with one stateful resampler. The speaker clock is the number
//! of timeline frames rendered so far.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use cpal::{SupportedStreamConfig, SupportedStreamConfigRange};
use tokio::sync::mpsc;

use super::device::{
    AudioHost, DeviceErrorCallback, Microphone, MicrophoneHooks, SourceId, Speaker, SpeakerHooks,
};
use super::meter::LevelTap;
use super::resample::{downmix, StreamResampler};
use super::{AudioError, PcmBuffer};

/// Sample formats we can convert to and from f32
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Production [`AudioHost`] using the platform's default devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

/// Pick a config that runs natively at `rate`, preferring fewer channels
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
) -> Option<SupportedStreamConfig> {
    ranges
        .filter(|c| {
            c.min_sample_rate().0 <= rate
                && c.max_sample_rate().0 >= rate
                && SUPPORTED_FORMATS.contains(&c.sample_format())
        })
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(SampleRate(rate)))
}

impl AudioHost for CpalHost {
    fn open_microphone(
        &self,
        sample_rate: u32,
        hooks: MicrophoneHooks,
    ) -> Result<Box<dyn Microphone>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("No audio input device found".into()))?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported = match device.supported_input_configs() {
            Ok(ranges) => pick_config(ranges, sample_rate),
            Err(e) => {
                log::warn!("Failed to list input configs: {}", e);
                None
            }
        };
        let supported = match supported {
            Some(config) => config,
            None => device
                .default_input_config()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?,
        };

        log::info!(
            "Input config: {} Hz, {} channels, {:?} (delivering {} Hz mono)",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format(),
            sample_rate
        );

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let stream = match sample_format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, sample_rate, hooks),
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, sample_rate, hooks),
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, sample_rate, hooks),
            other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to start capture: {}", e)))?;

        Ok(Box::new(CpalMicrophone {
            stream: Some(stream),
        }))
    }

    fn open_speaker(
        &self,
        sample_rate: u32,
        hooks: SpeakerHooks,
    ) -> Result<Box<dyn Speaker>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("No audio output device found".into()))?;

        log::info!("Using audio output device: {:?}", device.name());

        let supported = match device.supported_output_configs() {
            Ok(ranges) => pick_config(ranges, sample_rate),
            Err(e) => {
                log::warn!("Failed to list output configs: {}", e);
                None
            }
        };
        let supported = match supported {
            Some(config) => config,
            None => device
                .default_output_config()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?,
        };

        log::info!(
            "Output config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let resampler = StreamResampler::for_playback(sample_rate, config.sample_rate.0)
            .map_err(AudioError::UnsupportedFormat)?;
        let timeline = Arc::new(Mutex::new(Timeline::new()));
        let output = OutputMixer {
            timeline: timeline.clone(),
            resampler,
            hooks,
        };

        let stream = match sample_format {
            SampleFormat::F32 => build_output_stream::<f32>(&device, &config, output),
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, output),
            SampleFormat::U16 => build_output_stream::<u16>(&device, &config, output),
            other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to start playback: {}", e)))?;

        Ok(Box::new(CpalSpeaker {
            stream: Some(stream),
            timeline,
            timeline_rate: sample_rate,
            next_id: 0,
        }))
    }
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    target_rate: u32,
    hooks: MicrophoneHooks,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let mut resampler = StreamResampler::for_capture(config.sample_rate.0, target_rate)
        .map_err(AudioError::UnsupportedFormat)?;
    let MicrophoneHooks {
        mut on_samples,
        on_error,
    } = hooks;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                let mono = downmix(&samples, channels);
                match resampler.process(&mono) {
                    Ok(out) if !out.is_empty() => on_samples(&out),
                    Ok(_) => {}
                    Err(e) => log::error!("Input resampling failed: {}", e),
                }
            },
            error_forwarder("Input", on_error),
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to create input stream: {}", e)))
}

/// Everything the output callback owns
struct OutputMixer {
    timeline: Arc<Mutex<Timeline>>,
    resampler: StreamResampler,
    hooks: SpeakerHooks,
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    output: OutputMixer,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let OutputMixer {
        timeline,
        mut resampler,
        hooks,
    } = output;
    let SpeakerHooks {
        ended,
        level_tap,
        on_error,
    } = hooks;
    let block_frames = (resampler.source_rate() as usize / 100).max(1);
    let mut block: Vec<f32> = vec![0.0; block_frames];
    let mut pending: VecDeque<f32> = VecDeque::new();
    let mut finished: Vec<SourceId> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;

                while pending.len() < frames {
                    // Silence if the timeline lock is poisoned
                    match timeline.lock() {
                        Ok(mut timeline) => timeline.render(&mut block, &mut finished),
                        Err(_) => block.fill(0.0),
                    }
                    report_output(&block, &level_tap, &ended, &mut finished);

                    match resampler.process(&block) {
                        Ok(out) => pending.extend(out),
                        Err(e) => {
                            log::error!("Output resampling failed: {}", e);
                            pending.resize(frames, 0.0);
                        }
                    }
                }

                for (frame, sample) in data.chunks_mut(channels).zip(pending.drain(..frames)) {
                    let value = T::from_sample(sample);
                    for slot in frame.iter_mut() {
                        *slot = value;
                    }
                }
            },
            error_forwarder("Output", on_error),
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to create output stream: {}", e)))
}

fn report_output(
    mix: &[f32],
    level_tap: &LevelTap,
    ended: &mpsc::UnboundedSender<SourceId>,
    finished: &mut Vec<SourceId>,
) {
    level_tap.push(mix);
    for id in finished.drain(..) {
        let _ = ended.send(id);
    }
}

fn error_forwarder(
    direction: &'static str,
    mut on_error: DeviceErrorCallback,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        log::error!("{} stream error: {}", direction, err);
        on_error(err.to_string());
    }
}

/// Open cpal input stream
struct CpalMicrophone {
    stream: Option<Stream>,
}

impl Microphone for CpalMicrophone {
    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("Failed to pause input stream: {}", e);
            }
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open cpal output stream plus its source timeline
struct CpalSpeaker {
    stream: Option<Stream>,
    timeline: Arc<Mutex<Timeline>>,
    /// Rate of the timeline and of every scheduled buffer
    timeline_rate: u32,
    next_id: u64,
}

/// Timeline frame at which a source scheduled for `at` seconds begins
///
/// Contiguous chunks of whole frames land on adjacent frames.
fn frame_at(at: f64, rate: u32) -> u64 {
    (at.max(0.0) * rate as f64).round() as u64
}

impl Speaker for CpalSpeaker {
    fn current_time(&self) -> f64 {
        match self.timeline.lock() {
            Ok(timeline) => timeline.position as f64 / self.timeline_rate as f64,
            Err(_) => 0.0,
        }
    }

    fn start_source(&mut self, buffer: PcmBuffer, at: f64) -> Result<SourceId, AudioError> {
        if self.stream.is_none() {
            return Err(AudioError::DeviceClosed);
        }

        if buffer.sample_rate != self.timeline_rate {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz buffer on a {} Hz speaker",
                buffer.sample_rate, self.timeline_rate
            )));
        }

        let samples = buffer.into_mono();
        let start_frame = frame_at(at, self.timeline_rate);

        let id = SourceId(self.next_id);
        self.next_id += 1;

        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| AudioError::DeviceUnavailable("output timeline poisoned".into()))?;
        timeline.add(id, start_frame, samples);
        Ok(id)
    }

    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError> {
        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| AudioError::DeviceUnavailable("output timeline poisoned".into()))?;
        if timeline.remove(id) {
            Ok(())
        } else {
            Err(AudioError::AlreadyStopped(id))
        }
    }

    fn close(&mut self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.clear();
        }
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("Failed to pause output stream: {}", e);
            }
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

/// A source placed on the output timeline
struct TimelineSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl TimelineSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Frame-accurate mixer shared between the speaker handle and the output callback
struct Timeline {
    /// Frames rendered so far
    position: u64,
    sources: Vec<TimelineSource>,
}

impl Timeline {
    fn new() -> Self {
        Self {
            position: 0,
            sources: Vec::new(),
        }
    }

    fn add(&mut self, id: SourceId, start_frame: u64, samples: Vec<f32>) {
        self.sources.push(TimelineSource {
            id,
            start_frame,
            samples,
        });
    }

    fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|source| source.id != id);
        self.sources.len() != before
    }

    fn clear(&mut self) {
        self.sources.clear();
    }

    /// Mix the next `out.len()` frames and advance the clock
    ///
    /// Sources that finished within this block are appended to `finished`.
    fn render(&mut self, out: &mut [f32], finished: &mut Vec<SourceId>) {
        out.fill(0.0);
        let start = self.position;
        let end = start + out.len() as u64;

        for source in &self.sources {
            let from = source.start_frame.max(start);
            let to = source.end_frame().min(end);
            for frame in from..to {
                out[(frame - start) as usize] += source.samples[(frame - source.start_frame) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = end;
        self.sources.retain(|source| {
            let done = source.end_frame() <= end;
            if done {
                finished.push(source.id);
            }
            !done
        });
    }
}
