//! Background thread that turns decoded frames into published motion snapshots.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use image::{DynamicImage, RgbImage};
use tracing::{debug, error, info, warn};

use crate::config::{
    BackgroundSubtractorConfig, PreprocessConfig, RecordingMode, Segmentation,
};
use crate::filters::{self, FrameTransform};
use crate::media::{self, Input, InputHandle};
use crate::motion::{self, BackgroundSubtractor, MotionData, MotionSnapshot};
use crate::naming::FileNameFactory;

const THREAD_NAME: &str = "motion-worker";

/// Pull side of a video source.
pub trait FrameSource: Send + 'static {
    fn next_video_frame(&mut self) -> media::Result<RgbImage>;
}

impl FrameSource for Input {
    fn next_video_frame(&mut self) -> media::Result<RgbImage> {
        Input::next_video_frame(self)
    }
}

/// Recording control that may be used from any thread.
pub trait Recorder: Send + Sync + 'static {
    fn start_recording(&self, path: &Path) -> media::Result<()>;
    fn stop_recording(&self);
    fn is_recording(&self) -> bool;
    fn fps(&self) -> f64;
}

impl Recorder for InputHandle {
    fn start_recording(&self, path: &Path) -> media::Result<()> {
        InputHandle::start_recording(self, path)
    }

    fn stop_recording(&self) {
        InputHandle::stop_recording(self)
    }

    fn is_recording(&self) -> bool {
        InputHandle::is_recording(self)
    }

    fn fps(&self) -> f64 {
        InputHandle::fps(self)
    }
}

/// When the worker records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordingPolicy {
    Off,
    /// From `start()` until `stop()`.
    Always,
    /// While the moving area stays at or above `min_moving_area`, plus
    /// `delta_without_motion` after it drops.
    OnMotion {
        min_moving_area: u64,
        delta_without_motion: Duration,
    },
}

impl From<&Segmentation> for RecordingPolicy {
    fn from(segmentation: &Segmentation) -> Self {
        match segmentation.recording {
            RecordingMode::Off => RecordingPolicy::Off,
            RecordingMode::Always => RecordingPolicy::Always,
            RecordingMode::OnMotion => RecordingPolicy::OnMotion {
                min_moving_area: segmentation.min_moving_area,
                delta_without_motion: Duration::from_secs_f64(
                    segmentation.delta_without_motion.max(0.0),
                ),
            },
        }
    }
}

/// What the worker does when the source fails or runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnSourceFailure {
    /// Log and terminate the process; a dead live source cannot be resumed.
    #[default]
    Exit,
    /// Log and end the worker thread.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentAction {
    Start,
    Stop,
    Keep,
}

/// Decides when motion-driven recordings open and close.
#[derive(Debug)]
struct MotionSegmenter {
    min_moving_area: u64,
    delta_without_motion: Duration,
    last_motion: Instant,
}

impl MotionSegmenter {
    fn new(min_moving_area: u64, delta_without_motion: Duration, now: Instant) -> Self {
        Self {
            min_moving_area,
            delta_without_motion,
            last_motion: now,
        }
    }

    fn update(&mut self, moving_area: u64, is_recording: bool, now: Instant) -> SegmentAction {
        if moving_area >= self.min_moving_area {
            self.last_motion = now;
            if is_recording {
                SegmentAction::Keep
            } else {
                SegmentAction::Start
            }
        } else if is_recording && now.duration_since(self.last_motion) >= self.delta_without_motion {
            SegmentAction::Stop
        } else {
            SegmentAction::Keep
        }
    }
}

struct Running<S> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<S>,
}

/// Runs the decode/analysis loop on its own thread.
///
/// `Stopped -> Running -> Stopped`; the source moves into the thread while
/// running and comes back when it is joined.
pub struct MotionDataWorker<S: FrameSource, R: Recorder> {
    source: Option<S>,
    recorder: Arc<R>,
    naming: Arc<dyn FileNameFactory>,
    subtractor: BackgroundSubtractorConfig,
    preprocess: PreprocessConfig,
    policy: RecordingPolicy,
    on_failure: OnSourceFailure,
    motion_data: Arc<MotionData>,
    running: Option<Running<S>>,
}

impl<S: FrameSource, R: Recorder> MotionDataWorker<S, R> {
    pub fn new(
        source: S,
        recorder: R,
        naming: Arc<dyn FileNameFactory>,
        subtractor: BackgroundSubtractorConfig,
        preprocess: PreprocessConfig,
        policy: RecordingPolicy,
    ) -> Self {
        Self {
            source: Some(source),
            recorder: Arc::new(recorder),
            naming,
            subtractor,
            preprocess,
            policy,
            on_failure: OnSourceFailure::default(),
            motion_data: Arc::new(MotionData::new()),
            running: None,
        }
    }

    pub fn with_source_failure(mut self, on_failure: OnSourceFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn motion_data(&self) -> Arc<MotionData> {
        self.motion_data.clone()
    }

    pub fn recorder(&self) -> Arc<R> {
        self.recorder.clone()
    }

    pub fn fps(&self) -> f64 {
        self.recorder.fps()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Spawns the worker thread, stopping a previous run first.
    pub fn start(&mut self) -> Result<()> {
        self.stop();
        let mut source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("Video source was lost by a previous worker run"))?;

        let subtractor = motion::build(&self.subtractor);
        let transform = filters::build(&self.preprocess);

        let segmenter = match self.policy {
            RecordingPolicy::Always => {
                if let Err(error) = start_new_recording(&*self.recorder, &*self.naming) {
                    self.source = Some(source);
                    return Err(error);
                }
                None
            }
            RecordingPolicy::OnMotion {
                min_moving_area,
                delta_without_motion,
            } => Some(MotionSegmenter::new(
                min_moving_area,
                delta_without_motion,
                Instant::now(),
            )),
            RecordingPolicy::Off => None,
        };

        // a fresh flag, so a stop() aimed at an older run cannot end this one
        let stop = Arc::new(AtomicBool::new(false));
        let context = LoopContext {
            stop: stop.clone(),
            recorder: self.recorder.clone(),
            naming: self.naming.clone(),
            motion_data: self.motion_data.clone(),
            on_failure: self.on_failure,
        };

        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                context.run(&mut source, transform, subtractor, segmenter);
                source
            })
            .map_err(|e| anyhow!("Failed to spawn {THREAD_NAME} thread: {e}"))?;

        info!(policy = ?self.policy, "Motion worker started");
        self.running = Some(Running { stop, handle });
        Ok(())
    }

    /// Signals the worker thread and waits for it. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        debug!("Stopping motion worker...");
        running.stop.store(true, Ordering::SeqCst);
        match running.handle.join() {
            Ok(source) => {
                self.source = Some(source);
                debug!("Motion worker joined");
            }
            Err(_) => error!("Motion worker thread panicked, video source is lost"),
        }
        if self.policy != RecordingPolicy::Off && self.recorder.is_recording() {
            self.recorder.stop_recording();
        }
    }
}

impl<S: FrameSource, R: Recorder> Drop for MotionDataWorker<S, R> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopContext<R: Recorder> {
    stop: Arc<AtomicBool>,
    recorder: Arc<R>,
    naming: Arc<dyn FileNameFactory>,
    motion_data: Arc<MotionData>,
    on_failure: OnSourceFailure,
}

impl<R: Recorder> LoopContext<R> {
    fn run<S: FrameSource>(
        &self,
        source: &mut S,
        transform: Box<dyn FrameTransform>,
        mut subtractor: Box<dyn BackgroundSubtractor>,
        mut segmenter: Option<MotionSegmenter>,
    ) {
        while !self.stop.load(Ordering::SeqCst) {
            let frame = match source.next_video_frame() {
                Ok(frame) => frame,
                Err(error) => {
                    // process::exit skips destructors, finish the file first
                    if self.recorder.is_recording() {
                        self.recorder.stop_recording();
                    }
                    match self.on_failure {
                        OnSourceFailure::Exit => {
                            error!(%error, "Video source failed, exiting");
                            std::process::exit(1);
                        }
                        OnSourceFailure::Stop => {
                            error!(%error, "Video source failed, stopping motion worker");
                            break;
                        }
                    }
                }
            };

            let image = DynamicImage::ImageRgb8(frame);
            let processed = transform.apply(&image);
            let mask = subtractor.apply(&processed);
            let snapshot = MotionSnapshot::new(image.into_rgb8(), mask);
            let moving_area = snapshot.moving_area();
            self.motion_data.publish(snapshot);

            if let Some(segmenter) = segmenter.as_mut() {
                match segmenter.update(moving_area, self.recorder.is_recording(), Instant::now()) {
                    SegmentAction::Start => {
                        info!(moving_area, "Motion detected");
                        if let Err(error) = start_new_recording(&*self.recorder, &*self.naming) {
                            error!(%error, "Failed to start recording");
                        }
                    }
                    SegmentAction::Stop => {
                        info!("End of motion");
                        self.recorder.stop_recording();
                    }
                    SegmentAction::Keep => {}
                }
            }
        }
    }
}

fn start_new_recording(recorder: &dyn Recorder, naming: &dyn FileNameFactory) -> Result<()> {
    let path = naming.generate()?;
    info!(path = %path.display(), "Opening recording");
    recorder
        .start_recording(&path)
        .map_err(|e| anyhow!("Failed to record to {}: {e}", path.display()))
        .inspect_err(|error| warn!(%error, "Recording not started"))
}
