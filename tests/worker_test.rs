use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use image::{GrayImage, Luma, Rgb, RgbImage};
use motion_recorder::config::{BackgroundSubtractorConfig, PreprocessConfig};
use motion_recorder::media::{self, MediaError};
use motion_recorder::{
    FileNameFactory, FrameSource, MotionData, MotionDataWorker, MotionSnapshot, OnSourceFailure,
    Recorder, RecordingPolicy,
};
use parking_lot::Mutex;

const SIZE: u32 = 16;

/// Yields `script[i]` brightness frames, then runs dry. An empty script
/// never ends.
struct ScriptedSource {
    script: Vec<u8>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    fn endless(calls: Arc<AtomicUsize>) -> Self {
        Self {
            script: Vec::new(),
            calls,
        }
    }

    fn scripted(script: Vec<u8>) -> Self {
        Self {
            script,
            calls: Arc::default(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_video_frame(&mut self) -> media::Result<RgbImage> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.script.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(RgbImage::from_pixel(SIZE, SIZE, Rgb([30, 30, 30])));
        }
        match self.script.get(n) {
            Some(&level) => Ok(RgbImage::from_pixel(SIZE, SIZE, Rgb([level, level, level]))),
            None => Err(MediaError::SourceExhausted),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Start(PathBuf),
    Stop,
}

#[derive(Default)]
struct FakeRecorder {
    recording: AtomicBool,
    events: Mutex<Vec<Event>>,
}

impl Recorder for FakeRecorder {
    fn start_recording(&self, path: &Path) -> media::Result<()> {
        self.recording.store(true, Ordering::SeqCst);
        self.events.lock().push(Event::Start(path.to_path_buf()));
        Ok(())
    }

    fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
        self.events.lock().push(Event::Stop);
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn fps(&self) -> f64 {
        25.0
    }
}

#[derive(Default)]
struct CountingNames {
    issued: AtomicUsize,
}

impl FileNameFactory for CountingNames {
    fn generate(&self) -> anyhow::Result<PathBuf> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from(format!("segment-{n}.mkv")))
    }
}

fn worker(
    source: ScriptedSource,
    policy: RecordingPolicy,
) -> MotionDataWorker<ScriptedSource, FakeRecorder> {
    MotionDataWorker::new(
        source,
        FakeRecorder::default(),
        Arc::new(CountingNames::default()),
        BackgroundSubtractorConfig::default(),
        PreprocessConfig::default(),
        policy,
    )
    .with_source_failure(OnSourceFailure::Stop)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_stop_leaves_no_running_loop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = worker(ScriptedSource::endless(calls.clone()), RecordingPolicy::Off);

    worker.start().unwrap();
    assert!(worker.is_running());
    wait_until("first frames", || calls.load(Ordering::SeqCst) > 5);
    worker.stop();
    assert!(!worker.is_running());

    let after_stop = calls.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);

    // stopping twice is harmless
    worker.stop();
    assert!(worker.motion_data().read().is_some());
}

#[test]
fn test_restart_runs_exactly_one_loop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = worker(ScriptedSource::endless(calls.clone()), RecordingPolicy::Off);

    worker.start().unwrap();
    worker.stop();
    worker.start().unwrap();
    // start() on a running worker replaces the loop instead of adding one
    worker.start().unwrap();
    assert!(worker.is_running());

    let before = calls.load(Ordering::SeqCst);
    wait_until("restarted loop", || calls.load(Ordering::SeqCst) > before + 5);
    worker.stop();

    let after_stop = calls.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);
}

#[test]
fn test_always_policy_records_until_stop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = worker(ScriptedSource::endless(calls.clone()), RecordingPolicy::Always);
    let recorder = worker.recorder();

    worker.start().unwrap();
    assert!(worker.is_recording());
    wait_until("first frames", || calls.load(Ordering::SeqCst) > 2);
    worker.stop();

    assert!(!worker.is_recording());
    assert_eq!(
        *recorder.events.lock(),
        vec![Event::Start(PathBuf::from("segment-0.mkv")), Event::Stop]
    );
}

#[test]
fn test_off_policy_never_records() {
    let mut worker = worker(ScriptedSource::scripted(vec![10, 10, 200, 200, 10]), RecordingPolicy::Off);
    let recorder = worker.recorder();

    worker.start().unwrap();
    wait_until("end of source", || !worker.is_running());
    worker.stop();

    assert!(recorder.events.lock().is_empty());
}

#[test]
fn test_on_motion_policy_follows_moving_area() {
    let mut script = vec![10; 3];
    script.extend([220; 5]);
    script.extend([10; 10]);
    let mut worker = worker(
        ScriptedSource::scripted(script),
        RecordingPolicy::OnMotion {
            min_moving_area: 1,
            delta_without_motion: Duration::ZERO,
        },
    );
    let recorder = worker.recorder();

    worker.start().unwrap();
    assert!(!worker.is_recording());
    wait_until("end of source", || !worker.is_running());
    worker.stop();

    assert_eq!(
        *recorder.events.lock(),
        vec![Event::Start(PathBuf::from("segment-0.mkv")), Event::Stop]
    );
    let last = worker.motion_data().read().unwrap();
    assert_eq!(last.moving_area(), 0);
}

#[test]
fn test_exhausted_source_stops_worker() {
    let mut worker = worker(ScriptedSource::scripted(vec![10; 4]), RecordingPolicy::Off);

    worker.start().unwrap();
    wait_until("end of source", || !worker.is_running());
    worker.stop();

    let snapshot = worker.motion_data().read().unwrap();
    assert_eq!(snapshot.frame().dimensions(), (SIZE, SIZE));
    assert_eq!(snapshot.mask().dimensions(), (SIZE, SIZE));
    assert_eq!(worker.fps(), 25.0);
}

#[test]
fn test_source_failure_finishes_open_recording() {
    let mut worker = worker(ScriptedSource::scripted(vec![10; 4]), RecordingPolicy::Always);
    let recorder = worker.recorder();

    worker.start().unwrap();
    wait_until("end of source", || !worker.is_running());

    // closed by the loop itself, before anyone calls stop()
    assert!(!recorder.is_recording());
    assert_eq!(
        *recorder.events.lock(),
        vec![Event::Start(PathBuf::from("segment-0.mkv")), Event::Stop]
    );

    worker.stop();
    assert_eq!(recorder.events.lock().len(), 2);
}

#[test]
fn test_readers_never_see_torn_snapshots() {
    let data = Arc::new(MotionData::new());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let data = data.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut seen = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let Some(snapshot) = data.read() else {
                        continue;
                    };
                    let level = snapshot.frame().get_pixel(0, 0)[0];
                    assert!(snapshot.frame().pixels().all(|p| p.0 == [level; 3]));
                    assert!(snapshot.mask().pixels().all(|p| p.0 == [level]));
                    let expected = if level == 0 { 0 } else { (SIZE * SIZE) as u64 };
                    assert_eq!(snapshot.moving_area(), expected);
                    seen += 1;
                }
                seen
            })
        })
        .collect();

    for level in 0..=255u8 {
        for _ in 0..4 {
            data.publish(MotionSnapshot::new(
                RgbImage::from_pixel(SIZE, SIZE, Rgb([level; 3])),
                GrayImage::from_pixel(SIZE, SIZE, Luma([level])),
            ));
        }
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(data.moving_area(), (SIZE * SIZE) as u64);
}
