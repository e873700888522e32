use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, Duration},
};

use crate::annotate;
use crate::camera::{CameraError, FrameSource};
use crate::config::CameraConfig;
use crate::detector::Detector;
use crate::handoff::{EpisodeId, HandoffNotifier};
use crate::labels;
use crate::scale::{ScaleError, WeightReading, WeightSource};
use crate::state::{Command, CommandQueue, Phase, SharedSnapshot, Snapshot, StatusKind};
use crate::telemetry::Metrics;

pub struct Episode {
    pub id: EpisodeId,
    pub notified: bool,
}

/// Either scanning live frames or frozen on the first detection. The frozen
/// frame and label only exist while locked, so a stale redirect flag cannot
/// outlive its episode.
enum LockState {
    Scanning,
    Locked {
        frame: Bytes,
        label: String,
        episode: Episode,
    },
}

pub struct AcquisitionPipeline {
    frames: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    scale: Box<dyn WeightSource>,
    notifier: HandoffNotifier,
    confidence_threshold: f32,
    state: LockState,
    next_episode: EpisodeId,
}

impl AcquisitionPipeline {
    pub fn new(
        frames: Box<dyn FrameSource>,
        detector: Arc<dyn Detector>,
        scale: Box<dyn WeightSource>,
        notifier: HandoffNotifier,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            frames,
            detector,
            scale,
            notifier,
            confidence_threshold,
            state: LockState::Scanning,
            next_episode: 1,
        }
    }

    /// One iteration while the run toggle is on. The scale is polled first,
    /// in every state; weight display is never gated by the lock.
    pub async fn tick(&mut self) -> Snapshot {
        let weight = self.scale.read();
        match self.state {
            LockState::Scanning => self.scanning_tick(weight).await,
            LockState::Locked { .. } => self.locked_tick(weight),
        }
    }

    /// One iteration while the run toggle is off: camera stays released,
    /// but a connected scale still reports standby weight.
    pub fn standby_tick(&mut self) -> Snapshot {
        let weight = self.scale.read();
        Snapshot {
            phase: Phase::Idle,
            status: StatusKind::Standby,
            message: StatusKind::Standby.message().to_string(),
            frame: None,
            label: None,
            display_name: None,
            weight,
            detail_url: None,
            episode: None,
            redirect_issued: false,
            scale_connected: self.scale.is_connected(),
            last_error: None,
        }
    }

    async fn scanning_tick(&mut self, weight: WeightReading) -> Snapshot {
        let mut frame = match self.frames.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => return self.scan_snapshot(StatusKind::NoFrame, None, weight),
            Err(e) => {
                tracing::warn!("frame read failed: {}", e);
                return self.scan_snapshot(StatusKind::NoFrame, None, weight);
            }
        };

        let jpeg = match annotate::encode_jpeg(&frame) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!("frame encode failed: {}", e);
                return self.scan_snapshot(StatusKind::NoFrame, None, weight);
            }
        };

        let detections = match self
            .detector
            .predict(jpeg.to_vec(), self.confidence_threshold)
            .await
        {
            Ok(detections) => detections,
            Err(e) => {
                // One bad call is a skipped tick, not the end of the scan.
                tracing::error!("detector call failed: {}", e);
                Vec::new()
            }
        };

        // Detector-native order; the first hit wins.
        let Some(first) = detections.first() else {
            return self.scan_snapshot(StatusKind::WaitingForObject, Some(jpeg), weight);
        };
        let label = first.label.clone();

        let frozen = match annotate::draw_detections(&mut frame, &detections)
            .and_then(|_| annotate::encode_jpeg(&frame))
        {
            Ok(frozen) => frozen,
            Err(e) => {
                tracing::warn!("annotation failed, freezing raw frame: {}", e);
                jpeg
            }
        };

        let episode = Episode {
            id: self.next_episode,
            notified: false,
        };
        self.next_episode += 1;
        tracing::info!(label = %label, episode = episode.id, "detection locked");
        self.state = LockState::Locked {
            frame: frozen,
            label,
            episode,
        };

        self.locked_tick(weight)
    }

    fn locked_tick(&mut self, weight: WeightReading) -> Snapshot {
        let scale_connected = self.scale.is_connected();
        let LockState::Locked {
            frame,
            label,
            episode,
        } = &mut self.state
        else {
            unreachable!("locked_tick outside Locked state");
        };

        let display_name = labels::display_name(label).to_string();
        // Weight is re-sampled every tick; the URL always carries the
        // freshest reading, not the one at detection time.
        let url = self.notifier.build_url(&display_name, weight);
        if self.notifier.notify_once(episode.id, &url) {
            episode.notified = true;
        }

        Snapshot {
            phase: Phase::Locked,
            status: StatusKind::Locked,
            message: StatusKind::Locked.message().to_string(),
            frame: Some(frame.clone()),
            label: Some(label.clone()),
            display_name: Some(display_name),
            weight,
            detail_url: Some(url.to_string()),
            episode: Some(episode.id),
            redirect_issued: episode.notified,
            scale_connected,
            last_error: None,
        }
    }

    fn scan_snapshot(
        &mut self,
        status: StatusKind,
        frame: Option<Bytes>,
        weight: WeightReading,
    ) -> Snapshot {
        Snapshot {
            phase: Phase::Scanning,
            status,
            message: status.message().to_string(),
            frame,
            label: None,
            display_name: None,
            weight,
            detail_url: None,
            episode: None,
            redirect_issued: false,
            scale_connected: self.scale.is_connected(),
            last_error: None,
        }
    }

    /// The only way out of a lock. The frozen frame and label drop here.
    pub fn reset(&mut self) {
        if let LockState::Locked { episode, .. } = &self.state {
            tracing::info!(episode = episode.id, "lock reset, scanning again");
        }
        self.state = LockState::Scanning;
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, LockState::Locked { .. })
    }

    pub fn start_camera(&mut self, device_index: i32) -> Result<(), CameraError> {
        self.frames.start(device_index)
    }

    pub fn release_camera(&mut self) {
        self.frames.release();
    }

    pub fn set_confidence(&mut self, threshold: f32) {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn connect_scale(&mut self, port: &str, baud: u32) -> Result<(), ScaleError> {
        self.scale.connect(port, baud)
    }

    pub fn disconnect_scale(&mut self) {
        self.scale.disconnect();
    }
}

/// Owns the pipeline and drives it on a fixed short sleep; one logical tick
/// per iteration. Commands from the HTTP layer are applied between ticks.
pub struct PipelineRunner {
    pipeline: AcquisitionPipeline,
    snapshot: SharedSnapshot,
    commands: CommandQueue,
    metrics: Arc<Metrics>,
    tick_delay_ms: u64,
    default_camera_index: i32,
    running: bool,
    was_locked: bool,
    last_error: Option<String>,
}

impl PipelineRunner {
    pub fn new(
        pipeline: AcquisitionPipeline,
        snapshot: SharedSnapshot,
        commands: CommandQueue,
        metrics: Arc<Metrics>,
        camera_config: &CameraConfig,
    ) -> Self {
        Self {
            pipeline,
            snapshot,
            commands,
            metrics,
            tick_delay_ms: camera_config.tick_ms,
            default_camera_index: camera_config.device_index,
            running: false,
            was_locked: false,
            last_error: None,
        }
    }

    pub fn spawn(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Pipeline received shutdown signal");
                        break;
                    }
                    _ = sleep(Duration::from_millis(self.tick_delay_ms)) => {}
                }

                self.apply_commands();

                let started = Instant::now();
                let mut snapshot = if self.running {
                    self.pipeline.tick().await
                } else {
                    self.pipeline.standby_tick()
                };
                snapshot.last_error = self.last_error.clone();

                self.metrics
                    .record_tick(snapshot.phase.as_str(), started.elapsed().as_millis() as u64);
                self.metrics.record_weight(snapshot.weight.grams);
                if snapshot.phase == Phase::Locked && !self.was_locked {
                    self.metrics.record_lock();
                }
                self.was_locked = snapshot.phase == Phase::Locked;

                *self.snapshot.lock() = snapshot;
            }
            self.pipeline.release_camera();
            tracing::info!("Pipeline stopped");
        })
    }

    fn apply_commands(&mut self) {
        let drained: Vec<Command> = {
            let mut queue = self.commands.lock();
            queue.drain(..).collect()
        };

        for command in drained {
            match command {
                Command::Start {
                    camera_index,
                    confidence_threshold,
                } => {
                    if let Some(threshold) = confidence_threshold {
                        self.pipeline.set_confidence(threshold);
                    }
                    let index = camera_index.unwrap_or(self.default_camera_index);
                    match self.pipeline.start_camera(index) {
                        Ok(()) => {
                            tracing::info!(index, "camera started");
                            self.running = true;
                            self.last_error = None;
                        }
                        Err(e) => {
                            tracing::error!("camera start failed: {}", e);
                            self.running = false;
                            self.last_error = Some(e.to_string());
                        }
                    }
                }
                Command::Stop => {
                    self.running = false;
                    self.pipeline.release_camera();
                    self.pipeline.reset();
                }
                Command::Reset => self.pipeline.reset(),
                Command::ConnectScale { port, baud } => {
                    match self.pipeline.connect_scale(&port, baud) {
                        Ok(()) => self.last_error = None,
                        Err(e) => {
                            tracing::error!("scale connect failed: {}", e);
                            self.last_error = Some(e.to_string());
                        }
                    }
                }
                Command::DisconnectScale => self.pipeline.disconnect_scale(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use crate::detector::{Detection, DetectorError};
    use crate::handoff::{HandoffError, UrlOpener};
    use async_trait::async_trait;
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tonic::Status;
    use url::Url;

    fn test_frame() -> Frame {
        let mat = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(127.0)).unwrap();
        Frame { mat }
    }

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            x1: 4.0,
            y1: 4.0,
            x2: 40.0,
            y2: 40.0,
        }
    }

    struct MockFrames {
        started: bool,
        produce: bool,
        reads: Arc<AtomicUsize>,
    }

    impl FrameSource for MockFrames {
        fn start(&mut self, _device_index: i32) -> Result<(), CameraError> {
            self.started = true;
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.produce {
                Ok(Some(test_frame()))
            } else {
                Ok(None)
            }
        }

        fn release(&mut self) {
            self.started = false;
        }

        fn is_started(&self) -> bool {
            self.started
        }
    }

    struct MockDetector {
        calls: Arc<AtomicUsize>,
        script: StdMutex<VecDeque<Result<Vec<Detection>, DetectorError>>>,
    }

    #[async_trait]
    impl Detector for MockDetector {
        async fn predict(
            &self,
            _image_data: Vec<u8>,
            _confidence_threshold: f32,
        ) -> Result<Vec<Detection>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct MockScale {
        grams: Arc<StdMutex<f64>>,
        reads: Arc<AtomicUsize>,
        connected: bool,
    }

    impl WeightSource for MockScale {
        fn connect(&mut self, _port: &str, _baud: u32) -> Result<(), ScaleError> {
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn read(&mut self) -> WeightReading {
            self.reads.fetch_add(1, Ordering::SeqCst);
            WeightReading {
                grams: *self.grams.lock().unwrap(),
            }
        }
    }

    struct RecordingOpener {
        opened: Arc<StdMutex<Vec<String>>>,
    }

    impl UrlOpener for RecordingOpener {
        fn open(&self, url: &Url) -> Result<(), HandoffError> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct Harness {
        frame_reads: Arc<AtomicUsize>,
        detector_calls: Arc<AtomicUsize>,
        scale_reads: Arc<AtomicUsize>,
        grams: Arc<StdMutex<f64>>,
        opened: Arc<StdMutex<Vec<String>>>,
    }

    fn new_harness() -> Harness {
        Harness {
            frame_reads: Arc::new(AtomicUsize::new(0)),
            detector_calls: Arc::new(AtomicUsize::new(0)),
            scale_reads: Arc::new(AtomicUsize::new(0)),
            grams: Arc::new(StdMutex::new(152.3)),
            opened: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn pipeline_with(
        produce_frames: bool,
        script: Vec<Result<Vec<Detection>, DetectorError>>,
    ) -> (AcquisitionPipeline, Harness) {
        let harness = new_harness();
        let frames = Box::new(MockFrames {
            started: true,
            produce: produce_frames,
            reads: harness.frame_reads.clone(),
        });
        pipeline_with_frames(frames, script, harness)
    }

    fn pipeline_with_frames(
        frames: Box<dyn FrameSource>,
        script: Vec<Result<Vec<Detection>, DetectorError>>,
        harness: Harness,
    ) -> (AcquisitionPipeline, Harness) {
        let detector = Arc::new(MockDetector {
            calls: harness.detector_calls.clone(),
            script: StdMutex::new(script.into()),
        });
        let scale = Box::new(MockScale {
            grams: harness.grams.clone(),
            reads: harness.scale_reads.clone(),
            connected: true,
        });
        let notifier = HandoffNotifier::new(
            Url::parse("https://calory-station.vercel.app/dish-recognition.html").unwrap(),
            Box::new(RecordingOpener {
                opened: harness.opened.clone(),
            }),
        );

        let pipeline = AcquisitionPipeline::new(frames, detector, scale, notifier, 0.25);
        (pipeline, harness)
    }

    #[tokio::test]
    async fn missing_frame_is_reported_without_a_detector_call() {
        let (mut pipeline, harness) = pipeline_with(false, vec![]);

        let snapshot = pipeline.tick().await;

        assert_eq!(snapshot.phase, Phase::Scanning);
        assert_eq!(snapshot.status, StatusKind::NoFrame);
        assert!(snapshot.frame.is_none());
        assert_eq!(harness.detector_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_detection_set_keeps_scanning() {
        let (mut pipeline, _harness) = pipeline_with(true, vec![Ok(Vec::new())]);

        let snapshot = pipeline.tick().await;

        assert_eq!(snapshot.phase, Phase::Scanning);
        assert_eq!(snapshot.status, StatusKind::WaitingForObject);
        assert!(snapshot.frame.is_some());
        assert!(!pipeline.is_locked());
    }

    #[tokio::test]
    async fn first_detection_locks_and_opens_detail_page() {
        let (mut pipeline, harness) = pipeline_with(
            true,
            vec![Ok(vec![detection("banana", 0.91), detection("tomato", 0.85)])],
        );

        let snapshot = pipeline.tick().await;

        assert_eq!(snapshot.phase, Phase::Locked);
        assert_eq!(snapshot.label.as_deref(), Some("banana"));
        assert_eq!(snapshot.display_name.as_deref(), Some("香蕉"));
        assert_eq!(snapshot.episode, Some(1));
        assert!(snapshot.redirect_issued);
        assert!(snapshot.frame.is_some());

        let url = snapshot.detail_url.unwrap();
        assert!(url.contains("name=%E9%A6%99%E8%95%89"));
        assert!(url.contains("weight=152.30"));
        assert_eq!(harness.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn locked_pipeline_stops_touching_camera_and_detector() {
        let (mut pipeline, harness) =
            pipeline_with(true, vec![Ok(vec![detection("banana", 0.91)])]);

        pipeline.tick().await;
        let frame_reads = harness.frame_reads.load(Ordering::SeqCst);
        let detector_calls = harness.detector_calls.load(Ordering::SeqCst);
        let scale_reads = harness.scale_reads.load(Ordering::SeqCst);

        for _ in 0..3 {
            let snapshot = pipeline.tick().await;
            assert_eq!(snapshot.phase, Phase::Locked);
        }

        assert_eq!(harness.frame_reads.load(Ordering::SeqCst), frame_reads);
        assert_eq!(harness.detector_calls.load(Ordering::SeqCst), detector_calls);
        // The scale keeps being sampled every tick.
        assert_eq!(harness.scale_reads.load(Ordering::SeqCst), scale_reads + 3);
        // One redirect per episode, no matter how many locked ticks pass.
        assert_eq!(harness.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn locked_weight_follows_the_scale() {
        let (mut pipeline, harness) =
            pipeline_with(true, vec![Ok(vec![detection("tomato", 0.8)])]);

        let locked = pipeline.tick().await;
        assert!(locked.detail_url.unwrap().contains("weight=152.30"));

        *harness.grams.lock().unwrap() = 160.0;
        let next = pipeline.tick().await;
        assert_eq!(next.weight.grams, 160.0);
        assert!(next.detail_url.unwrap().contains("weight=160.00"));
    }

    #[tokio::test]
    async fn detector_failure_only_skips_one_tick() {
        let (mut pipeline, _harness) = pipeline_with(
            true,
            vec![
                Err(DetectorError::from(Status::internal("model crashed"))),
                Ok(vec![detection("mush", 0.7)]),
            ],
        );

        let first = pipeline.tick().await;
        assert_eq!(first.phase, Phase::Scanning);
        assert_eq!(first.status, StatusKind::WaitingForObject);
        assert!(!pipeline.is_locked());

        let second = pipeline.tick().await;
        assert_eq!(second.phase, Phase::Locked);
        assert_eq!(second.display_name.as_deref(), Some("蘑菇"));
    }

    #[tokio::test]
    async fn reset_clears_the_lock_and_rearms_the_handoff() {
        let (mut pipeline, harness) = pipeline_with(
            true,
            vec![
                Ok(vec![detection("banana", 0.9)]),
                Ok(vec![detection("banana", 0.9)]),
            ],
        );

        let locked = pipeline.tick().await;
        assert_eq!(locked.episode, Some(1));
        assert_eq!(harness.opened.lock().unwrap().len(), 1);

        pipeline.reset();
        assert!(!pipeline.is_locked());

        let relocked = pipeline.tick().await;
        assert_eq!(relocked.phase, Phase::Locked);
        assert_eq!(relocked.episode, Some(2));
        assert_eq!(harness.opened.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn standby_tick_polls_scale_but_not_camera() {
        let (mut pipeline, harness) = pipeline_with(true, vec![]);

        let snapshot = pipeline.standby_tick();

        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(snapshot.weight.grams, 152.3);
        assert!(snapshot.scale_connected);
        assert_eq!(harness.frame_reads.load(Ordering::SeqCst), 0);
        assert_eq!(harness.scale_reads.load(Ordering::SeqCst), 1);
    }

    struct FailingFrames;

    impl FrameSource for FailingFrames {
        fn start(&mut self, device_index: i32) -> Result<(), CameraError> {
            Err(CameraError::DeviceUnavailable(device_index))
        }

        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            Ok(None)
        }

        fn release(&mut self) {}

        fn is_started(&self) -> bool {
            false
        }
    }

    fn runner_for(pipeline: AcquisitionPipeline) -> PipelineRunner {
        let camera_config = CameraConfig {
            device_index: 0,
            frame_width: 640,
            frame_height: 480,
            frame_rate: 30,
            tick_ms: 30,
            stream_fps: 30,
            autostart: false,
        };
        PipelineRunner::new(
            pipeline,
            Arc::new(PlMutex::new(Snapshot::startup())),
            Arc::new(PlMutex::new(VecDeque::new())),
            Arc::new(Metrics::new()),
            &camera_config,
        )
    }

    #[tokio::test]
    async fn start_command_failure_keeps_pipeline_stopped() {
        let (pipeline, _harness) =
            pipeline_with_frames(Box::new(FailingFrames), vec![], new_harness());
        let mut runner = runner_for(pipeline);

        runner.commands.lock().push_back(Command::Start {
            camera_index: Some(9),
            confidence_threshold: None,
        });
        runner.apply_commands();

        assert!(!runner.running);
        assert!(runner
            .last_error
            .as_deref()
            .unwrap()
            .contains("Camera 9 is not available"));
    }

    #[tokio::test]
    async fn stop_command_releases_camera_and_clears_lock() {
        let (pipeline, _harness) =
            pipeline_with(true, vec![Ok(vec![detection("banana", 0.9)])]);
        let mut runner = runner_for(pipeline);

        runner.commands.lock().push_back(Command::Start {
            camera_index: None,
            confidence_threshold: None,
        });
        runner.apply_commands();
        assert!(runner.running);

        runner.pipeline.tick().await;
        assert!(runner.pipeline.is_locked());

        runner.commands.lock().push_back(Command::Stop);
        runner.apply_commands();

        assert!(!runner.running);
        assert!(!runner.pipeline.is_locked());
    }
}
