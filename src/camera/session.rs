//! Streaming capture session
//!
//! Owns one device handle for its lifetime, polls it from a blocking worker
//! and publishes the latest encoded frame into a shared slot that any
//! number of readers may query without blocking the capture path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::{Backend, DeviceOpener, FrameEncoder, FrameSource, StreamProfile};
use super::encoder::TurboJpegEncoder;
use super::v4l2::V4l2Opener;
use crate::config::CaptureConfig;
use crate::error::{CameraError, Result};
use crate::utils::LogThrottler;

/// Backend used for streaming and high-resolution handles
const STREAM_BACKEND: Backend = Backend::V4l2;
/// Time the device gets to settle after a high-resolution reconfigure
const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Minimum interval between repeated read/reconnect failure log lines
const FAILURE_LOG_SECS: u64 = 5;

/// A camera streaming session
///
/// Lifecycle transitions (`start`, `stop`, `capture_high_res`) must be
/// serialized by the caller; `get_frame` is safe from any thread at any
/// time.
pub struct CameraSession {
    config: CaptureConfig,
    opener: Arc<dyn DeviceOpener>,
    encoder: Arc<dyn FrameEncoder>,
    running: AtomicBool,
    /// Latest encoded frame; `None` until the first successful poll cycle
    frame_slot: Arc<Mutex<Option<Bytes>>>,
    poll_task: tokio::sync::Mutex<Option<PollTask>>,
}

/// One spawned polling loop and the stop flag that belongs to it
///
/// Every `start` creates a fresh flag, so a loop that outlived a `stop`
/// join timeout stays cancelled and cannot be revived by a later `start`.
struct PollTask {
    active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CameraSession {
    /// Create a session over the real V4L2 device layer
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_backend(config, Arc::new(V4l2Opener), Arc::new(TurboJpegEncoder::new()))
    }

    /// Create a session with explicit device and codec collaborators
    pub fn with_backend(
        config: CaptureConfig,
        opener: Arc<dyn DeviceOpener>,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Self {
        Self {
            config,
            opener,
            encoder,
            running: AtomicBool::new(false),
            frame_slot: Arc::new(Mutex::new(None)),
            poll_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Whether the polling loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest published frame, if any; never blocks on the capture path
    pub fn get_frame(&self) -> Option<Bytes> {
        self.frame_slot.lock().clone()
    }

    /// Open the device and start the background polling loop
    ///
    /// No-op when already running. On any failure the handle is released
    /// and the session stays stopped.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let index = self.config.device_index;
        let profile = self.config.stream_profile();
        info!(
            "Starting camera session on device {} at {}@{}fps",
            index, profile.resolution, profile.fps
        );

        let opener = self.opener.clone();
        let source = tokio::task::spawn_blocking(move || -> Result<Box<dyn FrameSource>> {
            let mut source = opener.open(index, STREAM_BACKEND, &profile)?;
            // Validating read: a device that opens but yields no frame is
            // reported unavailable, not streamed from
            source.read().map_err(|e| {
                CameraError::DeviceUnavailable(format!(
                    "Device {index} returns no frames: {e}"
                ))
            })?;
            Ok(source)
        })
        .await
        .map_err(|e| CameraError::TaskFailure(e.to_string()))??;

        self.frame_slot.lock().take();
        self.running.store(true, Ordering::SeqCst);

        // The loop gets its own stop flag: a previous loop still draining a
        // blocking read holds an already-cleared flag and stays cancelled.
        let active = Arc::new(AtomicBool::new(true));
        let ctx = PollContext {
            index,
            profile,
            quality: self.config.stream_quality,
            reconnect_delay: self.config.reconnect_delay,
            failure_threshold: self.config.read_failure_threshold.max(1),
            opener: self.opener.clone(),
            encoder: self.encoder.clone(),
            frame_slot: self.frame_slot.clone(),
            active: active.clone(),
        };
        let handle = tokio::task::spawn_blocking(move || poll_loop(ctx, source));
        *self.poll_task.lock().await = Some(PollTask { active, handle });

        info!("Camera session on device {} started", index);
        Ok(())
    }

    /// Signal the polling loop and wait (bounded) for it to exit
    ///
    /// Idempotent. The device handle is owned by the polling loop and is
    /// released when the loop drops it; a loop that outlives the join
    /// timeout is detached, can no longer publish, and releases the handle
    /// on its next iteration.
    pub async fn stop(&self) -> Result<()> {
        let was_running = self.running.swap(false, Ordering::SeqCst);

        if let Some(task) = self.poll_task.lock().await.take() {
            task.active.store(false, Ordering::SeqCst);
            match tokio::time::timeout(self.config.stop_timeout, task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Polling task failed: {}", e),
                Err(_) => warn!(
                    "Polling task did not exit within {:?}, detaching",
                    self.config.stop_timeout
                ),
            }
        }

        if was_running {
            info!("Camera session on device {} stopped", self.config.device_index);
        }
        Ok(())
    }

    /// One-shot capture at the high-resolution profile
    ///
    /// Streaming is paused for the duration of the call and restarted
    /// afterward whether or not the capture succeeded; callers that need
    /// streaming must re-check [`is_running`](Self::is_running). The result
    /// is returned directly and never published to the frame slot.
    pub async fn capture_high_res(&self) -> Result<Bytes> {
        let was_running = self.is_running();
        if was_running {
            self.stop().await?;
        }

        let index = self.config.device_index;
        let profile = self.config.high_res_profile();
        let quality = self.config.high_res_quality;
        let opener = self.opener.clone();
        let encoder = self.encoder.clone();
        info!(
            "Capturing high-resolution photo on device {} at {}",
            index, profile.resolution
        );

        let shot = tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut source = opener
                .open(index, STREAM_BACKEND, &profile)
                .map_err(|e| CameraError::HighResCapture(e.to_string()))?;
            // Let exposure settle after the mode switch
            std::thread::sleep(SETTLE_DELAY);
            let frame = source
                .read()
                .map_err(|e| CameraError::HighResCapture(e.to_string()))?;
            encoder
                .encode(&frame, quality)
                .map_err(|e| CameraError::HighResCapture(e.to_string()))
            // Handle dropped here on success and failure alike
        })
        .await
        .map_err(|e| CameraError::TaskFailure(e.to_string()))?;

        if was_running {
            if let Err(e) = self.start().await {
                warn!(
                    "Failed to resume streaming on device {} after high-res capture: {}",
                    index, e
                );
            }
        }

        shot
    }
}

/// Everything the polling loop needs besides the handle it owns
struct PollContext {
    index: u32,
    profile: StreamProfile,
    quality: u8,
    reconnect_delay: Duration,
    failure_threshold: u32,
    opener: Arc<dyn DeviceOpener>,
    encoder: Arc<dyn FrameEncoder>,
    frame_slot: Arc<Mutex<Option<Bytes>>>,
    /// Stop flag of this loop generation, cleared by the `stop` that joins it
    active: Arc<AtomicBool>,
}

/// Main polling loop (runs on a blocking thread, owns the device handle)
///
/// A run of `failure_threshold` consecutive failed reads releases the
/// handle and moves to the reconnect schedule: sleep, reopen, repeat until
/// it succeeds or the session is stopped. The loop never exits on its own,
/// and once its flag is cleared it publishes nothing, even for a read that
/// was already in flight.
fn poll_loop(ctx: PollContext, source: Box<dyn FrameSource>) {
    let read_errors = LogThrottler::with_secs(FAILURE_LOG_SECS);
    let reconnect_errors = LogThrottler::with_secs(FAILURE_LOG_SECS);
    let mut source = Some(source);
    let mut failures = 0u32;

    while ctx.active.load(Ordering::SeqCst) {
        let Some(src) = source.as_mut() else {
            std::thread::sleep(ctx.reconnect_delay);
            if !ctx.active.load(Ordering::SeqCst) {
                break;
            }
            match ctx.opener.open(ctx.index, STREAM_BACKEND, &ctx.profile) {
                Ok(s) => {
                    info!("Reconnected to device {}", ctx.index);
                    source = Some(s);
                }
                Err(e) => {
                    if reconnect_errors.should_log() {
                        warn!("Reconnect to device {} failed: {}", ctx.index, e);
                    }
                }
            }
            continue;
        };

        match src.read() {
            Ok(frame) => {
                failures = 0;
                match ctx.encoder.encode(&frame, ctx.quality) {
                    Ok(jpeg) => {
                        // Whole-frame replacement under the lock; readers
                        // see the previous frame or this one, never a mix.
                        // The flag check under the same lock keeps a read
                        // that straddled `stop` out of the successor's slot.
                        let mut slot = ctx.frame_slot.lock();
                        if ctx.active.load(Ordering::SeqCst) {
                            *slot = Some(jpeg);
                        }
                    }
                    Err(e) => {
                        if read_errors.should_log() {
                            warn!("Encode failed on device {}: {}", ctx.index, e);
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                if read_errors.should_log() {
                    warn!("Read failed on device {}: {}", ctx.index, e);
                }
                if failures >= ctx.failure_threshold {
                    warn!(
                        "{} consecutive read failures on device {}, reconnecting",
                        failures, ctx.index
                    );
                    failures = 0;
                    // Release before reopening, the device rejects a
                    // second concurrent open
                    source = None;
                }
            }
        }
    }

    info!("Polling loop for device {} exited", ctx.index);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Instant;

    use super::*;
    use crate::camera::backend::fakes::{
        FakeOpener, FnOpener, ReadStep, SourceScript, TaggingEncoder,
    };
    use crate::camera::backend::Negotiated;
    use crate::camera::format::Resolution;
    use crate::camera::frame::RawFrame;

    const STREAM_Q: u8 = 10;
    const HIGH_Q: u8 = 90;

    fn test_config() -> CaptureConfig {
        let mut config = CaptureConfig::for_device(0)
            .with_stream_quality(STREAM_Q)
            .with_high_res(3840, 2160, HIGH_Q);
        config.reconnect_delay = Duration::from_millis(10);
        config.stop_timeout = Duration::from_millis(500);
        config
    }

    fn session_with(opener: FakeOpener) -> (CameraSession, Arc<FakeOpener>) {
        let opener = Arc::new(opener);
        let session = CameraSession::with_backend(
            test_config(),
            opener.clone(),
            Arc::new(TaggingEncoder),
        );
        (session, opener)
    }

    async fn wait_for_frame(session: &CameraSession, window: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + window;
        loop {
            if let Some(frame) = session.get_frame() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_frame_published_after_start() {
        let (session, _) = session_with(FakeOpener::new(vec![SourceScript::steady(
            Resolution::HD720,
            30,
            0x42,
        )]));

        assert!(session.get_frame().is_none());
        session.start().await.unwrap();
        assert!(session.is_running());

        let frame = wait_for_frame(&session, Duration::from_secs(2))
            .await
            .expect("no frame within window");
        // TaggingEncoder output: quality byte, then the raw payload
        assert_eq!(frame[0], STREAM_Q);
        assert!(frame[1..].iter().all(|&b| b == 0x42));

        session.stop().await.unwrap();
        assert!(!session.is_running());
        // The last published frame stays readable while stopped
        assert!(session.get_frame().is_some());
    }

    #[tokio::test]
    async fn test_start_stop_releases_exactly_once() {
        let scripts = (0..3)
            .map(|_| SourceScript::steady(Resolution::HD720, 30, 1))
            .collect();
        let (session, opener) = session_with(FakeOpener::new(scripts));

        for round in 1..=3usize {
            session.start().await.unwrap();
            session.stop().await.unwrap();
            assert_eq!(opener.open_count(), round);
            assert_eq!(opener.drop_count(), round);
        }
    }

    #[tokio::test]
    async fn test_start_is_noop_when_running() {
        let (session, opener) = session_with(FakeOpener::new(vec![SourceScript::steady(
            Resolution::HD720,
            30,
            1,
        )]));

        session.start().await.unwrap();
        session.start().await.unwrap();
        assert_eq!(opener.open_count(), 1);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (session, opener) = session_with(FakeOpener::new(vec![SourceScript::steady(
            Resolution::HD720,
            30,
            1,
        )]));

        session.start().await.unwrap();
        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert_eq!(opener.drop_count(), 1);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_open_failure_reports_unavailable() {
        let (session, opener) = session_with(FakeOpener::unavailable());

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)), "{err}");
        assert!(!session.is_running());
        assert_eq!(opener.drop_count(), 0);
    }

    #[tokio::test]
    async fn test_validating_read_failure_releases_handle() {
        let (session, opener) =
            session_with(FakeOpener::new(vec![SourceScript::failing(Resolution::HD720)]));

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)), "{err}");
        assert!(!session.is_running());
        // Opened once, released once, loop never spawned
        assert_eq!(opener.open_count(), 1);
        assert_eq!(opener.drop_count(), 1);
        assert!(session.get_frame().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_after_failure_threshold() {
        // First handle survives the validating read, then every read
        // fails; the replacement streams cleanly
        let broken = SourceScript {
            negotiated: Negotiated {
                resolution: Resolution::HD720,
                fps: 30,
            },
            steps: VecDeque::from([ReadStep::Frame(RawFrame::from_vec(
                vec![7; 4096],
                Resolution::HD720,
            ))]),
            fallback: ReadStep::Fail,
            read_delay: Duration::ZERO,
        };
        let healthy = SourceScript::steady(Resolution::HD720, 30, 0x55);
        let (session, opener) = session_with(FakeOpener::new(vec![broken, healthy]));

        session.start().await.unwrap();
        let frame = wait_for_frame(&session, Duration::from_secs(2))
            .await
            .expect("never recovered after reconnect");
        assert!(frame[1..].iter().all(|&b| b == 0x55));

        // One reconnect for the whole failure streak, not one per read
        assert_eq!(opener.open_count(), 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opener.open_count(), 2);
        assert!(session.is_running());

        session.stop().await.unwrap();
        assert_eq!(opener.drop_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_retrying_until_stopped() {
        // Only the initial handle exists; every reconnect attempt fails
        let broken = SourceScript {
            negotiated: Negotiated {
                resolution: Resolution::HD720,
                fps: 30,
            },
            steps: VecDeque::from([ReadStep::Frame(RawFrame::from_vec(
                vec![7; 4096],
                Resolution::HD720,
            ))]),
            fallback: ReadStep::Fail,
            read_delay: Duration::ZERO,
        };
        let (session, opener) = session_with(FakeOpener::new(vec![broken]));

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Still nominally running: the session never stops on its own
        assert!(session.is_running());
        assert!(opener.open_log.lock().len() >= 3);

        session.stop().await.unwrap();
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_capture_high_res_pauses_and_resumes() {
        let stream_one = SourceScript::steady(Resolution::HD720, 30, 0x01);
        let high_res = SourceScript::steady(Resolution::UHD4K, 30, 0x09);
        let stream_two = SourceScript::steady(Resolution::HD720, 30, 0x02);
        let (session, opener) = session_with(FakeOpener::new(vec![stream_one, high_res, stream_two]));

        session.start().await.unwrap();
        wait_for_frame(&session, Duration::from_secs(2)).await.unwrap();

        let shot = session.capture_high_res().await.unwrap();
        assert_eq!(shot[0], HIGH_Q);
        assert!(shot[1..].iter().all(|&b| b == 0x09));

        // Streaming handle and high-res handle both released during the call
        assert!(opener.drop_count() >= 2);
        assert!(session.is_running());

        // The restart cleared the slot, so the next frame comes from the
        // replacement handle
        let frame = wait_for_frame(&session, Duration::from_secs(2))
            .await
            .expect("streaming did not resume");
        assert_eq!(frame[0], STREAM_Q);
        assert!(frame[1..].iter().all(|&b| b == 0x02));

        session.stop().await.unwrap();
        assert_eq!(opener.drop_count(), 3);
    }

    #[tokio::test]
    async fn test_capture_high_res_failure_still_restarts() {
        let stream_one = SourceScript::steady(Resolution::HD720, 30, 0x01);
        let high_res = SourceScript::failing(Resolution::UHD4K);
        let stream_two = SourceScript::steady(Resolution::HD720, 30, 0x02);
        let (session, _) = session_with(FakeOpener::new(vec![stream_one, high_res, stream_two]));

        session.start().await.unwrap();
        let err = session.capture_high_res().await.unwrap_err();
        assert!(matches!(err, CameraError::HighResCapture(_)), "{err}");

        // Restart is attempted regardless of the capture outcome
        assert!(session.is_running());
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_high_res_while_stopped() {
        let high_res = SourceScript::steady(Resolution::UHD4K, 30, 0x09);
        let (session, _) = session_with(FakeOpener::new(vec![high_res]));

        let shot = session.capture_high_res().await.unwrap();
        assert_eq!(shot[0], HIGH_Q);
        // Was stopped before, stays stopped after
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_outlived_loop_cannot_publish_or_poll_again() {
        // A handle whose reads outlast the stop timeout: `stop` detaches
        // the loop mid-read, and a later `start` must not let it publish
        // its in-flight frame or resume polling the old handle.
        let slow = SourceScript::steady(Resolution::HD720, 30, 0xAA)
            .with_read_delay(Duration::from_millis(400));
        let fast = SourceScript::steady(Resolution::HD720, 30, 0xBB);
        let mut config = test_config();
        config.stop_timeout = Duration::from_millis(50);
        let opener = Arc::new(FakeOpener::new(vec![slow, fast]));
        let session =
            CameraSession::with_backend(config, opener.clone(), Arc::new(TaggingEncoder));

        session.start().await.unwrap();
        session.stop().await.unwrap();
        session.start().await.unwrap();

        // Sample well past the slow read's completion: only the
        // replacement handle's frames may ever appear
        let deadline = Instant::now() + Duration::from_millis(900);
        let mut saw_replacement = false;
        while Instant::now() < deadline {
            if let Some(frame) = session.get_frame() {
                assert!(
                    frame[1..].iter().all(|&b| b == 0xBB),
                    "frame from the detached loop reached the slot"
                );
                saw_replacement = true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_replacement);

        // The detached loop exited on its own and released the old handle
        assert_eq!(opener.drop_count(), 1);
        session.stop().await.unwrap();
        assert_eq!(opener.drop_count(), 2);
    }

    /// Frame source whose payload value changes every read, so a torn
    /// write would show up as a mixed-value frame
    struct CyclingSource {
        value: u8,
    }

    impl crate::camera::backend::FrameSource for CyclingSource {
        fn negotiated(&self) -> Negotiated {
            Negotiated {
                resolution: Resolution::HD720,
                fps: 30,
            }
        }

        fn read(&mut self) -> Result<RawFrame> {
            self.value = self.value.wrapping_add(1);
            Ok(RawFrame::from_vec(vec![self.value; 4096], Resolution::HD720))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_observe_torn_frames() {
        let opener = Arc::new(FnOpener(|_: u32, _: Backend, _: &StreamProfile| {
            Ok(Box::new(CyclingSource { value: 0 }) as Box<dyn FrameSource>)
        }));
        let session = Arc::new(CameraSession::with_backend(
            test_config(),
            opener,
            Arc::new(TaggingEncoder),
        ));

        session.start().await.unwrap();
        wait_for_frame(&session, Duration::from_secs(2)).await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let session = session.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    if let Some(frame) = session.get_frame() {
                        assert_eq!(frame.len(), 4097);
                        assert_eq!(frame[0], STREAM_Q);
                        let value = frame[1];
                        assert!(
                            frame[1..].iter().all(|&b| b == value),
                            "torn frame observed"
                        );
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for reader in readers {
            reader.await.unwrap();
        }

        session.stop().await.unwrap();
    }

    #[test]
    fn test_get_frame_on_fresh_session() {
        let session = CameraSession::with_backend(
            test_config(),
            Arc::new(FakeOpener::unavailable()),
            Arc::new(TaggingEncoder),
        );
        assert!(session.get_frame().is_none());
        assert!(!session.is_running());
        // Stop before start is a no-op
        tokio_test::block_on(session.stop()).unwrap();
    }
}
