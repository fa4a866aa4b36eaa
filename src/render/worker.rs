//! Background CPU rendering.
//!
//! Keeps blocking path tracing off the thread that owns the GPU context.
//! Requests are queued over a channel; when several arrive while a render
//! is running only the newest one is rendered next. Every request carries
//! its own stop flag, and a new request stops the one before it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::camera::Camera;
use super::cpu::CpuRenderer;
use super::scene::Scene;
use super::RenderSettings;
use crate::util::Error;

/// Commands sent to the worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Render a frame tagged with `epoch`; `stop` aborts this job only.
    Render { epoch: u64, scene: Arc<Scene>, camera: Camera, settings: RenderSettings, stop: Arc<AtomicBool> },
    /// Stop the worker thread.
    Stop,
}

/// Results sent back from the worker.
#[derive(Debug)]
pub enum WorkerResult {
    Progress { epoch: u64, rows: u32, height: u32 },
    Finished { epoch: u64, pixels: Vec<f32>, settings: RenderSettings, elapsed: Duration },
    Cancelled { epoch: u64 },
    Failed { epoch: u64, error: Error },
}

impl WorkerResult {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Progress { epoch, .. }
            | Self::Finished { epoch, .. }
            | Self::Cancelled { epoch }
            | Self::Failed { epoch, .. } => *epoch,
        }
    }
}

/// Handle to the background render thread.
pub struct CpuWorker {
    tx: Sender<WorkerCommand>,
    rx: Receiver<WorkerResult>,
    /// Stop flag of the latest request
    stop: Arc<AtomicBool>,
    next_epoch: u64,
    handle: Option<JoinHandle<()>>,
}

impl CpuWorker {
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = channel::<WorkerCommand>();
        let (res_tx, res_rx) = channel::<WorkerResult>();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = thread::Builder::new()
            .name("cpu-render".into())
            .spawn(move || worker_loop(cmd_rx, res_tx))
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn cpu render thread");
        }

        Self { tx: cmd_tx, rx: res_rx, stop, next_epoch: 0, handle }
    }

    /// Queue a render and return its epoch. The previous request is stopped.
    pub fn request(&mut self, scene: Arc<Scene>, camera: Camera, settings: RenderSettings) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.stop = Arc::new(AtomicBool::new(false));
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let stop = Arc::clone(&self.stop);
        let _ = self.tx.send(WorkerCommand::Render { epoch, scene, camera, settings, stop });
        epoch
    }

    /// Abort the latest render at the next pixel or sample boundary.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Non-blocking.
    pub fn try_recv(&self) -> Option<WorkerResult> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerResult> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Stop the worker and wait for it to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.tx.send(WorkerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpuWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Job {
    epoch: u64,
    scene: Arc<Scene>,
    camera: Camera,
    settings: RenderSettings,
    stop: Arc<AtomicBool>,
}

fn worker_loop(rx: Receiver<WorkerCommand>, tx: Sender<WorkerResult>) {
    while let Ok(cmd) = rx.recv() {
        let WorkerCommand::Render { epoch, scene, camera, settings, stop } = cmd else {
            break;
        };
        let (job, stop_requested) = drain_to_latest(&rx, Job { epoch, scene, camera, settings, stop });

        let epoch = job.epoch;
        let start = Instant::now();
        let progress_tx = tx.clone();
        let report = move |rows: u32, height: u32| {
            let _ = progress_tx.send(WorkerResult::Progress { epoch, rows, height });
        };
        let report: &(dyn Fn(u32, u32) + Sync) = &report;

        let result = match CpuRenderer::render(&job.scene, &job.camera, &job.settings, &job.stop, Some(report)) {
            Ok(pixels) => WorkerResult::Finished { epoch, pixels, settings: job.settings, elapsed: start.elapsed() },
            Err(Error::Cancelled) => {
                tracing::debug!(epoch, "cpu render cancelled");
                WorkerResult::Cancelled { epoch }
            }
            Err(error) => WorkerResult::Failed { epoch, error },
        };
        if tx.send(result).is_err() || stop_requested {
            break;
        }
    }
}

/// Drain queued commands, keeping only the newest render request.
fn drain_to_latest(rx: &Receiver<WorkerCommand>, mut job: Job) -> (Job, bool) {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WorkerCommand::Render { epoch, scene, camera, settings, stop } => {
                job = Job { epoch, scene, camera, settings, stop };
            }
            WorkerCommand::Stop => return (job, true),
        }
    }
    (job, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(worker: &CpuWorker) -> WorkerResult {
        loop {
            match worker.recv_timeout(Duration::from_secs(30)) {
                Some(WorkerResult::Progress { .. }) => continue,
                Some(r) => return r,
                None => panic!("worker timed out"),
            }
        }
    }

    #[test]
    fn test_worker_renders() {
        let mut worker = CpuWorker::spawn();
        let settings = RenderSettings::new(8, 4, 1).with_max_depth(2);
        let epoch = worker.request(Arc::new(Scene::demo()), Camera::demo(2.0), settings);
        match finished(&worker) {
            WorkerResult::Finished { epoch: e, pixels, .. } => {
                assert_eq!(e, epoch);
                assert_eq!(pixels.len(), 8 * 4 * 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_worker_cancel() {
        let mut worker = CpuWorker::spawn();
        let settings = RenderSettings::new(256, 256, 4096);
        let epoch = worker.request(Arc::new(Scene::demo()), Camera::demo(1.0), settings);
        worker.cancel();
        let r = finished(&worker);
        assert!(matches!(r, WorkerResult::Cancelled { .. }), "{r:?}");
        assert_eq!(r.epoch(), epoch);
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_cancelled_job_stays_cancelled() {
        let mut worker = CpuWorker::spawn();
        let heavy = RenderSettings::new(256, 256, 4096);
        let first = worker.request(Arc::new(Scene::demo()), Camera::demo(1.0), heavy);
        worker.cancel();
        let light = RenderSettings::new(8, 4, 1).with_max_depth(2);
        let second = worker.request(Arc::new(Scene::demo()), Camera::demo(2.0), light);

        loop {
            match finished(&worker) {
                WorkerResult::Finished { epoch, .. } => {
                    assert_eq!(epoch, second);
                    break;
                }
                WorkerResult::Cancelled { epoch } => assert_eq!(epoch, first),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_new_request_stops_previous() {
        let mut worker = CpuWorker::spawn();
        let heavy = RenderSettings::new(256, 256, 4096);
        let first = worker.request(Arc::new(Scene::demo()), Camera::demo(1.0), heavy);
        thread::sleep(Duration::from_millis(20));
        let light = RenderSettings::new(8, 4, 1).with_max_depth(2);
        let second = worker.request(Arc::new(Scene::demo()), Camera::demo(2.0), light);

        loop {
            match finished(&worker) {
                WorkerResult::Finished { epoch, .. } => {
                    assert_eq!(epoch, second);
                    break;
                }
                WorkerResult::Cancelled { epoch } => assert_eq!(epoch, first),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
