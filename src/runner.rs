//! The two-thread runtime around the pipeline core.
//!
//! A capture thread blocks on the packet source and feeds the bounded
//! drop-oldest queue; the pipeline thread drains it and owns all meter
//! state. Control inputs travel over a channel and are applied between
//! packets. Shutdown is a flag polled at the queue boundary: the capture
//! thread exits within one poll tick, the pipeline drains what is queued,
//! freezes the live session, and publishes a final snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::capture::{capture_queue, ClockDomain, PacketSource, Pop, QueueReceiver};
use crate::config::Config;
use crate::meter::{Mode, Snapshot, SortKey};
use crate::pipeline::Pipeline;

const POLL_TICK: Duration = Duration::from_secs(1);

enum Control {
    SetMode(Mode),
    ManualToggle,
    ArchiveNow,
    ResetFame,
    SeedSelf {
        name: Option<String>,
        id: Option<u32>,
    },
    SetSort(SortKey),
}

pub struct MeterHandle {
    shutdown: Arc<AtomicBool>,
    ctrl_tx: Sender<Control>,
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
    capture_thread: Option<JoinHandle<()>>,
    pipeline_thread: Option<JoinHandle<()>>,
}

impl MeterHandle {
    /// Latest published snapshot. Cheap: one read lock and an `Arc` clone.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_mode(&self, mode: Mode) {
        let _ = self.ctrl_tx.send(Control::SetMode(mode));
    }

    pub fn manual_toggle(&self) {
        let _ = self.ctrl_tx.send(Control::ManualToggle);
    }

    pub fn archive_now(&self) {
        let _ = self.ctrl_tx.send(Control::ArchiveNow);
    }

    pub fn reset_fame(&self) {
        let _ = self.ctrl_tx.send(Control::ResetFame);
    }

    pub fn seed_self(&self, name: Option<String>, id: Option<u32>) {
        let _ = self.ctrl_tx.send(Control::SeedSelf { name, id });
    }

    pub fn set_sort(&self, sort: SortKey) {
        let _ = self.ctrl_tx.send(Control::SetSort(sort));
    }

    /// True once both threads have exited (replay exhausted or shutdown).
    pub fn is_finished(&self) -> bool {
        self.pipeline_thread
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Request shutdown and wait for both threads. Returns the final
    /// snapshot; archived history is preserved inside it.
    pub fn shutdown(mut self) -> Arc<Snapshot> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.pipeline_thread.take() {
            let _ = handle.join();
        }
        self.snapshot()
    }

    /// Wait for a replay to finish on its own, then collect the final
    /// snapshot.
    pub fn wait(mut self) -> Arc<Snapshot> {
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.pipeline_thread.take() {
            let _ = handle.join();
        }
        self.snapshot()
    }
}

/// Spawn the capture and pipeline threads around a packet source.
pub fn spawn(mut source: Box<dyn PacketSource>, config: &Config) -> MeterHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let clock = source.clock();
    let (queue_tx, queue_rx) = capture_queue(config.limits.capture_queue_capacity);
    let (ctrl_tx, ctrl_rx) = unbounded();

    let capture_shutdown = shutdown.clone();
    let capture_thread = std::thread::Builder::new()
        .name("pm-capture".into())
        .spawn(move || {
            while !capture_shutdown.load(Ordering::SeqCst) {
                match source.next_packet() {
                    Ok(Some(packet)) => queue_tx.push(packet),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "capture source failed");
                        break;
                    }
                }
            }
            // Dropping the sender tells the pipeline the stream is over.
        })
        .expect("spawn capture thread");

    let mut pipeline = Pipeline::new(config);
    let snapshot = pipeline.snapshot_handle();
    let pipeline_shutdown = shutdown.clone();
    let pipeline_thread = std::thread::Builder::new()
        .name("pm-pipeline".into())
        .spawn(move || run_pipeline(pipeline, queue_rx, ctrl_rx, pipeline_shutdown, clock))
        .expect("spawn pipeline thread");

    MeterHandle {
        shutdown,
        ctrl_tx,
        snapshot,
        capture_thread: Some(capture_thread),
        pipeline_thread: Some(pipeline_thread),
    }
}

fn run_pipeline(
    mut pipeline: Pipeline,
    queue_rx: QueueReceiver,
    ctrl_rx: Receiver<Control>,
    shutdown: Arc<AtomicBool>,
    clock: ClockDomain,
) {
    loop {
        while let Ok(control) = ctrl_rx.try_recv() {
            apply_control(&mut pipeline, control);
        }

        match queue_rx.pop(POLL_TICK) {
            Pop::Packet(packet) => {
                pipeline.set_capture_drops(queue_rx.dropped_total());
                pipeline.handle_packet(&packet);
            }
            Pop::Timeout => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                // Only a wall-clock source shares the wall's timeline. On a
                // file clock, time stands still between packets; injecting
                // wall time would corrupt elapsed times and fire spurious
                // idle timeouts.
                if clock == ClockDomain::Wall {
                    pipeline.idle_tick(wall_epoch_s());
                }
            }
            Pop::Disconnected => break,
        }
    }

    // Drain whatever the capture thread managed to queue before exiting.
    for packet in queue_rx.drain() {
        pipeline.set_capture_drops(queue_rx.dropped_total());
        pipeline.handle_packet(&packet);
    }
    pipeline.finalize();
}

fn apply_control(pipeline: &mut Pipeline, control: Control) {
    match control {
        Control::SetMode(mode) => pipeline.set_mode(mode),
        Control::ManualToggle => {
            pipeline.manual_toggle();
        }
        Control::ArchiveNow => pipeline.archive_now(),
        Control::ResetFame => pipeline.reset_fame(),
        Control::SeedSelf { name, id } => pipeline.seed_self(name, id),
        Control::SetSort(sort) => pipeline.set_sort(sort),
    }
}

fn wall_epoch_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
