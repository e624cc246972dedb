//! Fixed-size pool of pixel-conversion workers.
//!
//! Each worker owns a private engine adapter and transform cache and holds a
//! slot for the shared profiles. The scheduler broadcasts
//! `SetSharedProfiles` once per batch; after every worker acknowledged,
//! per-task messages omit the bulk profile bytes and workers fill the gaps
//! from their shared slot. Task buffers are moved through the channels, so
//! no pixel bytes are copied on dispatch.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use crate::buffer::BufferConverter;
use crate::diag::{ContextKind, LogContext};
use crate::engine::{BuiltinProfile, ProfileHandle, RenderingIntent};
use crate::errors::{ConvertError, ConvertResult};
use crate::image::{convert_image, ConvertedImage, ImageChain, ImageConvertSettings, ImageRecord};
use crate::utils::CancelToken;

/// Profile material carried by a task: raw ICC bytes (shared immutably via
/// `Arc`) or an engine builtin.
#[derive(Debug, Clone)]
pub enum ProfileSpec {
    Bytes(Arc<Vec<u8>>),
    Builtin(BuiltinProfile),
}

impl ProfileSpec {
    /// Opens the profile in the given converter, memoizing byte profiles by
    /// allocation identity so repeated tasks reuse one handle.
    fn resolve(
        &self,
        converter: &mut BufferConverter,
        bytes_cache: &mut HashMap<usize, ProfileHandle>,
    ) -> ConvertResult<ProfileHandle> {
        match self {
            ProfileSpec::Builtin(kind) => converter.builtin(*kind),
            ProfileSpec::Bytes(bytes) => {
                let key = Arc::as_ptr(bytes) as usize;
                if let Some(&handle) = bytes_cache.get(&key) {
                    return Ok(handle);
                }
                let handle = converter.engine_mut().open_profile(bytes)?;
                bytes_cache.insert(key, handle);
                Ok(handle)
            }
        }
    }
}

/// One-shot broadcast payload: destination and intermediates plus the
/// settings tasks inherit.
#[derive(Debug, Clone)]
pub struct SharedProfiles {
    pub destination: Arc<Vec<u8>>,
    pub intermediates: Vec<Arc<Vec<u8>>>,
    pub intent: RenderingIntent,
    pub black_point_compensation: bool,
    pub adaptive_bpc_clamping: bool,
    pub output_bits_per_component: Option<u8>,
}

/// Per-task chain spec. `None` fields resolve from the worker's shared
/// slot (`task.field ?? shared.field`).
#[derive(Debug, Clone)]
pub struct ChainSpec {
    pub source: ProfileSpec,
    pub destination: Option<Arc<Vec<u8>>>,
    pub intermediates: Option<Vec<Arc<Vec<u8>>>>,
    pub intent: Option<RenderingIntent>,
    pub black_point_compensation: Option<bool>,
    pub adaptive_bpc_clamping: Option<bool>,
    pub output_bits_per_component: Option<u8>,
}

impl ChainSpec {
    /// A spec that inherits everything except the source profile.
    pub fn inherit(source: ProfileSpec) -> Self {
        ChainSpec {
            source,
            destination: None,
            intermediates: None,
            intent: None,
            black_point_compensation: None,
            adaptive_bpc_clamping: None,
            output_bits_per_component: None,
        }
    }
}

#[derive(Debug)]
pub struct ImageTask {
    pub id: u64,
    pub record: ImageRecord,
    pub chain: ChainSpec,
}

enum WorkerMessage {
    SetSharedProfiles(Arc<SharedProfiles>),
    Task(Box<ImageTask>),
    Shutdown,
}

/// Reply for one finished task. `requeue` carries the task back when it can
/// be retried on another worker (worker crash).
pub struct WorkerReply {
    pub worker: usize,
    pub task_id: u64,
    pub result: Result<ConvertedImage, ConvertError>,
    pub requeue: Option<Box<ImageTask>>,
    pub pixels: u64,
    pub duration_ms: f64,
}

enum WorkerEvent {
    SharedAck { worker: usize },
    TaskDone(WorkerReply),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Uninitialized,
    Ready,
    Working,
    Idle,
}

struct SharedSlot {
    profiles: Arc<SharedProfiles>,
    destination: ProfileHandle,
    intermediates: Vec<ProfileHandle>,
}

fn worker_loop(
    index: usize,
    rx: Receiver<WorkerMessage>,
    tx: Sender<WorkerEvent>,
    cancel: CancelToken,
) {
    let ctx = LogContext::new(ContextKind::Worker(index as u8));
    let mut converter = BufferConverter::new(ctx.clone());
    let mut bytes_cache: HashMap<usize, ProfileHandle> = HashMap::new();
    let mut shared: Option<SharedSlot> = None;
    let mut state = WorkerState::Uninitialized;

    debug!("[{}] worker started", ctx.prefix());

    for message in rx.iter() {
        match message {
            WorkerMessage::SetSharedProfiles(profiles) => {
                // Replace the previous batch's shared handles, if any.
                if let Some(old) = shared.take() {
                    converter.engine_mut().close_profile(old.destination);
                    for handle in old.intermediates {
                        converter.engine_mut().close_profile(handle);
                    }
                }
                let resolved = open_shared(&mut converter, &profiles);
                match resolved {
                    Ok((destination, intermediates)) => {
                        shared = Some(SharedSlot {
                            profiles,
                            destination,
                            intermediates,
                        });
                        state = WorkerState::Ready;
                    }
                    Err(e) => {
                        warn!("[{}] failed to open shared profiles: {e}", ctx.prefix());
                        state = WorkerState::Uninitialized;
                    }
                }
                debug!("[{}] shared profiles set, state {state:?}", ctx.prefix());
                let _ = tx.send(WorkerEvent::SharedAck { worker: index });
            }
            WorkerMessage::Task(task) => {
                if cancel.is_canceled() {
                    // Queued tasks drop on cancellation.
                    let _ = tx.send(WorkerEvent::TaskDone(WorkerReply {
                        worker: index,
                        task_id: task.id,
                        result: Err(ConvertError::Canceled),
                        requeue: None,
                        pixels: 0,
                        duration_ms: 0.0,
                    }));
                    continue;
                }
                state = WorkerState::Working;
                log::trace!("[{}] task {} picked up, state {state:?}", ctx.prefix(), task.id);
                let started = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    process_task(&task, shared.as_ref(), &mut converter, &mut bytes_cache)
                }));
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                let reply = match outcome {
                    Ok(Ok(converted)) => WorkerReply {
                        worker: index,
                        task_id: task.id,
                        pixels: converted.pixel_count as u64,
                        result: Ok(converted),
                        requeue: None,
                        duration_ms,
                    },
                    Ok(Err(error)) => WorkerReply {
                        worker: index,
                        task_id: task.id,
                        result: Err(error),
                        requeue: None,
                        pixels: 0,
                        duration_ms,
                    },
                    Err(panic) => {
                        let reason = panic_message(&panic);
                        warn!("[{}] task {} panicked: {reason}", ctx.prefix(), task.id);
                        WorkerReply {
                            worker: index,
                            task_id: task.id,
                            result: Err(ConvertError::WorkerCrashed {
                                worker: index,
                                reason,
                            }),
                            requeue: Some(task),
                            pixels: 0,
                            duration_ms,
                        }
                    }
                };
                state = WorkerState::Idle;
                let _ = tx.send(WorkerEvent::TaskDone(reply));
            }
            WorkerMessage::Shutdown => break,
        }
    }

    debug!("[{}] worker terminated from state {state:?}", ctx.prefix());
}

fn open_shared(
    converter: &mut BufferConverter,
    profiles: &SharedProfiles,
) -> ConvertResult<(ProfileHandle, Vec<ProfileHandle>)> {
    let destination = converter.engine_mut().open_profile(&profiles.destination)?;
    let mut intermediates = Vec::with_capacity(profiles.intermediates.len());
    for bytes in &profiles.intermediates {
        intermediates.push(converter.engine_mut().open_profile(bytes)?);
    }
    Ok((destination, intermediates))
}

fn process_task(
    task: &ImageTask,
    shared: Option<&SharedSlot>,
    converter: &mut BufferConverter,
    bytes_cache: &mut HashMap<usize, ProfileHandle>,
) -> ConvertResult<ConvertedImage> {
    let source = task.chain.source.resolve(converter, bytes_cache)?;

    let destination = match &task.chain.destination {
        Some(bytes) => ProfileSpec::Bytes(bytes.clone()).resolve(converter, bytes_cache)?,
        None => {
            shared
                .ok_or_else(|| {
                    ConvertError::InvalidArgument(
                        "task omits destination profile but no shared profiles were broadcast"
                            .to_string(),
                    )
                })?
                .destination
        }
    };

    let intermediates = match &task.chain.intermediates {
        Some(list) => {
            let mut handles = Vec::with_capacity(list.len());
            for bytes in list {
                handles.push(ProfileSpec::Bytes(bytes.clone()).resolve(converter, bytes_cache)?);
            }
            handles
        }
        None => shared.map(|s| s.intermediates.clone()).unwrap_or_default(),
    };

    let inherited = shared.map(|s| s.profiles.as_ref());
    let settings = ImageConvertSettings {
        intent: task
            .chain
            .intent
            .or(inherited.map(|s| s.intent))
            .unwrap_or_default(),
        black_point_compensation: task
            .chain
            .black_point_compensation
            .or(inherited.map(|s| s.black_point_compensation))
            .unwrap_or(false),
        adaptive_bpc_clamping: task
            .chain
            .adaptive_bpc_clamping
            .or(inherited.map(|s| s.adaptive_bpc_clamping))
            .unwrap_or(false),
        output_bits_per_component: task
            .chain
            .output_bits_per_component
            .or(inherited.and_then(|s| s.output_bits_per_component)),
    };

    let chain = ImageChain {
        source,
        intermediates,
        destination,
    };
    convert_image(&task.record, &chain, &settings, converter)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The pool. Dispatch is FIFO round-robin over per-worker queues; replies
/// arrive on one shared event channel.
pub struct WorkerPool {
    senders: Vec<Sender<WorkerMessage>>,
    events: Receiver<WorkerEvent>,
    handles: Vec<JoinHandle<()>>,
    next_worker: Mutex<usize>,
    next_task_id: AtomicU64,
    stashed: Mutex<Vec<WorkerReply>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, cancel: CancelToken) -> Self {
        let worker_count = worker_count.max(1);
        let (event_tx, events) = unbounded();
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = unbounded();
            let event_tx = event_tx.clone();
            let cancel = cancel.clone();
            senders.push(tx);
            handles.push(std::thread::spawn(move || {
                worker_loop(index, rx, event_tx, cancel)
            }));
        }
        WorkerPool {
            senders,
            events,
            handles,
            next_worker: Mutex::new(0),
            next_task_id: AtomicU64::new(1),
            stashed: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Broadcasts shared profiles and blocks until every worker
    /// acknowledged. No worker pulls a task before its acknowledgement,
    /// which gives the broadcast happens-before every later task.
    pub fn broadcast_shared(&self, profiles: SharedProfiles) -> ConvertResult<()> {
        let payload = Arc::new(profiles);
        for sender in &self.senders {
            sender
                .send(WorkerMessage::SetSharedProfiles(payload.clone()))
                .map_err(|_| ConvertError::WorkerCrashed {
                    worker: 0,
                    reason: "worker channel closed".to_string(),
                })?;
        }
        let mut acks = 0usize;
        while acks < self.senders.len() {
            match self.events.recv() {
                Ok(WorkerEvent::SharedAck { .. }) => acks += 1,
                Ok(WorkerEvent::TaskDone(reply)) => {
                    // A straggler from the previous batch; keep it for the
                    // next drain.
                    self.stashed.lock().unwrap().push(reply);
                }
                Err(_) => {
                    return Err(ConvertError::WorkerCrashed {
                        worker: 0,
                        reason: "worker pool event channel closed".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn send_to(&self, worker: usize, task: Box<ImageTask>) {
        let _ = self.senders[worker].send(WorkerMessage::Task(task));
    }

    /// Queues an image task on the next worker in round-robin order and
    /// returns the task id.
    pub fn submit(&self, record: ImageRecord, chain: ChainSpec) -> u64 {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let worker = {
            let mut next = self.next_worker.lock().unwrap();
            let w = *next;
            *next = (*next + 1) % self.senders.len();
            w
        };
        self.send_to(worker, Box::new(ImageTask { id, record, chain }));
        id
    }

    /// Re-queues a crashed task on a different worker, keeping its id.
    pub fn resubmit_excluding(&self, task: Box<ImageTask>, failed_worker: usize) -> u64 {
        let id = task.id;
        let worker = if self.senders.len() == 1 {
            0
        } else {
            let mut next = self.next_worker.lock().unwrap();
            let mut w = *next;
            if w == failed_worker {
                w = (w + 1) % self.senders.len();
            }
            *next = (w + 1) % self.senders.len();
            w
        };
        self.send_to(worker, task);
        id
    }

    /// Blocks for the next task reply.
    pub fn recv_reply(&self) -> ConvertResult<WorkerReply> {
        if let Some(reply) = self.stashed.lock().unwrap().pop() {
            return Ok(reply);
        }
        loop {
            match self.events.recv() {
                Ok(WorkerEvent::TaskDone(reply)) => return Ok(reply),
                Ok(WorkerEvent::SharedAck { .. }) => continue,
                Err(_) => {
                    return Err(ConvertError::WorkerCrashed {
                        worker: 0,
                        reason: "worker pool event channel closed".to_string(),
                    })
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color_space::ColorSpaceDescriptor;

    fn rgb_record(pixels: Vec<u8>) -> ImageRecord {
        ImageRecord {
            width: pixels.len() / 3,
            height: 1,
            bits_per_component: 8,
            color_space: ColorSpaceDescriptor::DeviceRgb,
            filters: Vec::new(),
            predictor: None,
            data: pixels,
            palette: None,
        }
    }

    fn srgb_bytes() -> Arc<Vec<u8>> {
        let mut engine = crate::engine::ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        Arc::new(engine.profile_bytes(srgb).unwrap())
    }

    #[test]
    fn broadcast_then_task_uses_shared_destination() {
        let pool = WorkerPool::new(2, CancelToken::new());
        pool.broadcast_shared(SharedProfiles {
            destination: srgb_bytes(),
            intermediates: Vec::new(),
            intent: RenderingIntent::RelativeColorimetric,
            black_point_compensation: false,
            adaptive_bpc_clamping: false,
            output_bits_per_component: None,
        })
        .unwrap();

        let id = pool.submit(
            rgb_record(vec![10, 20, 30]),
            ChainSpec::inherit(ProfileSpec::Builtin(BuiltinProfile::SRgb)),
        );
        let reply = pool.recv_reply().unwrap();
        assert_eq!(reply.task_id, id);
        let converted = reply.result.unwrap();
        assert_eq!(converted.channels, 3);
        assert_eq!(converted.pixel_count, 1);
    }

    #[test]
    fn task_without_shared_or_destination_fails() {
        let pool = WorkerPool::new(1, CancelToken::new());
        pool.submit(
            rgb_record(vec![1, 2, 3]),
            ChainSpec::inherit(ProfileSpec::Builtin(BuiltinProfile::SRgb)),
        );
        let reply = pool.recv_reply().unwrap();
        assert!(matches!(
            reply.result,
            Err(ConvertError::InvalidArgument(_))
        ));
    }

    #[test]
    fn canceled_pool_drops_queued_tasks() {
        let cancel = CancelToken::new();
        let pool = WorkerPool::new(1, cancel.clone());
        cancel.cancel();
        pool.submit(
            rgb_record(vec![1, 2, 3]),
            ChainSpec::inherit(ProfileSpec::Builtin(BuiltinProfile::SRgb)),
        );
        let reply = pool.recv_reply().unwrap();
        assert!(reply.result.as_ref().err().map(ConvertError::is_canceled).unwrap_or(false));
    }

    #[test]
    fn explicit_destination_bytes_override_shared() {
        let pool = WorkerPool::new(1, CancelToken::new());
        let mut chain = ChainSpec::inherit(ProfileSpec::Builtin(BuiltinProfile::SRgb));
        chain.destination = Some(srgb_bytes());
        chain.intent = Some(RenderingIntent::RelativeColorimetric);
        pool.submit(rgb_record(vec![200, 100, 50]), chain);
        let reply = pool.recv_reply().unwrap();
        let converted = reply.result.unwrap();
        assert_eq!(converted.channels, 3);
    }
}
