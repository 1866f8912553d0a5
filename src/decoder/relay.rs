// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution of the blocking decode steps.
//!
//! The controller expresses the hardware steps of its loop as [`Command`]s given to a
//! [`DecodeExecutor`]. [`InlineExecutor`] runs them on the calling thread. [`ThreadedRelay`] hands
//! them to a worker thread and blocks on a per-command completion until the worker is done, so
//! the hardware wait happens on the worker while the calling thread holds no lock at all. Both
//! run the same [`run_command`], so the behavior is the same either way.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use bytes::Bytes;
use log::debug;
use log::error;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::backend::DecParams;
use crate::backend::OutputInfo;
use crate::backend::VpuEngine;
use crate::decoder::session::DecodeSession;
use crate::decoder::session::SessionError;
use crate::decoder::session::WaitOutcome;
use crate::utils::lock;

/// Session shared between the controller and the executor.
///
/// The lock is held for the whole of a command, hardware waits included, since the session owns
/// the engine. Consumer code releasing a [`DisplayBuffer`] only takes the frame pool lock and
/// must never take this one, or a release racing a decode would wait on the hardware.
///
/// [`DisplayBuffer`]: crate::video_frame::frame_pool::DisplayBuffer
pub type SharedSession<E> = Arc<Mutex<DecodeSession<E>>>;

/// A blocking step of the decode loop.
#[derive(Debug)]
pub enum Command {
    /// Start decoding one picture, then wait for its output.
    StartFrameAndGetOutput { params: DecParams, pending: Bytes },
    /// Collect the output of the running decode if it already completed.
    GetOutput { pending: Bytes },
    /// Wait for the output of a decode started by an earlier command.
    WaitForPendingGetOutput { pending: Bytes },
    /// Give the buffers released by the consumer back to the engine.
    ReleasePendingBuffers,
    /// Stop the worker.
    Exit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutput {
    /// The decode completed. `copied` bytes of the pending input were moved to the ring buffer
    /// while waiting.
    Output { info: OutputInfo, copied: usize },
    /// The decode is still running.
    Yield { copied: usize },
    /// Number of buffers given back to the engine.
    Released(usize),
    Exited,
}

impl CommandOutput {
    fn from_wait(outcome: WaitOutcome, copied: usize) -> Self {
        match outcome {
            WaitOutcome::Output(info) => CommandOutput::Output { info, copied },
            WaitOutcome::Yield => CommandOutput::Yield { copied },
        }
    }
}

/// Runs `command` against `session`.
pub fn run_command<E: VpuEngine>(
    session: &Mutex<DecodeSession<E>>,
    command: Command,
) -> Result<CommandOutput, SessionError> {
    let mut session = lock(session);
    match command {
        Command::StartFrameAndGetOutput {
            params,
            mut pending,
        } => {
            let len = pending.len();
            session.begin_decode(params)?;
            let outcome = session.wait_and_get_output(&mut pending)?;
            Ok(CommandOutput::from_wait(outcome, len - pending.len()))
        }
        Command::GetOutput { mut pending } => {
            let len = pending.len();
            let outcome = session.poll_output(&mut pending)?;
            Ok(CommandOutput::from_wait(outcome, len - pending.len()))
        }
        Command::WaitForPendingGetOutput { mut pending } => {
            let len = pending.len();
            let outcome = session.wait_and_get_output(&mut pending)?;
            Ok(CommandOutput::from_wait(outcome, len - pending.len()))
        }
        Command::ReleasePendingBuffers => Ok(CommandOutput::Released(session.release_pending()?)),
        Command::Exit => Ok(CommandOutput::Exited),
    }
}

/// Something able to run decode commands.
pub trait DecodeExecutor: Send {
    fn execute(&mut self, command: Command) -> Result<CommandOutput, SessionError>;

    /// Whether commands run on another thread.
    fn is_threaded(&self) -> bool;
}

/// Runs commands on the calling thread.
pub struct InlineExecutor<E: VpuEngine> {
    session: SharedSession<E>,
}

impl<E: VpuEngine> InlineExecutor<E> {
    pub fn new(session: SharedSession<E>) -> Self {
        Self { session }
    }
}

impl<E: VpuEngine> DecodeExecutor for InlineExecutor<E> {
    fn execute(&mut self, command: Command) -> Result<CommandOutput, SessionError> {
        run_command(&self.session, command)
    }

    fn is_threaded(&self) -> bool {
        false
    }
}

/// Completion signal of one command.
#[derive(Default)]
struct Completion {
    result: Mutex<Option<Result<CommandOutput, SessionError>>>,
    done: Condvar,
}

impl Completion {
    fn complete(&self, result: Result<CommandOutput, SessionError>) {
        *lock(&self.result) = Some(result);
        self.done.notify_one();
    }

    fn wait(&self) -> Result<CommandOutput, SessionError> {
        let mut result = lock(&self.result);
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            result = self
                .done
                .wait(result)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

struct Job {
    command: Command,
    completion: Arc<Completion>,
}

struct RelayShared {
    queue: Mutex<VecDeque<Job>>,
    /// Counts the jobs waiting in `queue`.
    job_event: EventFd,
}

/// Runs commands on a dedicated worker thread.
pub struct ThreadedRelay {
    shared: Arc<RelayShared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedRelay {
    pub fn new<E: VpuEngine + 'static>(session: SharedSession<E>) -> Result<Self, SessionError> {
        let job_event = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
            .map_err(|e| SessionError::Relay(format!("failed to create job event: {e}")))?;
        let shared = Arc::new(RelayShared {
            queue: Mutex::new(VecDeque::new()),
            job_event,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(String::from("vpu-decode"))
            .spawn(move || Self::process_loop(worker_shared, session))
            .map_err(|e| SessionError::Relay(format!("failed to start the decode worker: {e}")))?;

        debug!("decode relay worker started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    fn process_loop<E: VpuEngine>(shared: Arc<RelayShared>, session: SharedSession<E>) {
        loop {
            if let Err(e) = shared.job_event.read() {
                error!("decode worker failed to wait for jobs: {e}");
                break;
            }

            let Some(job) = lock(&shared.queue).pop_front() else {
                continue;
            };

            if matches!(job.command, Command::Exit) {
                job.completion.complete(Ok(CommandOutput::Exited));
                break;
            }

            let result = run_command(&session, job.command);
            job.completion.complete(result);
        }

        // Jobs queued after a failure would otherwise block their caller forever.
        for job in lock(&shared.queue).drain(..) {
            job.completion
                .complete(Err(SessionError::Relay(String::from("decode worker stopped"))));
        }
        debug!("decode relay worker stopped");
    }

    fn submit(&self, command: Command) -> Result<CommandOutput, SessionError> {
        if self.worker.as_ref().map_or(true, |w| w.is_finished()) {
            return Err(SessionError::Relay(String::from("decode worker not running")));
        }

        let completion = Arc::new(Completion::default());
        lock(&self.shared.queue).push_back(Job {
            command,
            completion: Arc::clone(&completion),
        });
        self.shared
            .job_event
            .write(1)
            .map_err(|e| SessionError::Relay(format!("failed to signal the decode worker: {e}")))?;

        completion.wait()
    }
}

impl DecodeExecutor for ThreadedRelay {
    fn execute(&mut self, command: Command) -> Result<CommandOutput, SessionError> {
        self.submit(command)
    }

    fn is_threaded(&self) -> bool {
        true
    }
}

impl Drop for ThreadedRelay {
    fn drop(&mut self) {
        if let Err(e) = self.submit(Command::Exit) {
            debug!("decode worker already stopped: {e}");
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyEngine;
    use crate::backend::CodecStd;
    use crate::backend::DecodedIndex;
    use crate::decoder::session::InitStatus;
    use crate::decoder::session::SessionConfig;
    use crate::video_frame::dma::SystemDmaAllocator;
    use crate::video_frame::frame_pool::FrameBufferState;
    use crate::video_frame::frame_pool::FramePool;
    use crate::video_frame::frame_pool::PoolRequest;
    use crate::video_frame::ChromaFormat;
    use crate::video_frame::FrameLayout;
    use crate::DecodedFormat;
    use crate::Resolution;

    fn shared_session(engine: &DummyEngine) -> SharedSession<DummyEngine> {
        let mut session =
            DecodeSession::new(engine.clone(), Arc::new(SystemDmaAllocator::new()));
        session
            .open(SessionConfig {
                std: CodecStd::Avc,
                file_play: true,
                bitstream_buffer_size: 4096,
                chroma_interleave: false,
                reorder: true,
                mp4_deblock: false,
                mp4_class: 0,
                init_retries: 0,
                min_resolution: Resolution::from((16, 16)),
            })
            .unwrap();
        session.copy_input(&[0u8; 16]).unwrap();
        assert!(matches!(session.initialize().unwrap(), InitStatus::Ready(_)));

        let layout = FrameLayout::new(
            Resolution::from((320, 240)),
            DecodedFormat::I420,
            ChromaFormat::Yuv420,
        );
        let request = PoolRequest {
            decode_layout: layout,
            num_decode: 6,
            rotator: None,
        };
        let pool = FramePool::allocate(request, &SystemDmaAllocator::new(), |_| None).unwrap();
        session.attach_pool(pool).unwrap();
        Arc::new(Mutex::new(session))
    }

    fn run_sequence(executor: &mut dyn DecodeExecutor) -> Vec<CommandOutput> {
        let mut outputs = Vec::new();
        outputs.push(
            executor
                .execute(Command::StartFrameAndGetOutput {
                    params: Default::default(),
                    pending: Bytes::new(),
                })
                .unwrap(),
        );
        outputs.push(executor.execute(Command::ReleasePendingBuffers).unwrap());
        outputs.push(
            executor
                .execute(Command::StartFrameAndGetOutput {
                    params: Default::default(),
                    pending: Bytes::new(),
                })
                .unwrap(),
        );
        outputs
    }

    #[test]
    fn threaded_relay_matches_inline_execution() {
        let inline_engine = DummyEngine::new();
        inline_engine.state().busy_polls = 2;
        let mut inline = InlineExecutor::new(shared_session(&inline_engine));

        let threaded_engine = DummyEngine::new();
        threaded_engine.state().busy_polls = 2;
        let mut threaded = ThreadedRelay::new(shared_session(&threaded_engine)).unwrap();
        assert!(threaded.is_threaded());

        let inline_outputs = run_sequence(&mut inline);
        let threaded_outputs = run_sequence(&mut threaded);
        assert_eq!(inline_outputs, threaded_outputs);

        match &threaded_outputs[0] {
            CommandOutput::Output { info, .. } => {
                assert_eq!(info.decoded, DecodedIndex::Frame(0))
            }
            other => panic!("unexpected output {other:?}"),
        }
        assert_eq!(
            inline_engine.state().wait_calls,
            threaded_engine.state().wait_calls
        );
    }

    #[test]
    fn leases_drop_while_the_session_is_locked() {
        let engine = DummyEngine::new();
        let session = shared_session(&engine);
        let pool = lock(&session).pool().cloned().unwrap();
        pool.mark_decoded(0).unwrap();
        let lease = pool.mark_displayed(0).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let guard = lock(&session);
        thread::spawn(move || {
            drop(lease);
            done_tx.send(()).unwrap();
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        drop(guard);

        assert_eq!(pool.state(0), Some(FrameBufferState::Pending));
    }

    #[test]
    fn errors_travel_back() {
        let engine = DummyEngine::new();
        let mut relay = ThreadedRelay::new(shared_session(&engine)).unwrap();
        assert!(matches!(
            relay.execute(Command::WaitForPendingGetOutput {
                pending: Bytes::new()
            }),
            Err(SessionError::InvalidState(_))
        ));
        // The worker is still alive after an error.
        assert_eq!(
            relay.execute(Command::ReleasePendingBuffers).unwrap(),
            CommandOutput::Released(0)
        );
    }

    #[test]
    fn exit_stops_the_worker() {
        let engine = DummyEngine::new();
        let mut relay = ThreadedRelay::new(shared_session(&engine)).unwrap();
        assert_eq!(
            relay.execute(Command::Exit).unwrap(),
            CommandOutput::Exited
        );
        if let Some(worker) = relay.worker.take() {
            worker.join().unwrap();
        }
        assert!(matches!(
            relay.execute(Command::ReleasePendingBuffers),
            Err(SessionError::Relay(_))
        ));
    }
}
