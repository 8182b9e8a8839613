use crate::net::support::{ErrorType, Frame, TransportResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Hook invoked synchronously on the processor thread. Takes ownership of
/// the frame.
pub type PushHook = Box<dyn FnMut(Frame) + Send>;

const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(5);
const TIMED_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct State {
    queue: VecDeque<Frame>,
    hook: Option<PushHook>,
    delivered: bool,
}

/// Consumer-facing end of the pipeline: either a pulled frame FIFO or a push
/// hook, never both. The mode is pinned once the first frame of a session
/// has been enqueued or pushed.
pub struct Delivery {
    state: Mutex<State>,
    shutdown: Arc<AtomicBool>,
}

impl Delivery {
    #[inline]
    pub fn new(shutdown: Arc<AtomicBool>) -> Delivery {
        Delivery {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                hook: None,
                delivered: false,
            }),
            shutdown,
        }
    }

    /// Registers the push hook. Fails once a hook is present or a frame has
    /// already been delivered in this session.
    pub fn install_hook(&self, hook: PushHook) -> TransportResult<()> {
        let mut state = self.state.lock().expect("Delivery state poisoned");

        if state.hook.is_some() || state.delivered {
            return Err(ErrorType::InvalidValue);
        }

        state.hook = Some(hook);
        Ok(())
    }

    /// Hands a frame to the consumer: through the hook when installed,
    /// otherwise onto the FIFO.
    pub(crate) fn deliver(&self, frame: Frame) {
        let mut state = self.state.lock().expect("Delivery state poisoned");

        state.delivered = true;

        match state.hook.as_mut() {
            Some(hook) => hook(frame),
            None => state.queue.push_back(frame),
        }
    }

    /// Waits until a frame is available or shutdown is requested, polling at
    /// 5 ms granularity.
    pub fn pull_blocking(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.try_pull() {
                return Some(frame);
            }

            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            thread::sleep(BLOCKING_POLL_INTERVAL);
        }
    }

    /// Bounded variant of `pull_blocking`, polling at 1 ms granularity.
    /// Returns `None` on shutdown or when the timeout elapses.
    pub fn pull_with_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(frame) = self.try_pull() {
                return Some(frame);
            }

            if self.shutdown.load(Ordering::Acquire) || Instant::now() >= deadline {
                return None;
            }

            thread::sleep(TIMED_POLL_INTERVAL);
        }
    }

    #[inline]
    fn try_pull(&self) -> Option<Frame> {
        self.state
            .lock()
            .expect("Delivery state poisoned")
            .queue
            .pop_front()
    }

    /// Number of frames waiting in the FIFO.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.lock().expect("Delivery state poisoned").queue.len()
    }

    /// Drops all queued frames, the installed hook and the mode pin, so the
    /// next session picks its delivery mode afresh. Runs as part of session
    /// stop.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock().expect("Delivery state poisoned");

        state.queue.clear();
        state.hook = None;
        state.delivered = false;
    }
}
