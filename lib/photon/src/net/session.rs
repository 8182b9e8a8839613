use crate::net::delivery::{Delivery, PushHook};
use crate::net::handler::{HandlerKey, HandlerRegistry};
use crate::net::processor::Processor;
use crate::net::receiver::Receiver;
use crate::net::ring::Ring;
use crate::net::support::{
    AuxGetter, AuxHandler, AuxOutcome, ErrorType, Frame, PrimaryHandler, TransportResult,
};
use muon::logging::{self, Logger};
use serde_derive::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Tunables of a reception session. `flags` is an opaque value forwarded
/// verbatim to every installed handler.
#[derive(Serialize, Deserialize)]
pub struct SessionConfig {
    pub buffer_size_bytes: usize,
    pub flags: i32,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
            flags: 0,
        }
    }
}

impl SessionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> SessionConfig {
        serdeconv::from_toml_file(path).expect("Error loading session configuration file")
    }
}

/// State shared between the session facade and its two worker threads.
pub(crate) struct Shared {
    pub ring: Ring,
    pub registry: Mutex<HandlerRegistry>,
    pub delivery: Delivery,
    pub shutdown: Arc<AtomicBool>,
    pub signal: Mutex<bool>,
    pub wake: Condvar,
    pub flags: i32,
}

impl Shared {
    fn new(config: &SessionConfig) -> Arc<Shared> {
        let shutdown = Arc::new(AtomicBool::new(false));

        Arc::new(Shared {
            ring: Ring::new(config.buffer_size_bytes),
            registry: Mutex::new(HandlerRegistry::new()),
            delivery: Delivery::new(shutdown.clone()),
            shutdown,
            signal: Mutex::new(false),
            wake: Condvar::new(),
            flags: config.flags,
        })
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Flags the flow for shutdown and wakes the processor so the request is
    /// observed even on an empty ring. The wait predicate is flipped under
    /// the signal lock, otherwise the notification could land between the
    /// processor's predicate check and its wait and be lost.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        *self.signal.lock().expect("Signal lock poisoned") = true;
        self.wake.notify_one();
    }

    /// Marks pending ring data and wakes the processor. The signal mutex is
    /// held only for the flag flip, so the caller never waits out a drain.
    pub fn signal_processor(&self) {
        *self.signal.lock().expect("Signal lock poisoned") = true;
        self.wake.notify_one();
    }
}

/// A single-socket reception session: owns the receiver and processor
/// threads, the datagram ring between them, the handler chain and the
/// consumer-facing delivery endpoint.
pub struct Session {
    shared: Arc<Shared>,
    receiver: Option<thread::JoinHandle<()>>,
    processor: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl Session {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: SessionConfig, log: L) -> Session {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Session {
            shared: Shared::new(&config),
            receiver: None,
            processor: None,
            log,
        }
    }

    /// Installs a primary handler, returning its key.
    #[inline]
    pub fn install_primary(&self, handler: PrimaryHandler) -> HandlerKey {
        self.shared
            .registry
            .lock()
            .expect("Registry lock poisoned")
            .install_primary(handler)
    }

    /// Appends an auxiliary handler/getter pair to an installed primary.
    #[inline]
    pub fn install_auxiliary(
        &self,
        key: HandlerKey,
        handler: AuxHandler,
        getter: AuxGetter,
    ) -> TransportResult<()> {
        self.shared
            .registry
            .lock()
            .expect("Registry lock poisoned")
            .install_auxiliary(key, handler, getter)
    }

    /// Context-pointer flavor of `install_auxiliary`.
    #[inline]
    pub fn install_auxiliary_ctx<C>(
        &self,
        key: HandlerKey,
        ctx: C,
        handler: fn(&mut C, i32, &mut Option<Frame>) -> Result<AuxOutcome, ErrorType>,
        getter: fn(&mut C, &mut Option<Frame>) -> Result<AuxOutcome, ErrorType>,
    ) -> TransportResult<()>
    where
        C: Send + 'static,
    {
        self.shared
            .registry
            .lock()
            .expect("Registry lock poisoned")
            .install_auxiliary_ctx(key, ctx, handler, getter)
    }

    /// Switches delivery to push mode. Must happen before the first frame of
    /// the session is produced.
    #[inline]
    pub fn install_push_hook(&self, hook: PushHook) -> TransportResult<()> {
        self.shared.delivery.install_hook(hook)
    }

    /// Pulls the next frame, waiting until one arrives or the session shuts
    /// down.
    #[inline]
    pub fn pull_blocking(&self) -> Option<Frame> {
        self.shared.delivery.pull_blocking()
    }

    /// Pulls the next frame, waiting at most `timeout`.
    #[inline]
    pub fn pull_with_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.shared.delivery.pull_with_timeout(timeout)
    }

    /// Spawns the receiver and processor threads on the supplied socket.
    /// Both threads request real-time scheduling, the receiver at the top
    /// priority and the processor one step below; failure to elevate is
    /// logged and otherwise ignored.
    pub fn start(&mut self, socket: UdpSocket) -> TransportResult<()> {
        if self.receiver.is_some() || self.processor.is_some() {
            return Err(ErrorType::InvalidValue);
        }

        self.shared.shutdown.store(false, Ordering::Release);
        *self.shared.signal.lock().expect("Signal lock poisoned") = false;

        let receiver = Receiver::new(
            self.shared.clone(),
            socket,
            self.log.new(logging::o!("thread" => "receiver")),
        )?;

        let receiver_log = self.log.new(logging::o!("thread" => "receiver"));
        self.receiver = Some(
            thread::Builder::new()
                .name("photon-receiver".into())
                .spawn(move || {
                    if !elevate_realtime(0) {
                        logging::info!(receiver_log, "real-time priority unavailable, running at default";
                                       "context" => "start");
                    }
                    receiver.run()
                })
                .expect("Error spawning receiver thread"),
        );

        let processor = Processor::new(
            self.shared.clone(),
            self.log.new(logging::o!("thread" => "processor")),
        );

        let processor_log = self.log.new(logging::o!("thread" => "processor"));
        self.processor = Some(
            thread::Builder::new()
                .name("photon-processor".into())
                .spawn(move || {
                    if !elevate_realtime(1) {
                        logging::info!(processor_log, "real-time priority unavailable, running at default";
                                       "context" => "start");
                    }
                    processor.run()
                })
                .expect("Error spawning processor thread"),
        );

        logging::debug!(self.log, "session started"; "context" => "start");
        Ok(())
    }

    /// Stops the flow: requests shutdown, joins both threads and drops any
    /// frames still queued. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.shared.request_shutdown();

        if let Some(handle) = self.receiver.take() {
            drop(handle.join());
        }

        if let Some(handle) = self.processor.take() {
            drop(handle.join());
        }

        self.shared.ring.clear();
        self.shared.delivery.clear();

        logging::debug!(self.log, "session stopped"; "context" => "stop");
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.receiver.is_some()
    }

    /// Replaces the datagram ring with one sized to `bytes`. Only valid
    /// while the session is stopped.
    pub fn resize_buffer(&mut self, bytes: usize) -> TransportResult<()> {
        if self.is_running() {
            return Err(ErrorType::InvalidValue);
        }

        self.shared.ring.reset(bytes);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best-effort move of the calling thread onto the real-time scheduler, at
/// `step` below the maximum priority. Advisory on general-purpose hosts.
#[cfg(unix)]
fn elevate_realtime(step: i32) -> bool {
    unsafe {
        let top = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if top < 0 {
            return false;
        }

        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = top - step;

        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0
    }
}

#[cfg(not(unix))]
fn elevate_realtime(_step: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ring::SLOT_CAPACITY;
    use crate::net::support::PrimaryOutcome;
    use byteorder::{BigEndian, ByteOrder};
    use std::net::SocketAddr;
    use std::time::Instant;

    fn frame_primary() -> PrimaryHandler {
        Box::new(|data, flags| Ok(PrimaryOutcome::Modified(Frame::new(data.to_vec(), flags))))
    }

    fn emit_auxiliary(session: &Session, key: HandlerKey) {
        session
            .install_auxiliary(
                key,
                Box::new(|_, _| Ok(AuxOutcome::Ready)),
                Box::new(|_| Ok(AuxOutcome::Done)),
            )
            .unwrap();
    }

    fn bound_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = socket.local_addr().unwrap();
        (socket, address)
    }

    fn numbered_packet(value: u32) -> [u8; 8] {
        let mut packet = [0u8; 8];
        BigEndian::write_u32(&mut packet[..4], value);
        packet
    }

    fn wait_for<F: Fn() -> bool>(condition: F, limit: Duration) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < limit, "Timed out waiting for condition");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_pull_single_datagram() {
        let (socket, target) = bound_socket();

        let mut session = Session::new(SessionConfig::default(), None);
        let key = session.install_primary(frame_primary());
        emit_auxiliary(&session, key);

        session.start(socket).unwrap();

        let (sender, _) = bound_socket();
        sender.send_to(&[7u8; 200], target).unwrap();

        let frame = session.pull_blocking().unwrap();
        assert_eq!(frame.payload, vec![7u8; 200]);

        assert!(session.pull_with_timeout(Duration::from_millis(10)).is_none());

        session.stop();
    }

    #[test]
    fn test_push_mode_counts_and_orders() {
        let (socket, target) = bound_socket();

        let mut session = Session::new(SessionConfig::default(), None);
        let key = session.install_primary(frame_primary());
        emit_auxiliary(&session, key);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        session
            .install_push_hook(Box::new(move |frame| {
                sink.lock().unwrap().push(BigEndian::read_u32(&frame.payload[..4]));
            }))
            .unwrap();

        session.start(socket).unwrap();

        let (sender, _) = bound_socket();
        for value in 0..1000u32 {
            sender.send_to(&numbered_packet(value), target).unwrap();

            // Brief pacing so the loopback receive buffer never overflows.
            if value % 50 == 49 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        wait_for(|| received.lock().unwrap().len() == 1000, Duration::from_secs(5));
        session.stop();

        let received = received.lock().unwrap();
        assert_eq!(*received, (0..1000).collect::<Vec<u32>>());
    }

    #[test]
    fn test_back_pressure_grows_ring() {
        let (socket, target) = bound_socket();

        let config = SessionConfig {
            buffer_size_bytes: 2 * SLOT_CAPACITY,
            flags: 0,
        };

        let mut session = Session::new(config, None);
        let key = session.install_primary(frame_primary());
        emit_auxiliary(&session, key);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        session
            .install_push_hook(Box::new(move |frame| {
                // A slow consumer forces the receiver into ring growth.
                thread::sleep(Duration::from_micros(500));
                sink.lock().unwrap().push(BigEndian::read_u32(&frame.payload[..4]));
            }))
            .unwrap();

        session.start(socket).unwrap();

        let (sender, _) = bound_socket();
        for value in 0..200u32 {
            sender.send_to(&numbered_packet(value), target).unwrap();
        }

        wait_for(|| received.lock().unwrap().len() == 200, Duration::from_secs(10));

        assert!(session.shared.ring.slot_count() > 2);

        session.stop();

        let received = received.lock().unwrap();
        assert_eq!(*received, (0..200).collect::<Vec<u32>>());
    }

    #[test]
    fn test_stop_idempotent_and_restartable() {
        let (socket, _) = bound_socket();

        let mut session = Session::new(SessionConfig::default(), None);
        let key = session.install_primary(frame_primary());
        emit_auxiliary(&session, key);

        session.start(socket).unwrap();
        session.stop();
        session.stop();

        assert!(!session.is_running());
        assert!(session.pull_with_timeout(Duration::from_millis(5)).is_none());

        // The session can be brought back up on a fresh socket.
        let (socket, target) = bound_socket();
        session.start(socket).unwrap();

        let (sender, _) = bound_socket();
        sender.send_to(&[1u8; 16], target).unwrap();

        assert!(session.pull_blocking().is_some());
        session.stop();
    }

    #[test]
    fn test_double_start_rejected() {
        let (socket, _) = bound_socket();
        let (other, _) = bound_socket();

        let mut session = Session::new(SessionConfig::default(), None);
        session.start(socket).unwrap();

        assert_eq!(session.start(other).unwrap_err(), ErrorType::InvalidValue);

        session.stop();
    }

    #[test]
    fn test_resize_only_while_stopped() {
        let (socket, _) = bound_socket();

        let mut session = Session::new(SessionConfig::default(), None);
        session.start(socket).unwrap();

        assert_eq!(
            session.resize_buffer(SLOT_CAPACITY).unwrap_err(),
            ErrorType::InvalidValue
        );

        session.stop();

        session.resize_buffer(8 * SLOT_CAPACITY).unwrap();
        assert_eq!(session.shared.ring.slot_count(), 8);
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.buffer_size_bytes, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.flags, 0);
    }

    #[test]
    fn test_flags_forwarded_to_handlers() {
        let (socket, target) = bound_socket();

        let config = SessionConfig {
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
            flags: 0x2a,
        };

        let mut session = Session::new(config, None);
        let key = session.install_primary(frame_primary());
        emit_auxiliary(&session, key);

        session.start(socket).unwrap();

        let (sender, _) = bound_socket();
        sender.send_to(&[0u8; 4], target).unwrap();

        let frame = session.pull_blocking().unwrap();
        assert_eq!(frame.flags, 0x2a);

        session.stop();
    }
}
