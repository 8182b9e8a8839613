use crate::net::session::Shared;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use muon::logging::{self, Logger};
use std::cmp::max;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const SOCKET_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 16;

/// Poll timeout, bounding how long a shutdown request can go unobserved.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Single producer of the datagram ring. Polls the socket, drains every
/// readable burst into successive slots, and signals the processor once per
/// round that stored at least one datagram.
pub(crate) struct Receiver {
    shared: Arc<Shared>,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    log: Logger,
}

impl Receiver {
    pub fn new(shared: Arc<Shared>, socket: std::net::UdpSocket, log: Logger) -> io::Result<Receiver> {
        socket.set_nonblocking(true)?;

        let mut socket = UdpSocket::from_std(socket);
        let poll = Poll::new()?;

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        Ok(Receiver {
            shared,
            socket,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            log,
        })
    }

    pub fn run(mut self) {
        while !self.shared.is_shutdown() {
            if let Err(error) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                // A signal wakeup is not a poll failure.
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                logging::error!(self.log, "socket poll failed, shutting down flow";
                                "context" => "run",
                                "error" => ?error);
                self.shared.request_shutdown();
                break;
            }

            if self.events.is_empty() {
                continue;
            }

            if self.drain_socket() {
                self.shared.signal_processor();
            }
        }

        logging::debug!(self.log, "receiver stopped"; "context" => "run");
    }

    /// Drains the readable socket into successive ring slots, growing the
    /// ring whenever the next write would run into the consumer frontier.
    /// Returns true when at least one datagram was stored.
    fn drain_socket(&mut self) -> bool {
        let ring = &self.shared.ring;
        let socket = &self.socket;
        let mut received = false;

        while !self.shared.is_shutdown() {
            if ring.needs_growth() {
                let extra = max(1, ring.slot_count() / 4);

                logging::debug!(self.log, "growing datagram ring under pressure";
                                "context" => "drain",
                                "slots" => ring.slot_count(),
                                "extra" => extra);

                ring.grow(extra);
            }

            let index = ring.next_write();
            let result = ring.produce(index, |buffer| {
                socket.recv_from(buffer).map(|(read, _)| read)
            });

            match result {
                Ok(0) => break,
                Ok(_) => received = true,
                Err(error) => match error.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => break,
                    kind => {
                        logging::error!(self.log, "socket receive failed, shutting down flow";
                                        "context" => "drain",
                                        "error" => ?kind);
                        self.shared.request_shutdown();
                        break;
                    }
                },
            }
        }

        received
    }
}
