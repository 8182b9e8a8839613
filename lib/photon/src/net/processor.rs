use crate::net::delivery::Delivery;
use crate::net::handler::{AuxEntry, HandlerRegistry};
use crate::net::session::Shared;
use crate::net::support::{AuxOutcome, Frame, PrimaryOutcome};
use muon::logging::{self, Logger};
use std::sync::Arc;

/// Single consumer of the datagram ring. Waits for the receiver's signal,
/// then drains every pending slot through the handler chain. Handlers may be
/// stateful, so there is exactly one of these per session.
pub(crate) struct Processor {
    shared: Arc<Shared>,
    log: Logger,
}

impl Processor {
    #[inline]
    pub fn new(shared: Arc<Shared>, log: Logger) -> Processor {
        Processor { shared, log }
    }

    pub fn run(self) {
        loop {
            {
                let mut pending = self.shared.signal.lock().expect("Signal lock poisoned");

                while !*pending && !self.shared.is_shutdown() {
                    pending = self
                        .shared
                        .wake
                        .wait(pending)
                        .expect("Signal lock poisoned");
                }

                *pending = false;
            }

            if self.shared.is_shutdown() {
                break;
            }

            // The drain lock serializes ring growth against slot reads.
            let guard = self.shared.ring.lock();

            while let Some(datagram) = self.shared.ring.consume(&guard) {
                let mut registry = self.shared.registry.lock().expect("Registry lock poisoned");

                dispatch(
                    &mut registry,
                    &self.shared.delivery,
                    self.shared.flags,
                    datagram,
                    &self.log,
                );
            }
        }

        logging::debug!(self.log, "processor stopped"; "context" => "run");
    }
}

/// Runs one datagram through every primary handler in installation order.
/// Handler errors stay local: they are logged and the chain moves on.
pub(crate) fn dispatch(
    registry: &mut HandlerRegistry,
    delivery: &Delivery,
    flags: i32,
    data: &[u8],
    log: &Logger,
) {
    for (&key, entry) in registry.entries_mut() {
        match (entry.primary)(data, flags) {
            Ok(PrimaryOutcome::Consumed) | Ok(PrimaryOutcome::NotHandled) => (),
            Ok(PrimaryOutcome::Modified(frame)) => {
                dispatch_auxiliaries(&mut entry.auxiliaries, delivery, flags, frame, key, log)
            }
            Err(error) => {
                logging::warn!(log, "primary handler failed";
                               "context" => "dispatch",
                               "handler_key" => key,
                               "error" => ?error);
            }
        }
    }
}

/// Runs the auxiliary chain of one primary over a freshly produced frame.
/// `Ready` emits the current frame, `MultipleReady` drains the paired getter
/// while it keeps reporting `Ready`; an error ends the chain.
fn dispatch_auxiliaries(
    auxiliaries: &mut [AuxEntry],
    delivery: &Delivery,
    flags: i32,
    frame: Frame,
    key: u32,
    log: &Logger,
) {
    let mut current = Some(frame);

    for aux in auxiliaries.iter_mut() {
        match (aux.handler)(flags, &mut current) {
            Ok(AuxOutcome::Ready) => {
                if let Some(ready) = current.take() {
                    delivery.deliver(ready);
                }
            }
            Ok(AuxOutcome::MultipleReady) => {
                let mut output = None;

                loop {
                    match (aux.getter)(&mut output) {
                        Ok(AuxOutcome::Ready) => {
                            if let Some(ready) = output.take() {
                                delivery.deliver(ready);
                            }
                        }
                        Ok(_) => break,
                        Err(error) => {
                            logging::warn!(log, "auxiliary getter failed";
                                           "context" => "dispatch",
                                           "handler_key" => key,
                                           "error" => ?error);
                            break;
                        }
                    }
                }
            }
            Ok(AuxOutcome::Done) | Ok(AuxOutcome::NotHandled) | Ok(AuxOutcome::Modified) => (),
            Err(error) => {
                logging::warn!(log, "auxiliary handler failed";
                               "context" => "dispatch",
                               "handler_key" => key,
                               "error" => ?error);
                break;
            }
        }
    }
}
