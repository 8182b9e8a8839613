use std::io;

pub type TransportResult<T> = Result<T, ErrorType>;

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    InvalidValue,
    AuthTagMismatch,
    Crypto,
    Generic,
    Io(io::ErrorKind),
}

impl From<io::Error> for ErrorType {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        ErrorType::Io(io_error.kind())
    }
}

/// A parsed media frame produced by the handler chain. Ownership transfers
/// to the consumer when the frame is pulled from the queue or handed to the
/// push hook.
#[derive(Debug, Eq, PartialEq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub flags: i32,
}

impl Frame {
    #[inline]
    pub fn new(payload: Vec<u8>, flags: i32) -> Frame {
        Frame { payload, flags }
    }
}

/// Verdict of a primary handler on one datagram.
#[derive(Debug, Eq, PartialEq)]
pub enum PrimaryOutcome {
    /// The datagram was consumed without producing a frame.
    Consumed,
    /// The datagram was not recognized and the next primary should see it.
    NotHandled,
    /// The datagram was transformed into a frame; the auxiliary chain of
    /// this primary runs next.
    Modified(Frame),
}

/// Verdict of an auxiliary handler or getter on the current frame.
#[derive(Debug, Eq, PartialEq)]
pub enum AuxOutcome {
    /// Nothing further to do for this auxiliary.
    Done,
    /// The current frame is complete and should be emitted.
    Ready,
    /// Several frames are buffered; the paired getter drains them.
    MultipleReady,
    /// The auxiliary did not recognize the frame.
    NotHandled,
    /// The auxiliary rewrote the frame in place.
    Modified,
}

/// First-pass handler. Receives the raw datagram bytes and the session
/// flags; errors are logged by the dispatcher and never propagate across
/// handlers.
pub type PrimaryHandler =
    Box<dyn FnMut(&[u8], i32) -> Result<PrimaryOutcome, ErrorType> + Send>;

/// Second-pass handler, dispatched only after its primary reports
/// `Modified`. Operates on the frame slot; on `Ready` the dispatcher takes
/// the frame out of the slot and emits it.
pub type AuxHandler =
    Box<dyn FnMut(i32, &mut Option<Frame>) -> Result<AuxOutcome, ErrorType> + Send>;

/// Drains buffered frames out of an auxiliary that reported
/// `MultipleReady`; called repeatedly while it returns `Ready`.
pub type AuxGetter =
    Box<dyn FnMut(&mut Option<Frame>) -> Result<AuxOutcome, ErrorType> + Send>;
