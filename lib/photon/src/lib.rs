#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod net;

pub mod prelude {
    pub use crate::net::delivery::Delivery;
    pub use crate::net::handler::{HandlerKey, HandlerRegistry};
    pub use crate::net::session::{Session, SessionConfig};
    pub use crate::net::srtcp::{SrtcpContext, StreamKeys};
    pub use crate::net::support::{
        AuxOutcome, ErrorType, Frame, PrimaryOutcome, TransportResult,
    };
}
