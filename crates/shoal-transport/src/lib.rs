//! Inter-target transport
//!
//! Long-lived TCP flows carrying framed objects: a length-prefixed
//! protobuf header followed by either exactly `hdr.size` payload bytes or
//! a PDU sequence with an explicit end-of-block sentinel. Bundles
//! multiplex several streams per destination; the shared demux (SDM)
//! multiplexes many xactions over one process-wide bundle.

pub mod bundle;
pub mod hdr;
pub mod pdu;
pub mod quiesce;
pub mod recv;
pub mod sdm;
pub mod stream;

pub use bundle::{Bundle, Dm, Peer};
pub use hdr::ObjHdr;
pub use quiesce::{quiesce, QuiRes};
pub use recv::{Demux, Receiver};
pub use sdm::SharedDm;
pub use stream::{SendObj, Stream, StreamOpts};

/// Reserved opcodes. `OBJ` frames carry payload; everything else is
/// header-only control traffic.
pub mod opcode {
    /// Ordinary object frame.
    pub const OBJ: i32 = 0;
    /// Connection handshake naming the transport endpoint.
    pub const HELLO: i32 = 27180;
    /// Graceful end of stream.
    pub const FIN: i32 = 27181;
    // sentinel protocol
    pub const DONE: i32 = 27182;
    pub const ABORT: i32 = 27183;
    pub const REQUEST: i32 = 27184;
    pub const RESPONSE: i32 = 27185;
}

/// Transport name of the process-wide shared data mover.
pub const SDM_TRNAME: &str = "shared-dm";
