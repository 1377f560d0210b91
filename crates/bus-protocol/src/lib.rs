// bus-protocol: Message bus wire contract and framing.
//
// Every message on the bus is a single JSON object (an "envelope") carried in
// a length-prefixed frame: a 4-byte big-endian unsigned length header followed
// by the UTF-8 JSON payload.  The action names in `actions` are frozen — they
// are the wire contract between the broker and every peer.

pub mod envelope;
pub mod framing;

pub use envelope::{Envelope, RoutedTrace, actions, now_timestamp};
pub use framing::{
    DEFAULT_MAX_FRAME_LEN, FrameError, HEADER_LEN, read_envelope, read_frame, write_envelope,
    write_frame,
};
