//! RTSP wire protocol: request/response framing and TCP interleaved media
//! framing.

pub mod interleave;
pub mod message;

pub use interleave::{InterleavedFrame, InterleavedReader, MAX_CONSECUTIVE_RESYNC};
pub use message::{build_request, check_status, read_response, write_request, Method, Response, CONTROL_BUFFER_CAPACITY, USER_AGENT};
