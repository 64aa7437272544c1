//! Wire codecs for stepbus.
//!
//! Two encodings live here:
//!
//! - [`control`]: the request/reply control protocol. Frame 0 is a 2-byte
//!   big-endian command code; frame 1 is an optional CBOR-encoded payload
//!   record, opaque to the framing layer.
//! - [`exe_data`]: variable-value publications on the data bus. Frame 0 is
//!   the 6-byte topic (slave id ‖ variable id), frame 1 the step id, frame 2
//!   the tagged scalar value. Subscribers filter by topic prefix.
//!
//! All numeric encodings are big-endian.

pub mod control;
pub mod exe_data;

mod error;

pub use control::{ControlReply, ControlRequest, Fatal, FatalKind};
pub use error::ProtoError;
pub use exe_data::DataMessage;

/// The control protocol version spoken by this implementation.
///
/// HELLO carries the master's version; an agent that does not speak it
/// answers with `FATAL(Version)` and closes the dialog.
pub const PROTOCOL_VERSION: u16 = 0;
