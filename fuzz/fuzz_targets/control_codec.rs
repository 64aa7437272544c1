//! Fuzz target for the wire codecs.
//!
//! Decoders face bytes from the network; none of them may panic, whatever
//! arrives. Frames that do decode must re-encode to something that decodes
//! to the same message.

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use stepbus_net::Message;
use stepbus_proto::{ControlReply, ControlRequest, DataMessage};

#[derive(Debug, Arbitrary)]
struct FuzzMessage {
    frames: Vec<Vec<u8>>,
}

fuzz_target!(|input: FuzzMessage| {
    let message =
        Message::from_frames(input.frames.into_iter().map(Bytes::from).collect::<Vec<_>>());

    if let Ok(request) = ControlRequest::decode(&message) {
        let rewired = request.encode().expect("decoded request must re-encode");
        assert_eq!(ControlRequest::decode(&rewired).expect("round trip"), request);
    }
    if let Ok(reply) = ControlReply::decode(&message) {
        let rewired = reply.encode().expect("decoded reply must re-encode");
        assert_eq!(ControlReply::decode(&rewired).expect("round trip"), reply);
    }
    if let Ok(publication) = DataMessage::decode(&message) {
        let rewired = publication.encode();
        assert_eq!(DataMessage::decode(&rewired).expect("round trip"), publication);
    }

    // Envelope handling must also tolerate anything.
    let mut stripped = message;
    let _ = stripped.pop_envelope();
});
