//! Multi-frame messages and envelope handling.
//!
//! A message is an ordered sequence of opaque byte frames, transmitted and
//! delivered as one atomic unit. A message may carry an *envelope*: one or
//! more non-empty routing frames followed by an empty delimiter frame, ahead
//! of the body. Server sockets prepend the sending peer's identity as an
//! envelope on receive, and route by it on send.

use bytes::Bytes;

/// An ordered sequence of byte frames, sent and received atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: Vec<Bytes>,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message from existing frames.
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Appends a frame.
    pub fn push(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    /// The number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the message has no frames at all.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frame at `index`, if present.
    pub fn frame(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    /// Iterates over the frames in order.
    pub fn frames(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    /// Consumes the message, yielding its frames.
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    /// Removes and returns the message's envelope.
    ///
    /// The envelope is every frame before the first empty (delimiter) frame;
    /// the delimiter itself is removed but not returned. A message without a
    /// delimiter has no envelope: it is left unchanged and an empty envelope
    /// is returned.
    pub fn pop_envelope(&mut self) -> Message {
        let Some(delimiter) = self.frames.iter().position(|f| f.is_empty()) else {
            return Message::new();
        };
        let mut rest = self.frames.split_off(delimiter + 1);
        self.frames.pop(); // the delimiter
        std::mem::swap(&mut self.frames, &mut rest);
        Message { frames: rest }
    }

    /// Prepends `envelope` plus a delimiter frame to this message.
    ///
    /// Envelope frames must be non-empty; an empty frame would act as a
    /// premature delimiter.
    pub fn push_envelope(&mut self, envelope: Message) {
        debug_assert!(envelope.frames.iter().all(|f| !f.is_empty()));
        let mut frames = envelope.frames;
        frames.push(Bytes::new());
        frames.append(&mut self.frames);
        self.frames = frames;
    }
}

impl FromIterator<Bytes> for Message {
    fn from_iter<T: IntoIterator<Item = Bytes>>(iter: T) -> Self {
        Self { frames: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(frames: &[&[u8]]) -> Message {
        frames.iter().map(|f| Bytes::copy_from_slice(f)).collect()
    }

    #[test]
    fn pop_envelope_splits_at_delimiter() {
        let mut m = msg(&[b"id", b"", b"body", b"more"]);
        let env = m.pop_envelope();
        assert_eq!(env, msg(&[b"id"]));
        assert_eq!(m, msg(&[b"body", b"more"]));
    }

    #[test]
    fn pop_envelope_without_delimiter_is_identity() {
        let mut m = msg(&[b"body", b"more"]);
        let before = m.clone();
        let env = m.pop_envelope();
        assert!(env.is_empty());
        assert_eq!(m, before);
    }

    #[test]
    fn pop_envelope_with_multi_frame_envelope() {
        let mut m = msg(&[b"hop1", b"hop2", b"", b"body"]);
        let env = m.pop_envelope();
        assert_eq!(env, msg(&[b"hop1", b"hop2"]));
        assert_eq!(m, msg(&[b"body"]));
    }

    #[test]
    fn push_then_pop_envelope_round_trips() {
        let mut m = msg(&[b"body"]);
        m.push_envelope(msg(&[b"id"]));
        assert_eq!(m.len(), 3);
        let env = m.pop_envelope();
        assert_eq!(env, msg(&[b"id"]));
        assert_eq!(m, msg(&[b"body"]));
    }

    #[test]
    fn leading_delimiter_yields_empty_envelope_and_strips_it() {
        let mut m = msg(&[b"", b"body"]);
        let env = m.pop_envelope();
        assert!(env.is_empty());
        assert_eq!(m, msg(&[b"body"]));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn frames(min_len: usize) -> impl Strategy<Value = Vec<Bytes>> {
            proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), min_len..24).prop_map(Bytes::from),
                1..5,
            )
        }

        proptest! {
            // Composing an envelope onto any body and popping it again must
            // return the envelope and leave the body untouched.
            #[test]
            fn envelope_round_trip(env in frames(1), body in frames(0)) {
                let envelope = Message::from_frames(env.clone());
                let mut m = Message::from_frames(body.clone());
                m.push_envelope(envelope);

                let popped = m.pop_envelope();
                prop_assert_eq!(popped.into_frames(), env);
                prop_assert_eq!(m.into_frames(), body);
            }
        }
    }
}
