//! Wire message shape and framing.
//!
//! `Message` is the one fixed-shape record passed between the acceptor, proposer,
//! learner and transport. The frame layout is pinned to `network.go`'s byte-for-byte
//! format: a 4-byte little-endian length prefix followed by six 4-byte fields and a
//! trailing value blob.

use crate::{Ballot, InstanceId, NodeId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Frames larger than this are a fatal protocol error for the connection that sent them.
pub const MAX_FRAME_LEN: usize = 1024;

/// Fixed header size: length prefix + 6 u32 fields.
const HEADER_LEN: usize = 4 * 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Prepare = 1,
    Propose = 2,
    Promised = 3,
    Accepted = 4,
    PushLearn = 5,
    PullLearnRequest = 6,
    PullLearnResponse = 7,
    Closed = 8,
}

impl Kind {
    fn from_u32(v: u32) -> Option<Kind> {
        Some(match v {
            1 => Kind::Prepare,
            2 => Kind::Propose,
            3 => Kind::Promised,
            4 => Kind::Accepted,
            5 => Kind::PushLearn,
            6 => Kind::PullLearnRequest,
            7 => Kind::PullLearnResponse,
            8 => Kind::Closed,
            _ => return None,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: Kind,
    pub from: NodeId,
    pub instance_id: InstanceId,
    pub proposal_ballot: Ballot,
    pub reject_ballot: Ballot,
    pub accept_ballot: Ballot,
    pub accept_value: Bytes,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("from", &self.from)
            .field("instance_id", &self.instance_id)
            .field("proposal_ballot", &self.proposal_ballot)
            .field("reject_ballot", &self.reject_ballot)
            .field("accept_ballot", &self.accept_ballot)
            .field("accept_value_len", &self.accept_value.len())
            .finish()
    }
}

impl Message {
    pub fn closed(from: NodeId) -> Message {
        Message {
            kind: Kind::Closed,
            from,
            instance_id: 0,
            proposal_ballot: Ballot::NONE,
            reject_ballot: Ballot::NONE,
            accept_ballot: Ballot::NONE,
            accept_value: Bytes::new(),
        }
    }

    /// Encodes this message as a length-prefixed frame, little-endian throughout.
    pub fn encode(&self) -> Result<BytesMut, FrameError> {
        let total = HEADER_LEN + self.accept_value.len();
        if total > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(total as u32);
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(self.from);
        buf.put_u32_le(self.instance_id);
        buf.put_u32_le(self.proposal_ballot.0);
        buf.put_u32_le(self.reject_ballot.0);
        buf.put_u32_le(self.accept_ballot.0);
        buf.put_slice(&self.accept_value);
        Ok(buf)
    }

    /// Decodes a frame body (everything *after* the 4-byte length prefix has already
    /// been read off the wire and is passed here as `body`).
    pub fn decode(mut body: Bytes) -> Result<Message, FrameError> {
        if body.len() < HEADER_LEN - 4 {
            return Err(FrameError::Truncated);
        }
        let kind = Kind::from_u32(body.get_u32_le()).ok_or(FrameError::UnknownKind)?;
        let from = body.get_u32_le();
        let instance_id = body.get_u32_le();
        let proposal_ballot = Ballot(body.get_u32_le());
        let reject_ballot = Ballot(body.get_u32_le());
        let accept_ballot = Ballot(body.get_u32_le());
        let accept_value = body;

        Ok(Message {
            kind,
            from,
            instance_id,
            proposal_ballot,
            reject_ballot,
            accept_ballot,
            accept_value,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameError {
    TooLarge(usize),
    Truncated,
    UnknownKind,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge(n) => write!(f, "frame of {} bytes exceeds MAX_FRAME_LEN", n),
            FrameError::Truncated => write!(f, "frame shorter than the fixed header"),
            FrameError::UnknownKind => write!(f, "frame carries an unrecognized message kind"),
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            kind: Kind::Propose,
            from: 2,
            instance_id: 7,
            proposal_ballot: Ballot::new(3, 2),
            reject_ballot: Ballot::NONE,
            accept_ballot: Ballot::new(3, 2),
            accept_value: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn round_trips_through_the_wire_format() {
        let msg = sample();
        let mut frame = msg.encode().unwrap();
        let len = frame.get_u32_le() as usize;
        assert_eq!(len, HEADER_LEN + 5);
        let decoded = Message::decode(frame.freeze()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut msg = sample();
        msg.accept_value = Bytes::from(vec![0u8; MAX_FRAME_LEN]);
        assert_eq!(msg.encode().unwrap_err(), FrameError::TooLarge(HEADER_LEN + MAX_FRAME_LEN));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(99);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        assert_eq!(Message::decode(buf.freeze()).unwrap_err(), FrameError::UnknownKind);
    }
}
