//! Fragment reassembly (RFC 6455 Section 5.4).
//!
//! A fragmented message is a first frame (FIN=0, Text or Binary), zero or
//! more continuation frames (FIN=0, opcode 0x0) and a final continuation
//! frame (FIN=1). Control frames may be interleaved between fragments; they
//! are handled by the connection and never reach the [`Reassembler`].

use crate::error::ProtocolError;
use crate::frame::{Frame, Opcode};

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `Text` or `Binary`: the opcode of the initiating frame.
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Message {
        Message {
            opcode: Opcode::Text,
            payload: text.into().into_bytes(),
        }
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Message {
        Message {
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.opcode == Opcode::Text
    }

    /// The payload as a string, for text messages. Text payloads are
    /// validated as UTF-8 before a connection hands them out.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating { opcode: Opcode, buffer: Vec<u8> },
}

/// Turns a sequence of data frames into complete messages.
#[derive(Debug)]
pub struct Reassembler {
    state: State,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Reassembler {
        Reassembler {
            state: State::Idle,
            max_message_size,
        }
    }

    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, State::Accumulating { .. })
    }

    /// Bytes accumulated so far for the message in progress.
    pub fn buffered_len(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Accumulating { buffer, .. } => buffer.len(),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooBig {
                size: size as u64,
                max: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Feed one data frame.
    ///
    /// Returns `Ok(Some(message))` when the frame completes a message and
    /// `Ok(None)` while fragments are still accumulating. Any error resets
    /// the state to idle; the connection is expected to be torn down.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        let result = self.advance(frame);
        if result.is_err() {
            self.state = State::Idle;
        }
        result
    }

    fn advance(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match (&mut self.state, frame.opcode) {
            (State::Idle, Opcode::Text | Opcode::Binary) => {
                self.check_size(frame.payload.len())?;
                if frame.fin {
                    return Ok(Some(Message {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    }));
                }
                self.state = State::Accumulating {
                    opcode: frame.opcode,
                    buffer: frame.payload,
                };
                Ok(None)
            }
            (State::Idle, Opcode::Continuation) => Err(ProtocolError::UnexpectedContinuation),
            (State::Accumulating { .. }, Opcode::Text | Opcode::Binary) => {
                Err(ProtocolError::InterleavedDataFrame)
            }
            (State::Accumulating { buffer, .. }, Opcode::Continuation) => {
                let total = buffer.len() + frame.payload.len();
                if total > self.max_message_size {
                    return Err(ProtocolError::MessageTooBig {
                        size: total as u64,
                        max: self.max_message_size,
                    });
                }
                buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                match std::mem::replace(&mut self.state, State::Idle) {
                    State::Accumulating { opcode, buffer } => Ok(Some(Message {
                        opcode,
                        payload: buffer,
                    })),
                    State::Idle => Ok(None),
                }
            }
            // Control frames are dispatched by the connection before reassembly
            (_, control) => Err(ProtocolError::InvalidOpcode(control as u8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: Opcode, payload: &[u8], fin: bool) -> Frame {
        Frame::new(opcode, payload.to_vec(), fin)
    }

    #[test]
    fn test_single_frame_message() {
        let mut r = Reassembler::new(1024);
        let msg = r.push(frame(Opcode::Text, b"hi", true)).unwrap().unwrap();
        assert_eq!(msg, Message::text("hi"));
        assert!(!r.is_accumulating());
    }

    #[test]
    fn test_three_fragments() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.push(frame(Opcode::Text, b"ab", false)).unwrap(), None);
        assert!(r.is_accumulating());
        assert_eq!(r.push(frame(Opcode::Continuation, b"cd", false)).unwrap(), None);
        assert_eq!(r.buffered_len(), 4);
        let msg = r
            .push(frame(Opcode::Continuation, b"ef", true))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.payload, b"abcdef");
        assert!(!r.is_accumulating());
    }

    #[test]
    fn test_binary_opcode_comes_from_first_fragment() {
        let mut r = Reassembler::new(1024);
        r.push(frame(Opcode::Binary, &[1], false)).unwrap();
        let msg = r
            .push(frame(Opcode::Continuation, &[2], true))
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::binary(vec![1, 2]));
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut r = Reassembler::new(1024);
        assert_eq!(
            r.push(frame(Opcode::Continuation, b"x", true)),
            Err(ProtocolError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_new_message_during_fragments() {
        let mut r = Reassembler::new(1024);
        r.push(frame(Opcode::Text, b"a", false)).unwrap();
        assert_eq!(
            r.push(frame(Opcode::Binary, b"b", true)),
            Err(ProtocolError::InterleavedDataFrame)
        );
        assert!(!r.is_accumulating(), "error resets to idle");
    }

    #[test]
    fn test_size_limit_across_fragments() {
        let mut r = Reassembler::new(4);
        r.push(frame(Opcode::Binary, b"abc", false)).unwrap();
        let err = r.push(frame(Opcode::Continuation, b"de", true)).unwrap_err();
        assert_eq!(err, ProtocolError::MessageTooBig { size: 5, max: 4 });
        assert_eq!(err.close_code(), crate::CloseCode::MessageTooBig);
    }

    #[test]
    fn test_size_limit_single_frame() {
        let mut r = Reassembler::new(2);
        assert!(matches!(
            r.push(frame(Opcode::Text, b"abc", true)),
            Err(ProtocolError::MessageTooBig { size: 3, max: 2 })
        ));
    }

    #[test]
    fn test_exact_limit_is_allowed() {
        let mut r = Reassembler::new(4);
        r.push(frame(Opcode::Binary, b"ab", false)).unwrap();
        assert!(r.push(frame(Opcode::Continuation, b"cd", true)).unwrap().is_some());
    }

    #[test]
    fn test_control_frame_rejected() {
        let mut r = Reassembler::new(16);
        assert!(r.push(frame(Opcode::Ping, b"", true)).is_err());
    }

    #[test]
    fn test_as_text() {
        assert_eq!(Message::text("hey").as_text(), Some("hey"));
        assert_eq!(Message::binary(b"hey".to_vec()).as_text(), None);
    }
}
