//! SMUX framing state machine.
//!
//! The demultiplexer turns a sequence of inbound packets into complete
//! frames. Each call to [`Demuxer::step`] performs one transition:
//!
//! ```text
//! Header  --16 bytes accumulated-->  Payload  --payload complete-->  Dispatch  --frame-->  Header
//! ```
//!
//! A single inbound packet may hold several frames back to back, and a frame
//! may span several inbound packets. When the unread part of an inbound packet
//! is exactly the payload, the packet itself becomes the payload and no bytes
//! are copied.

use sni_protocol::{ProtocolError, SMUX_HEADER_SIZE, SmuxHeader};

use crate::config::MAX_PACKET_SIZE;
use crate::packet::Packet;

enum State {
    Header,
    Payload {
        header: SmuxHeader,
        remaining: usize,
        partial: Option<Packet>,
    },
    Dispatch {
        header: SmuxHeader,
        payload: Packet,
    },
}

/// Result of one transition.
pub(crate) enum Step {
    /// Progress was made; step again.
    Advance,
    /// The inbound packet is exhausted.
    NeedData,
    /// A complete frame.
    Frame { header: SmuxHeader, payload: Packet },
    /// The stream cannot be framed.
    Corrupt(ProtocolError),
}

pub(crate) struct Demuxer {
    state: State,
    header: [u8; SMUX_HEADER_SIZE],
    header_filled: usize,
}

impl Demuxer {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Header,
            header: [0u8; SMUX_HEADER_SIZE],
            header_filled: 0,
        }
    }

    /// Run one transition against `inbound`.
    ///
    /// `rent` supplies payload buffers. On the zero-copy path `inbound` is
    /// taken and left `None`.
    pub(crate) fn step<F>(&mut self, inbound: &mut Option<Packet>, rent: &mut F) -> Step
    where
        F: FnMut(usize) -> Packet,
    {
        let state = std::mem::replace(&mut self.state, State::Header);
        let (next, step) = self.transition(state, inbound, rent);
        self.state = next;
        step
    }

    fn transition<F>(
        &mut self,
        state: State,
        inbound: &mut Option<Packet>,
        rent: &mut F,
    ) -> (State, Step)
    where
        F: FnMut(usize) -> Packet,
    {
        match state {
            State::Header => {
                let Some(source) = inbound.as_mut() else {
                    return (State::Header, Step::NeedData);
                };
                self.header_filled += source.take_data(&mut self.header[self.header_filled..]);
                if self.header_filled < SMUX_HEADER_SIZE {
                    return (State::Header, Step::NeedData);
                }

                self.header_filled = 0;
                match SmuxHeader::decode(&mut self.header.as_slice()) {
                    // a payload is one TDS packet
                    Ok(header) if header.payload_length() > MAX_PACKET_SIZE => (
                        State::Header,
                        Step::Corrupt(ProtocolError::InvalidFrameLength(header.frame_length())),
                    ),
                    Ok(header) => (
                        State::Payload {
                            header,
                            remaining: header.payload_length(),
                            partial: None,
                        },
                        Step::Advance,
                    ),
                    Err(e) => (State::Header, Step::Corrupt(e)),
                }
            }

            State::Payload {
                header,
                remaining: 0,
                partial: None,
            } => (
                State::Dispatch {
                    header,
                    payload: rent(0),
                },
                Step::Advance,
            ),

            State::Payload {
                header,
                mut remaining,
                partial,
            } => {
                let available = inbound.as_ref().map_or(0, Packet::data_left);
                if available == 0 {
                    return (
                        State::Payload {
                            header,
                            remaining,
                            partial,
                        },
                        Step::NeedData,
                    );
                }

                let mut payload = match partial {
                    Some(packet) => packet,
                    None if available == remaining => {
                        if let Some(mut adopted) = inbound.take() {
                            adopted.trim_consumed();
                            return (
                                State::Dispatch {
                                    header,
                                    payload: adopted,
                                },
                                Step::Advance,
                            );
                        }
                        rent(remaining)
                    }
                    None => rent(remaining),
                };

                if let Some(source) = inbound.as_mut() {
                    remaining -= source.take_into(&mut payload, remaining);
                }

                if remaining > 0 {
                    (
                        State::Payload {
                            header,
                            remaining,
                            partial: Some(payload),
                        },
                        Step::NeedData,
                    )
                } else {
                    (State::Dispatch { header, payload }, Step::Advance)
                }
            }

            State::Dispatch { header, payload } => (State::Header, Step::Frame { header, payload }),
        }
    }

    /// Abandon any frame in progress, returning its payload buffer.
    pub(crate) fn reset(&mut self) -> Option<Packet> {
        self.header_filled = 0;
        match std::mem::replace(&mut self.state, State::Header) {
            State::Header => None,
            State::Payload { partial, .. } => partial,
            State::Dispatch { payload, .. } => Some(payload),
        }
    }
}
