//! Frame encoder and incremental decoder
//!
//! Frames have no outer length prefix, so the decoder keeps unread bytes
//! buffered and only yields a frame once every field of it has arrived.
//! Integers are 4-byte big-endian; strings and byte arrays are a 4-byte
//! length followed by the bytes.
//!
//! ```text
//! toward broker:  [kind:u8][nonce:u32][payload...]
//! from broker:    [kind:u8][payload...]
//! RESPONSE:       [0:u8][nonce:u32][original kind:u8][reply payload...]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::{DEFAULT_MAX_FIELD_SIZE, INT_SIZE, KIND_SIZE};
use super::kind::{Direction, Framing, MessageKind};
use super::message::{Frame, Push, Reply, Request};
use crate::error::ProtocolError;
use crate::registry::ServiceId;

/// Encode a frame into a fresh buffer
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len_hint(frame));
    encode_into(frame, &mut buf);
    buf.freeze()
}

/// Append an encoded frame to `buf`
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) {
    buf.put_u8(frame.kind().into());

    match frame {
        Frame::Request { nonce, request } => {
            buf.put_u32(*nonce);
            match request {
                Request::Register { name } => put_string(buf, name),
                Request::Unregister { service } | Request::Connect { service } => {
                    put_service(buf, service)
                }
                Request::ConnectName { name } => put_string(buf, name),
                Request::Lookup { query } => put_string(buf, query),
                Request::Send { channel, data } => {
                    buf.put_u32(*channel);
                    put_bytes(buf, data);
                }
                Request::Close { channel } => buf.put_u32(*channel),
                Request::EndSession => {}
            }
        }
        Frame::Response { nonce, reply } => {
            buf.put_u32(*nonce);
            buf.put_u8(reply.original_kind().into());
            match reply {
                Reply::Registered { id } => buf.put_u32(*id),
                Reply::Connected { channel, .. } => buf.put_u32(*channel),
                Reply::LookupResult { hosts } => {
                    buf.put_u32(hosts.len() as u32);
                    for host in hosts {
                        put_service(buf, host);
                    }
                }
            }
        }
        Frame::Push(push) => match push {
            Push::Connect { service, channel } => {
                put_service(buf, service);
                buf.put_u32(*channel);
            }
            Push::Send { channel, data } => {
                buf.put_u32(*channel);
                put_bytes(buf, data);
            }
            Push::Close { channel } => buf.put_u32(*channel),
            Push::EndSession => {}
        },
    }
}

/// Check every length-prefixed field of `frame` fits under `max`
///
/// Frames that fail this would be fatal for the peer's decoder.
pub fn check_field_sizes(frame: &Frame, max: u32) -> Result<(), ProtocolError> {
    let fits = |len: usize| -> Result<(), ProtocolError> {
        match u32::try_from(len) {
            Ok(size) if size <= max => Ok(()),
            Ok(size) => Err(ProtocolError::FieldTooLarge { size, max }),
            Err(_) => Err(ProtocolError::FieldTooLarge {
                size: u32::MAX,
                max,
            }),
        }
    };

    match frame {
        Frame::Request { request, .. } => match request {
            Request::Register { name } | Request::ConnectName { name } => fits(name.len()),
            Request::Lookup { query } => fits(query.len()),
            Request::Unregister { service } | Request::Connect { service } => {
                fits(service.name.len())
            }
            Request::Send { data, .. } => fits(data.len()),
            Request::Close { .. } | Request::EndSession => Ok(()),
        },
        Frame::Response { reply, .. } => match reply {
            Reply::LookupResult { hosts } => {
                fits(hosts.len())?;
                hosts.iter().try_for_each(|host| fits(host.name.len()))
            }
            Reply::Registered { .. } | Reply::Connected { .. } => Ok(()),
        },
        Frame::Push(push) => match push {
            Push::Connect { service, .. } => fits(service.name.len()),
            Push::Send { data, .. } => fits(data.len()),
            Push::Close { .. } | Push::EndSession => Ok(()),
        },
    }
}

fn encoded_len_hint(frame: &Frame) -> usize {
    let payload = match frame {
        Frame::Request {
            request: Request::Send { data, .. },
            ..
        }
        | Frame::Push(Push::Send { data, .. }) => data.len() + 2 * INT_SIZE,
        _ => 64,
    };
    KIND_SIZE + INT_SIZE + payload
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_service(buf: &mut BytesMut, service: &ServiceId) {
    put_string(buf, &service.name);
    buf.put_u32(service.id);
}

/// Why a decode attempt stopped
enum Stop {
    /// More bytes are needed
    Incomplete,
    /// The stream is broken
    Fatal(ProtocolError),
}

impl From<ProtocolError> for Stop {
    fn from(e: ProtocolError) -> Self {
        Stop::Fatal(e)
    }
}

/// Incremental decoder for one direction of a connection
#[derive(Debug)]
pub struct FrameDecoder {
    direction: Direction,
    max_field_size: u32,
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder for frames travelling in `direction`
    pub fn new(direction: Direction) -> Self {
        Self::with_max_field_size(direction, DEFAULT_MAX_FIELD_SIZE)
    }

    /// Create a decoder with an explicit cap on length-prefixed fields
    pub fn with_max_field_size(direction: Direction, max_field_size: u32) -> Self {
        Self {
            direction,
            max_field_size,
            buf: BytesMut::new(),
        }
    }

    /// Buffer to read socket data into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame
    ///
    /// Returns `Ok(None)` when more data is needed. Any error is fatal for
    /// the connection; the buffer is left untouched.
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = &self.buf[..];
        let parsed = {
            let mut reader = Reader {
                cur: &mut cursor,
                max_field_size: self.max_field_size,
            };
            reader.frame(self.direction)
        };

        match parsed {
            Ok(frame) => {
                let consumed = self.buf.len() - cursor.len();
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(Stop::Incomplete) => Ok(None),
            Err(Stop::Fatal(e)) => Err(e),
        }
    }

    /// Check the stream ended on a frame boundary
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Truncated)
        }
    }
}

struct Reader<'a, 'b> {
    cur: &'a mut &'b [u8],
    max_field_size: u32,
}

impl Reader<'_, '_> {
    fn frame(&mut self, direction: Direction) -> Result<Frame, Stop> {
        let kind = MessageKind::try_from(self.u8()?)?;

        let nonce = match kind.framing(direction) {
            Framing::Forbidden => {
                return Err(ProtocolError::UnexpectedKind { kind, direction }.into())
            }
            Framing::WithNonce => Some(self.u32()?),
            Framing::Bare => None,
        };

        match (direction, nonce) {
            (Direction::ToBroker, Some(nonce)) => Ok(Frame::Request {
                nonce,
                request: self.request(kind)?,
            }),
            (Direction::FromBroker, None) => self.from_broker(kind),
            _ => Err(ProtocolError::UnexpectedKind { kind, direction }.into()),
        }
    }

    fn request(&mut self, kind: MessageKind) -> Result<Request, Stop> {
        Ok(match kind {
            MessageKind::Register => Request::Register {
                name: self.string()?,
            },
            MessageKind::Unregister => Request::Unregister {
                service: self.service()?,
            },
            MessageKind::Connect => Request::Connect {
                service: self.service()?,
            },
            MessageKind::ConnectName => Request::ConnectName {
                name: self.string()?,
            },
            MessageKind::Lookup => Request::Lookup {
                query: self.string()?,
            },
            MessageKind::Send => {
                let channel = self.u32()?;
                Request::Send {
                    channel,
                    data: self.bytes()?,
                }
            }
            MessageKind::Close => Request::Close {
                channel: self.u32()?,
            },
            MessageKind::EndSession => Request::EndSession,
            MessageKind::Response => {
                return Err(ProtocolError::UnexpectedKind {
                    kind,
                    direction: Direction::ToBroker,
                }
                .into())
            }
        })
    }

    fn from_broker(&mut self, kind: MessageKind) -> Result<Frame, Stop> {
        Ok(match kind {
            MessageKind::Response => {
                let nonce = self.u32()?;
                let original = MessageKind::try_from(self.u8()?)?;
                Frame::Response {
                    nonce,
                    reply: self.reply(original)?,
                }
            }
            MessageKind::Connect => {
                let service = self.service()?;
                Frame::Push(Push::Connect {
                    service,
                    channel: self.u32()?,
                })
            }
            MessageKind::Send => {
                let channel = self.u32()?;
                Frame::Push(Push::Send {
                    channel,
                    data: self.bytes()?,
                })
            }
            MessageKind::Close => Frame::Push(Push::Close {
                channel: self.u32()?,
            }),
            MessageKind::EndSession => Frame::Push(Push::EndSession),
            _ => {
                return Err(ProtocolError::UnexpectedKind {
                    kind,
                    direction: Direction::FromBroker,
                }
                .into())
            }
        })
    }

    fn reply(&mut self, original: MessageKind) -> Result<Reply, Stop> {
        Ok(match original {
            MessageKind::Register => Reply::Registered { id: self.u32()? },
            MessageKind::Connect | MessageKind::ConnectName => Reply::Connected {
                by_name: original == MessageKind::ConnectName,
                channel: self.u32()?,
            },
            MessageKind::Lookup => {
                let count = self.length()?;
                let mut hosts = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    hosts.push(self.service()?);
                }
                Reply::LookupResult { hosts }
            }
            other => return Err(ProtocolError::UnexpectedReply(other).into()),
        })
    }

    fn u8(&mut self) -> Result<u8, Stop> {
        if self.cur.remaining() < KIND_SIZE {
            return Err(Stop::Incomplete);
        }
        Ok(self.cur.get_u8())
    }

    fn u32(&mut self) -> Result<u32, Stop> {
        if self.cur.remaining() < INT_SIZE {
            return Err(Stop::Incomplete);
        }
        Ok(self.cur.get_u32())
    }

    /// Length prefix, checked against the field cap before waiting for data
    fn length(&mut self) -> Result<usize, Stop> {
        let size = self.u32()?;
        if size > self.max_field_size {
            return Err(ProtocolError::FieldTooLarge {
                size,
                max: self.max_field_size,
            }
            .into());
        }
        Ok(size as usize)
    }

    fn bytes(&mut self) -> Result<Bytes, Stop> {
        let len = self.length()?;
        if self.cur.remaining() < len {
            return Err(Stop::Incomplete);
        }
        Ok(self.cur.copy_to_bytes(len))
    }

    fn string(&mut self) -> Result<String, Stop> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn service(&mut self) -> Result<ServiceId, Stop> {
        let name = self.string()?;
        Ok(ServiceId::new(name, self.u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_layout() {
        let frame = Frame::Request {
            nonce: 0x0102_0304,
            request: Request::Connect {
                service: ServiceId::new("ab", 5),
            },
        };
        let bytes = encode(&frame);

        assert_eq!(
            &bytes[..],
            &[
                3, // CONNECT
                0x01, 0x02, 0x03, 0x04, // nonce
                0, 0, 0, 2, b'a', b'b', // name
                0, 0, 0, 5, // id
            ]
        );
    }

    #[test]
    fn test_push_has_no_nonce() {
        let frame = Frame::Push(Push::Close { channel: 9 });
        assert_eq!(&encode(&frame)[..], &[7, 0, 0, 0, 9]);

        let frame = Frame::Push(Push::EndSession);
        assert_eq!(&encode(&frame)[..], &[8]);
    }

    #[test]
    fn test_response_layout() {
        let frame = Frame::Response {
            nonce: 2,
            reply: Reply::Connected {
                by_name: true,
                channel: 0,
            },
        };
        assert_eq!(
            &encode(&frame)[..],
            &[0, 0, 0, 0, 2, 4, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let frame = Frame::Request {
            nonce: 11,
            request: Request::Send {
                channel: 4,
                data: Bytes::from_static(b"hello"),
            },
        };
        let bytes = encode(&frame);

        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        for (i, byte) in bytes.iter().enumerate() {
            assert_eq!(decoder.decode().unwrap(), None, "early frame at byte {}", i);
            decoder.extend(&[*byte]);
        }
        assert_eq!(decoder.decode().unwrap(), Some(frame));
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut decoder = FrameDecoder::new(Direction::FromBroker);
        let lookup = Frame::Response {
            nonce: 1,
            reply: Reply::LookupResult {
                hosts: vec![ServiceId::new("web", 0), ServiceId::new("web", 1)],
            },
        };
        let push = Frame::Push(Push::Connect {
            service: ServiceId::new("web", 1),
            channel: 3,
        });
        decoder.extend(&encode(&lookup));
        decoder.extend(&encode(&push));

        assert_eq!(decoder.decode().unwrap(), Some(lookup));
        assert_eq!(decoder.decode().unwrap(), Some(push));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        decoder.extend(&[42, 0, 0, 0, 0]);
        assert_eq!(decoder.decode(), Err(ProtocolError::UnknownKind(42)));
    }

    #[test]
    fn test_kind_illegal_for_direction() {
        // RESPONSE sent toward the broker
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        decoder.extend(&[0, 0, 0, 0, 1]);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::UnexpectedKind {
                kind: MessageKind::Response,
                ..
            })
        ));

        // LOOKUP sent from the broker
        let mut decoder = FrameDecoder::new(Direction::FromBroker);
        decoder.extend(&[5]);
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn test_response_to_fire_and_forget_kind_is_fatal() {
        let mut decoder = FrameDecoder::new(Direction::FromBroker);
        decoder.extend(&[0, 0, 0, 0, 1, 6]);
        assert_eq!(
            decoder.decode(),
            Err(ProtocolError::UnexpectedReply(MessageKind::Send))
        );
    }

    #[test]
    fn test_oversized_field_rejected_before_payload_arrives() {
        let mut decoder = FrameDecoder::with_max_field_size(Direction::ToBroker, 16);
        // REGISTER, nonce 0, name length 17 with no name bytes yet
        decoder.extend(&[1, 0, 0, 0, 0, 0, 0, 0, 17]);
        assert_eq!(
            decoder.decode(),
            Err(ProtocolError::FieldTooLarge { size: 17, max: 16 })
        );
    }

    #[test]
    fn test_check_field_sizes() {
        let send = Frame::Push(Push::Send {
            channel: 1,
            data: Bytes::from(vec![0u8; 17]),
        });
        assert_eq!(
            check_field_sizes(&send, 16),
            Err(ProtocolError::FieldTooLarge { size: 17, max: 16 })
        );
        assert_eq!(check_field_sizes(&send, 17), Ok(()));

        let register = Frame::Request {
            nonce: 0,
            request: Request::Register {
                name: "x".repeat(20),
            },
        };
        assert!(check_field_sizes(&register, 16).is_err());

        let lookup = Frame::Response {
            nonce: 0,
            reply: Reply::LookupResult {
                hosts: vec![ServiceId::new("a", 0); 3],
            },
        };
        assert!(check_field_sizes(&lookup, 2).is_err());
        assert_eq!(check_field_sizes(&lookup, 3), Ok(()));

        let close = Frame::Push(Push::Close { channel: 1 });
        assert_eq!(check_field_sizes(&close, 0), Ok(()));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut decoder = FrameDecoder::new(Direction::ToBroker);
        decoder.extend(&[5, 0, 0, 0, 0, 0, 0, 0, 2, 0xC3, 0x28]);
        assert_eq!(decoder.decode(), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_truncated_at_end_of_stream() {
        let mut decoder = FrameDecoder::new(Direction::FromBroker);
        decoder.extend(&[6, 0, 0]);
        assert_eq!(decoder.decode().unwrap(), None);
        assert_eq!(decoder.finish(), Err(ProtocolError::Truncated));
    }
}
