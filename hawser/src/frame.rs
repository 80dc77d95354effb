use crate::shared::{ErrorKind, NetError, NetResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

/// Bytes in the fixed frame header: payload length, kind and message id, each
/// a 32-bit integer in the codec's byte order.
pub const HEADER_SIZE: usize = 12;

/// One decoded frame. `len` always mirrors `data.len()` on the encode path;
/// straight after a header-only `unpack` it is the payload length the caller
/// still has to read off the transport.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    len: u32,
    kind: u32,
    id: u32,
    data: Vec<u8>,
}

impl Message {
    /// Frame with `kind` 0. The routing id is `id`.
    #[inline]
    pub fn new(id: u32, data: Vec<u8>) -> Message {
        Message {
            len: data.len() as u32,
            kind: 0,
            id,
            data,
        }
    }

    #[inline]
    pub fn with_kind(id: u32, kind: u32, data: Vec<u8>) -> Message {
        Message {
            len: data.len() as u32,
            kind,
            id,
            data,
        }
    }

    #[inline]
    pub fn get_len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn get_kind(&self) -> u32 {
        self.kind
    }

    #[inline]
    pub fn get_id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    #[inline]
    pub fn set_kind(&mut self, kind: u32) {
        self.kind = kind;
    }

    /// Replaces the payload and re-derives `len`.
    #[inline]
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.len = data.len() as u32;
        self.data = data;
    }
}

/// Packs and unpacks the wire format: a 12-byte header followed by the
/// payload. Stateless after construction; safe to share across tasks.
#[derive(Debug, Clone)]
pub struct Codec {
    little_endian: bool,
    max_pack_size: u32,
}

impl Codec {
    #[inline]
    pub fn new(little_endian: bool, max_pack_size: u32) -> Codec {
        Codec {
            little_endian,
            max_pack_size,
        }
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    #[inline]
    pub fn max_pack_size(&self) -> u32 {
        self.max_pack_size
    }

    /// Emits `len || kind || id || data` in the configured byte order.
    pub fn pack(&self, message: &Message) -> NetResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + message.data.len());

        if self.little_endian {
            buf.write_u32::<LittleEndian>(message.len)?;
            buf.write_u32::<LittleEndian>(message.kind)?;
            buf.write_u32::<LittleEndian>(message.id)?;
        } else {
            buf.write_u32::<BigEndian>(message.len)?;
            buf.write_u32::<BigEndian>(message.kind)?;
            buf.write_u32::<BigEndian>(message.id)?;
        }
        buf.extend_from_slice(&message.data);

        Ok(buf)
    }

    /// Parses exactly the 12-byte header into a payload-less `Message`. The
    /// payload is read separately by the caller using `len`, so an oversize
    /// frame is refused before any payload buffer exists.
    pub fn unpack(&self, header: &[u8]) -> NetResult<Message> {
        if header.len() < HEADER_SIZE {
            return Err(NetError::Fatal(ErrorKind::Codec));
        }

        let (len, kind, id) = if self.little_endian {
            (
                LittleEndian::read_u32(&header[0..4]),
                LittleEndian::read_u32(&header[4..8]),
                LittleEndian::read_u32(&header[8..12]),
            )
        } else {
            (
                BigEndian::read_u32(&header[0..4]),
                BigEndian::read_u32(&header[4..8]),
                BigEndian::read_u32(&header[8..12]),
            )
        };

        if len > self.max_pack_size {
            return Err(NetError::Fatal(ErrorKind::FrameTooLarge));
        }

        Ok(Message {
            len,
            kind,
            id,
            data: Vec::new(),
        })
    }
}
