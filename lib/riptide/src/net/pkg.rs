use crate::net::buffer::Buffer;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use crate::protocol::ErrMsg;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Fixed envelope header: u32 payload length, u16 request id, u8 message
/// type, u8 check byte. All little-endian.
pub const HEADER_SIZE: usize = 8;

/// Frames larger than this are treated as protocol desync; the value is
/// chosen so one maximal frame always fits a stream buffer.
pub const MAX_PKG_SIZE: usize = 8 * 65536 - HEADER_SIZE;

/// Check byte guarding against misaligned frames.
#[inline]
pub fn checkbit(tp: u8) -> u8 {
    tp ^ 0xFF
}

/// Write one whole frame into a stream write buffer. `Wait` when the
/// buffer lacks capacity for the entire frame; frames are never split
/// across submissions.
pub fn encode_frame(
    buffer: &mut Buffer,
    pid: u16,
    tp: u8,
    data: &[u8],
) -> NetworkResult<()> {
    if data.len() > MAX_PKG_SIZE {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let total = HEADER_SIZE + data.len();

    if buffer.free_capacity() < total {
        return Err(NetworkError::Wait);
    }

    {
        let mut stream = Cursor::new(buffer.spare_mut());

        stream.write_u32::<LittleEndian>(data.len() as u32)?;
        stream.write_u16::<LittleEndian>(pid)?;
        stream.write_u8(tp)?;
        stream.write_u8(checkbit(tp))?;
        stream.write_all(data)?;
    }

    buffer.commit(total);

    Ok(())
}

/// A single wire packet: envelope fields plus an owned, opaque payload.
/// The check byte is not stored; it is derived at encode time and verified
/// at decode time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Pkg {
    pub pid: u16,
    pub tp: u8,
    pub data: Vec<u8>,
}

impl Pkg {
    #[inline]
    pub fn new(pid: u16, tp: u8, data: Vec<u8>) -> Pkg {
        Pkg { pid, tp, data }
    }

    /// An error reply carrying a `{error_msg: ...}` record.
    pub fn err(pid: u16, tp: u8, msg: &str) -> Pkg {
        let data = rmp_serde::to_vec_named(&ErrMsg {
            error_msg: msg.to_string(),
        })
        .unwrap_or_default();

        Pkg { pid, tp, data }
    }

    /// Total size on the wire.
    #[inline]
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Encode the packet into a stream write buffer. Returns `Wait` when
    /// the buffer lacks capacity for the whole frame so the caller can
    /// apply backpressure instead of interleaving partial frames.
    #[inline]
    pub fn encode_into(&self, buffer: &mut Buffer) -> NetworkResult<()> {
        encode_frame(buffer, self.pid, self.tp, &self.data)
    }

    /// Try to decode one whole packet off the front of `data`. Returns the
    /// packet and the number of bytes consumed, or `None` when the frame is
    /// still incomplete.
    pub fn decode(data: &[u8]) -> Result<Option<(Pkg, usize)>, ErrorType> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut stream = Cursor::new(data);

        let len = stream
            .read_u32::<LittleEndian>()
            .map_err(|err| ErrorType::Io(err.kind()))? as usize;
        let pid = stream
            .read_u16::<LittleEndian>()
            .map_err(|err| ErrorType::Io(err.kind()))?;
        let tp = stream.read_u8().map_err(|err| ErrorType::Io(err.kind()))?;
        let check = stream.read_u8().map_err(|err| ErrorType::Io(err.kind()))?;

        if check != checkbit(tp) {
            return Err(ErrorType::Checkbit);
        }

        if len > MAX_PKG_SIZE {
            return Err(ErrorType::PayloadTooLarge);
        }

        if data.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + len].to_vec();

        Ok(Some((Pkg::new(pid, tp, payload), HEADER_SIZE + len)))
    }

    /// Encode to a standalone byte vector. Test and handshake helper.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_size());

        bytes
            .write_u32::<LittleEndian>(self.data.len() as u32)
            .expect("write to vec");
        bytes.write_u16::<LittleEndian>(self.pid).expect("write to vec");
        bytes.write_u8(self.tp).expect("write to vec");
        bytes.write_u8(checkbit(self.tp)).expect("write to vec");
        bytes.extend_from_slice(&self.data);

        bytes
    }
}
