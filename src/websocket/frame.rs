//! WebSocket frame codec (RFC 6455 section 5.2)

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload accepted in a single frame or reassembled message
pub const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Trailer stripped from every permessage-deflate message
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[rustfmt::skip]
pub mod opcode {
  pub const CONTINUATION: u8 = 0x0;
  pub const TEXT: u8 = 0x1;
  pub const BINARY: u8 = 0x2;
  pub const CLOSE: u8 = 0x8;
  pub const PING: u8 = 0x9;
  pub const PONG: u8 = 0xa;
}

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const MASK_BIT: u8 = 0x80;

/// One frame as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  /// FIN, RSV1-3 and opcode
  pub first_byte: u8,
  pub mask: Option<[u8; 4]>,
  /// Unmasked payload
  pub payload: Bytes,
  /// Exact bytes received
  pub raw: Bytes,
}

impl Frame {
  pub fn fin(&self) -> bool {
    self.first_byte & FIN_BIT != 0
  }

  /// Per-message compressed bit
  pub fn rsv1(&self) -> bool {
    self.first_byte & RSV1_BIT != 0
  }

  pub fn opcode(&self) -> u8 {
    self.first_byte & 0x0f
  }

  /// Text, binary or continuation
  pub fn is_data(&self) -> bool {
    matches!(
      self.opcode(),
      opcode::TEXT | opcode::BINARY | opcode::CONTINUATION
    )
  }
}

/// Serialize a frame, masking `payload` when `mask` is set
pub fn encode(first_byte: u8, mask: Option<[u8; 4]>, payload: &[u8]) -> Bytes {
  let mut out = BytesMut::with_capacity(payload.len() + 14);
  out.put_u8(first_byte);
  let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
  let len = payload.len();
  if len < 126 {
    out.put_u8(mask_bit | len as u8);
  } else if len <= u16::MAX as usize {
    out.put_u8(mask_bit | 126);
    out.put_u16(len as u16);
  } else {
    out.put_u8(mask_bit | 127);
    out.put_u64(len as u64);
  }
  match mask {
    Some(key) => {
      out.put_slice(&key);
      out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    }
    None => out.put_slice(payload),
  }
  out.freeze()
}

/// Build the first byte of a frame
pub fn first_byte(fin: bool, rsv1: bool, opcode: u8) -> u8 {
  let mut b = opcode & 0x0f;
  if fin {
    b |= FIN_BIT;
  }
  if rsv1 {
    b |= RSV1_BIT;
  }
  b
}

/// A read that failed after part of a frame had arrived
#[derive(Debug)]
pub struct FrameReadError {
  /// Bytes of the unfinished frame
  pub partial: Bytes,
  pub error: Error,
}

async fn fill<R>(reader: &mut R, raw: &mut BytesMut, n: usize) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
{
  let target = raw.len() + n;
  raw.reserve(n);
  while raw.len() < target {
    let remaining = (target - raw.len()) as u64;
    let read = (&mut *reader).take(remaining).read_buf(raw).await?;
    if read == 0 {
      return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
  }
  Ok(())
}

/// Read one frame. `Ok(None)` is a clean close between frames.
///
/// Every read is bounded by the frame layout, so nothing past the frame is consumed.
pub async fn read_frame<R>(reader: &mut R) -> std::result::Result<Option<Frame>, FrameReadError>
where
  R: AsyncRead + Unpin,
{
  let mut raw = BytesMut::with_capacity(1024);
  macro_rules! fill_or_fail {
    ($n:expr) => {
      if let Err(e) = fill(reader, &mut raw, $n).await {
        return Err(FrameReadError {
          partial: raw.freeze(),
          error: e.into(),
        });
      }
    };
  }

  match (&mut *reader).take(1).read_buf(&mut raw).await {
    Ok(0) => return Ok(None),
    Ok(_) => {}
    Err(e) => {
      return Err(FrameReadError {
        partial: Bytes::new(),
        error: e.into(),
      })
    }
  }
  fill_or_fail!(1);
  let second = raw[1];
  let masked = second & MASK_BIT != 0;
  let len = match second & 0x7f {
    126 => {
      fill_or_fail!(2);
      u16::from_be_bytes([raw[2], raw[3]]) as u64
    }
    127 => {
      fill_or_fail!(8);
      let mut b = [0u8; 8];
      b.copy_from_slice(&raw[2..10]);
      u64::from_be_bytes(b)
    }
    n => n as u64,
  };
  if len > MAX_PAYLOAD {
    return Err(FrameReadError {
      partial: raw.freeze(),
      error: Error::invalid_request(format!("WebSocket frame of {} bytes is too large", len)),
    });
  }
  let mask = if masked {
    fill_or_fail!(4);
    let at = raw.len() - 4;
    Some([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
  } else {
    None
  };
  let header_len = raw.len();
  fill_or_fail!(len as usize);

  let mut payload = raw[header_len..].to_vec();
  if let Some(key) = mask {
    for (i, b) in payload.iter_mut().enumerate() {
      *b ^= key[i % 4];
    }
  }
  Ok(Some(Frame {
    first_byte: raw[0],
    mask,
    payload: Bytes::from(payload),
    raw: raw.freeze(),
  }))
}

/// Per-direction permessage-deflate decoder; keeps the sliding window across messages
pub struct Inflater {
  inner: Decompress,
}

impl Default for Inflater {
  fn default() -> Self {
    Self::new()
  }
}

impl Inflater {
  pub fn new() -> Self {
    Self {
      inner: Decompress::new(false),
    }
  }

  /// Decompress one complete message payload
  pub fn inflate(&mut self, payload: &[u8]) -> Result<Bytes> {
    let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
    input.extend_from_slice(payload);
    input.extend_from_slice(&DEFLATE_TAIL);

    let start = self.inner.total_in();
    let mut out = Vec::with_capacity(payload.len() * 4 + 64);
    loop {
      if out.capacity() - out.len() < 1024 {
        out.reserve(out.len().max(4096));
      }
      let (in_before, out_before) = (self.inner.total_in(), self.inner.total_out());
      let consumed = (in_before - start) as usize;
      let status = self
        .inner
        .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
        .map_err(|e| Error::other(format!("permessage-deflate inflate failed: {}", e)))?;
      let consumed = (self.inner.total_in() - start) as usize;
      if out.len() as u64 > MAX_PAYLOAD {
        return Err(Error::other("inflated WebSocket message is too large"));
      }
      if status == Status::StreamEnd {
        break;
      }
      if consumed >= input.len() && out.len() < out.capacity() {
        break;
      }
      if self.inner.total_in() == in_before && self.inner.total_out() == out_before {
        break;
      }
    }
    Ok(Bytes::from(out))
  }
}

/// Compress one message as a self-contained permessage-deflate payload
pub fn deflate_message(data: &[u8]) -> Result<Bytes> {
  let mut compress = Compress::new(Compression::default(), false);
  let mut out = Vec::with_capacity(data.len() / 2 + 64);
  loop {
    if out.capacity() - out.len() < 1024 {
      out.reserve(out.len().max(4096));
    }
    let consumed = compress.total_in() as usize;
    compress
      .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
      .map_err(|e| Error::other(format!("permessage-deflate deflate failed: {}", e)))?;
    if compress.total_in() as usize >= data.len() && out.len() < out.capacity() {
      break;
    }
  }
  if out.ends_with(&DEFLATE_TAIL) {
    out.truncate(out.len() - DEFLATE_TAIL.len());
  }
  Ok(Bytes::from(out))
}
