//! Connection classification by first-byte sniffing

use crate::error::Result;
use crate::stream::Rewind;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// First byte of a TLS handshake record
pub const TLS_HANDSHAKE: u8 = 0x16;

/// What a connection speaks, decided from its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// TLS ClientHello record
  Tls,
  /// An HTTP/1.x request line (method starts with a letter)
  PlainHttp,
  /// Anything else; the connection is closed
  Unknown,
}

impl Classification {
  /// Classify a single leading byte
  pub fn of(first: u8) -> Self {
    match first {
      TLS_HANDSHAKE => Classification::Tls,
      b if b.is_ascii_alphabetic() => Classification::PlainHttp,
      _ => Classification::Unknown,
    }
  }
}

/// Read exactly one byte from `stream` and return it alongside a stream that replays it.
///
/// Returns `None` when the peer closed before sending anything.
pub async fn sniff<S>(mut stream: S) -> Result<Option<(Classification, Rewind<S>)>>
where
  S: AsyncRead + Unpin,
{
  let mut first = [0u8; 1];
  let n = stream.read(&mut first).await?;
  if n == 0 {
    return Ok(None);
  }
  Ok(Some((
    Classification::of(first[0]),
    Rewind::new(Bytes::copy_from_slice(&first), stream),
  )))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classification_is_total_over_bytes() {
    for b in 0u8..=255 {
      let expected = if b == 0x16 {
        Classification::Tls
      } else if b.is_ascii_uppercase() || b.is_ascii_lowercase() {
        Classification::PlainHttp
      } else {
        Classification::Unknown
      };
      assert_eq!(Classification::of(b), expected, "byte {:#04x}", b);
    }
  }

  #[tokio::test]
  async fn sniff_does_not_consume() {
    use tokio::io::AsyncWriteExt;
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    drop(client);
    let (class, mut rewound) = sniff(server).await.unwrap().unwrap();
    assert_eq!(class, Classification::PlainHttp);
    let mut all = String::new();
    rewound.read_to_string(&mut all).await.unwrap();
    assert_eq!(all, "GET / HTTP/1.1\r\n");
  }

  #[tokio::test]
  async fn sniff_reports_eof() {
    let (client, server) = tokio::io::duplex(8);
    drop(client);
    assert!(sniff(server).await.unwrap().is_none());
  }
}
