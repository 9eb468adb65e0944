use super::frame::{self, deflate_message, first_byte, opcode, Frame, FrameReadError, Inflater};
use crate::error::{Error, Result};
use crate::hijack::{supervise, Hooks, WebSocketContext};
use crate::server::stopped;
use crate::stream::BoxStream;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Session settings fixed at upgrade time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOptions {
  /// `permessage-deflate` was negotiated
  pub deflate: bool,
  /// Rewrite data payloads instead of copying frames
  pub hijack: bool,
  /// Re-emit hijacked data frames as text
  pub force_text: bool,
  /// Largest reassembled message in bytes; 0 means [`frame::MAX_PAYLOAD`]
  pub max_message: usize,
}

impl RelayOptions {
  fn message_limit(self) -> usize {
    if self.max_message == 0 {
      frame::MAX_PAYLOAD as usize
    } else {
      self.max_message
    }
  }
}

/// Close status sent when a message outgrows the limit
const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  ClientToServer,
  ServerToClient,
}

impl Direction {
  fn label(self) -> &'static str {
    match self {
      Direction::ClientToServer => "client->server",
      Direction::ServerToClient => "server->client",
    }
  }
}

/// Result of adding a data frame to the current message
enum Assembled {
  Partial,
  Done(Message),
  /// The message outgrew the limit and was discarded
  TooLarge { mask: Option<[u8; 4]> },
}

/// A data message being reassembled
struct Message {
  opcode: u8,
  mask: Option<[u8; 4]>,
  compressed: bool,
  payload: BytesMut,
}

/// Relay frames between an upgraded client and upstream until either side closes.
///
/// Both directions share a stop flag: when one loop ends the other is
/// stopped and both write halves are shut down.
pub async fn relay(
  client: BoxStream,
  upstream: BoxStream,
  ctx: WebSocketContext,
  hooks: Hooks,
  options: RelayOptions,
) -> Result<()> {
  let (client_read, client_write) = tokio::io::split(client);
  let (upstream_read, upstream_write) = tokio::io::split(upstream);
  let stop = Arc::new(watch::channel(false).0);
  let ctx = Arc::new(ctx);
  let options = RelayOptions {
    hijack: options.hijack && hooks.websocket.is_some(),
    ..options
  };
  tracing::debug!("[MITM] websocket session started {:?}", options);

  let outbound = tokio::spawn(pump(
    Direction::ClientToServer,
    client_read,
    upstream_write,
    ctx.clone(),
    hooks.clone(),
    options,
    stop.clone(),
  ));
  let inbound = tokio::spawn(pump(
    Direction::ServerToClient,
    upstream_read,
    client_write,
    ctx,
    hooks,
    options,
    stop,
  ));
  let (outbound, inbound) = tokio::join!(outbound, inbound);
  for (direction, result) in [
    (Direction::ClientToServer, outbound),
    (Direction::ServerToClient, inbound),
  ] {
    match result {
      Ok(Ok(())) => {}
      Ok(Err(e)) => tracing::debug!("[MITM] websocket {} ended: {}", direction.label(), e),
      Err(e) => tracing::warn!("[MITM] websocket {} task failed: {}", direction.label(), e),
    }
  }
  tracing::debug!("[MITM] websocket session closed");
  Ok(())
}

async fn pump<R, W>(
  direction: Direction,
  mut reader: R,
  mut writer: W,
  ctx: Arc<WebSocketContext>,
  hooks: Hooks,
  options: RelayOptions,
  stop: Arc<watch::Sender<bool>>,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut inflater = Inflater::new();
  let mut message: Option<Message> = None;
  let mut stop_rx = stop.subscribe();
  let result = loop {
    let next = tokio::select! {
      _ = stopped(&mut stop_rx) => break Ok(()),
      next = frame::read_frame(&mut reader) => next,
    };
    let frame = match next {
      Ok(Some(frame)) => frame,
      Ok(None) => break Ok(()),
      Err(FrameReadError { partial, error }) => {
        if !partial.is_empty() {
          writer.write_all(&partial).await.ok();
          writer.flush().await.ok();
        }
        break Err(error);
      }
    };
    let step = if options.hijack {
      let state = (&mut inflater, &mut message);
      hijack_frame(direction, frame, &mut writer, state, &ctx, &hooks, options).await
    } else {
      let state = (&mut inflater, &mut message);
      mirror_frame(direction, frame, &mut writer, state, &hooks, options).await
    };
    if let Err(e) = step {
      break Err(e);
    }
  };
  stop.send_replace(true);
  writer.shutdown().await.ok();
  result
}

/// Copy the frame unchanged and report completed messages to the mirror
async fn mirror_frame<W>(
  direction: Direction,
  frame: Frame,
  writer: &mut W,
  (inflater, message): (&mut Inflater, &mut Option<Message>),
  hooks: &Hooks,
  options: RelayOptions,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&frame.raw).await?;
  writer.flush().await?;
  if hooks.websocket_mirror.is_none() || !frame.is_data() {
    return Ok(());
  }
  let done = match assemble(frame, message, options) {
    Assembled::Partial => return Ok(()),
    Assembled::TooLarge { .. } => {
      tracing::debug!(
        "[MITM] websocket {} message over {} bytes, not mirrored",
        direction.label(),
        options.message_limit()
      );
      return Ok(());
    }
    Assembled::Done(done) => done,
  };
  let payload = if done.compressed {
    match inflater.inflate(&done.payload) {
      Ok(payload) => payload,
      Err(e) => {
        tracing::debug!("[MITM] websocket {} message not mirrored: {}", direction.label(), e);
        return Ok(());
      }
    }
  } else {
    done.payload.freeze()
  };
  spawn_mirror(direction, hooks, payload);
  Ok(())
}

/// Rewrite data payloads through the hijacker
async fn hijack_frame<W>(
  direction: Direction,
  frame: Frame,
  writer: &mut W,
  (inflater, message): (&mut Inflater, &mut Option<Message>),
  ctx: &Arc<WebSocketContext>,
  hooks: &Hooks,
  options: RelayOptions,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let out = match frame.opcode() {
    opcode::PING => {
      let pong = (frame.first_byte & 0xf0) | opcode::PONG;
      frame::encode(pong, frame.mask, &frame.payload)
    }
    opcode::TEXT | opcode::BINARY | opcode::CONTINUATION => {
      let continuation = frame.opcode() == opcode::CONTINUATION;
      let compressed = if continuation {
        message.as_ref().map(|m| m.compressed).unwrap_or(false)
      } else {
        options.deflate && frame.rsv1()
      };
      if compressed {
        let done = match assemble(frame, message, options) {
          Assembled::Partial => return Ok(()),
          Assembled::TooLarge { mask } => {
            let mut status = CLOSE_TOO_BIG.to_be_bytes().to_vec();
            status.extend_from_slice(b"message too big");
            let close = frame::encode(first_byte(true, false, opcode::CLOSE), mask, &status);
            writer.write_all(&close).await?;
            writer.flush().await?;
            return Err(Error::proxy_error(format!(
              "websocket {} message exceeds {} bytes",
              direction.label(),
              options.message_limit()
            )));
          }
          Assembled::Done(done) => done,
        };
        let plain = inflater.inflate(&done.payload)?;
        let hijacked = hijack_payload(direction, hooks, ctx, plain).await;
        spawn_mirror(direction, hooks, hijacked.clone());
        let compressed = deflate_message(&hijacked)?;
        frame::encode(
          first_byte(true, true, data_opcode(done.opcode, options)),
          done.mask,
          &compressed,
        )
      } else {
        let op = if frame.opcode() == opcode::CONTINUATION {
          opcode::CONTINUATION
        } else {
          data_opcode(frame.opcode(), options)
        };
        let hijacked = hijack_payload(direction, hooks, ctx, frame.payload.clone()).await;
        spawn_mirror(direction, hooks, hijacked.clone());
        frame::encode((frame.first_byte & 0xf0) | op, frame.mask, &hijacked)
      }
    }
    _ => frame.raw,
  };
  writer.write_all(&out).await?;
  writer.flush().await?;
  Ok(())
}

fn data_opcode(original: u8, options: RelayOptions) -> u8 {
  if options.force_text {
    opcode::TEXT
  } else {
    original
  }
}

/// Add a data frame to the current message; yields the message once FIN arrives.
///
/// Continuations of a discarded message are ignored until the next message starts.
fn assemble(frame: Frame, message: &mut Option<Message>, options: RelayOptions) -> Assembled {
  if frame.opcode() != opcode::CONTINUATION {
    *message = Some(Message {
      opcode: frame.opcode(),
      mask: frame.mask,
      compressed: options.deflate && frame.rsv1(),
      payload: BytesMut::new(),
    });
  }
  let Some(current) = message.as_mut() else {
    return Assembled::Partial;
  };
  if current.payload.len() + frame.payload.len() > options.message_limit() {
    let mask = current.mask;
    *message = None;
    return Assembled::TooLarge { mask };
  }
  current.payload.extend_from_slice(&frame.payload);
  match message.take() {
    Some(done) if frame.fin() => Assembled::Done(done),
    current => {
      *message = current;
      Assembled::Partial
    }
  }
}

async fn hijack_payload(
  direction: Direction,
  hooks: &Hooks,
  ctx: &Arc<WebSocketContext>,
  payload: Bytes,
) -> Bytes {
  let Some(hijacker) = hooks.websocket.clone() else {
    return payload;
  };
  let ctx = ctx.clone();
  let original = payload.clone();
  let result = supervise("websocket", async move {
    match direction {
      Direction::ClientToServer => hijacker.hijack_client_frame(payload, &ctx).await,
      Direction::ServerToClient => hijacker.hijack_server_frame(payload, &ctx).await,
    }
  })
  .await;
  result.unwrap_or(original)
}

fn spawn_mirror(direction: Direction, hooks: &Hooks, payload: Bytes) {
  let Some(mirror) = hooks.websocket_mirror.clone() else {
    return;
  };
  tokio::spawn(async move {
    match direction {
      Direction::ClientToServer => mirror.mirror_client_frame(payload).await,
      Direction::ServerToClient => mirror.mirror_server_frame(payload).await,
    }
  });
}
