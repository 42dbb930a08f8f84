// Frame IO for logline-wire messages over QUIC streams.
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use logline_wire::{Frame, FrameHeader, Message};
use quinn::{ReadExactError, RecvStream, SendStream};

use crate::duplex::{RequestSink, ResponseSource};

/// Read one message, or `None` when the peer finished the stream cleanly
/// on a frame boundary.
pub(crate) async fn read_message(
    recv: &mut RecvStream,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Message>> {
    let Some(frame) = read_frame_into(recv, scratch, max_frame_bytes).await? else {
        return Ok(None);
    };
    match Message::decode(frame.clone()).context("decode message") {
        Ok(message) => Ok(Some(message)),
        Err(err) => {
            tracing::warn!(
                error = %err,
                frame_len = frame.payload.len(),
                "failed to decode event store frame"
            );
            Err(err)
        }
    }
}

async fn read_frame_into(
    recv: &mut RecvStream,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(ReadExactError::FinishedEarly(read)) => {
            anyhow::bail!("stream finished inside a frame header ({read} bytes)")
        }
        Err(ReadExactError::ReadError(err)) => return Err(err).context("read frame header"),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;
    // Checked before allocating so a bogus length cannot exhaust memory.
    if length > max_frame_bytes {
        anyhow::bail!("frame too large: {length} bytes (cap {max_frame_bytes}); refusing");
    }

    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

pub(crate) async fn write_message(send: &mut SendStream, message: Message) -> Result<()> {
    let frame = message.encode().context("encode message")?;
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    Ok(())
}

/// Outbound half of an event stream.
pub(crate) struct FramedSink {
    pub(crate) send: SendStream,
}

impl RequestSink<Message> for FramedSink {
    async fn send(&mut self, request: Message) -> Result<()> {
        write_message(&mut self.send, request).await
    }

    fn half_close(&mut self) -> Result<()> {
        self.send.finish().context("finish request stream")
    }
}

/// Inbound half of an event stream.
pub(crate) struct FramedSource {
    pub(crate) recv: RecvStream,
    pub(crate) scratch: BytesMut,
    pub(crate) max_frame_bytes: usize,
}

impl FramedSource {
    pub(crate) fn new(recv: RecvStream, max_frame_bytes: usize) -> Self {
        Self {
            recv,
            scratch: BytesMut::with_capacity(64 * 1024),
            max_frame_bytes,
        }
    }
}

impl ResponseSource<Message> for FramedSource {
    async fn next_response(&mut self) -> Result<Option<Message>> {
        read_message(&mut self.recv, &mut self.scratch, self.max_frame_bytes).await
    }
}
