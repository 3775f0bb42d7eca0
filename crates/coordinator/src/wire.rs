//! Wire framing.
//!
//! Frames are sent as:
//!
//! ```text
//! +------------------------------------+
//! | length (2 bytes, big-endian)       |  tag + body
//! +------------------------------------+
//! | message tag (2 bytes, big-endian)  |
//! +------------------------------------+
//! | body (bincode-encoded message)     |
//! +------------------------------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vortex_common::protocol::*;
use vortex_common::{Result, VortexError};

/// Maximum frame payload (tag + body); bounded by the 16-bit length prefix.
const MAX_FRAME_SIZE: usize = u16::MAX as usize;

const TAG_ASK_NONCE: u16 = 1;
const TAG_NONCE: u16 = 2;
const TAG_ASK_MIX_DETAILS: u16 = 3;
const TAG_MIX_DETAILS: u16 = 4;
const TAG_REGISTER_INPUTS: u16 = 5;
const TAG_BLINDED_SIG: u16 = 6;
const TAG_BOB: u16 = 7;
const TAG_OUTPUT_ACK: u16 = 8;
const TAG_UNSIGNED_PSBT: u16 = 9;
const TAG_SIGNED_PSBT: u16 = 10;
const TAG_RESTART_ROUND: u16 = 11;
const TAG_ROUND_FAILED: u16 = 12;
const TAG_ERROR: u16 = 13;

/// A decoded wire frame.
#[derive(Debug, Clone)]
pub enum Frame {
    AskNonce(AskNonce),
    Nonce(NonceMessage),
    AskMixDetails(AskMixDetails),
    MixDetails(MixDetails),
    RegisterInputs(RegisterInputs),
    BlindedSig(BlindedSig),
    Bob(BobMessage),
    OutputAck(RegisterOutputAck),
    UnsignedPsbt(UnsignedPsbtMessage),
    SignedPsbt(SignedPsbtMessage),
    RestartRound(RestartRoundMessage),
    RoundFailed(RoundFailedMessage),
    Error(ErrorMessage),
}

fn codec_err<E: std::fmt::Display>(e: E) -> VortexError {
    VortexError::Codec(e.to_string())
}

impl Frame {
    pub fn tag(&self) -> u16 {
        match self {
            Frame::AskNonce(_) => TAG_ASK_NONCE,
            Frame::Nonce(_) => TAG_NONCE,
            Frame::AskMixDetails(_) => TAG_ASK_MIX_DETAILS,
            Frame::MixDetails(_) => TAG_MIX_DETAILS,
            Frame::RegisterInputs(_) => TAG_REGISTER_INPUTS,
            Frame::BlindedSig(_) => TAG_BLINDED_SIG,
            Frame::Bob(_) => TAG_BOB,
            Frame::OutputAck(_) => TAG_OUTPUT_ACK,
            Frame::UnsignedPsbt(_) => TAG_UNSIGNED_PSBT,
            Frame::SignedPsbt(_) => TAG_SIGNED_PSBT,
            Frame::RestartRound(_) => TAG_RESTART_ROUND,
            Frame::RoundFailed(_) => TAG_ROUND_FAILED,
            Frame::Error(_) => TAG_ERROR,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Frame::AskNonce(m) => bincode::serialize(m),
            Frame::Nonce(m) => bincode::serialize(m),
            Frame::AskMixDetails(m) => bincode::serialize(m),
            Frame::MixDetails(m) => bincode::serialize(m),
            Frame::RegisterInputs(m) => bincode::serialize(m),
            Frame::BlindedSig(m) => bincode::serialize(m),
            Frame::Bob(m) => bincode::serialize(m),
            Frame::OutputAck(m) => bincode::serialize(m),
            Frame::UnsignedPsbt(m) => bincode::serialize(m),
            Frame::SignedPsbt(m) => bincode::serialize(m),
            Frame::RestartRound(m) => bincode::serialize(m),
            Frame::RoundFailed(m) => bincode::serialize(m),
            Frame::Error(m) => bincode::serialize(m),
        };
        body.map_err(codec_err)
    }

    fn decode_body(tag: u16, body: &[u8]) -> Result<Self> {
        let frame = match tag {
            TAG_ASK_NONCE => Frame::AskNonce(bincode::deserialize(body).map_err(codec_err)?),
            TAG_NONCE => Frame::Nonce(bincode::deserialize(body).map_err(codec_err)?),
            TAG_ASK_MIX_DETAILS => {
                Frame::AskMixDetails(bincode::deserialize(body).map_err(codec_err)?)
            }
            TAG_MIX_DETAILS => Frame::MixDetails(bincode::deserialize(body).map_err(codec_err)?),
            TAG_REGISTER_INPUTS => {
                Frame::RegisterInputs(bincode::deserialize(body).map_err(codec_err)?)
            }
            TAG_BLINDED_SIG => Frame::BlindedSig(bincode::deserialize(body).map_err(codec_err)?),
            TAG_BOB => Frame::Bob(bincode::deserialize(body).map_err(codec_err)?),
            TAG_OUTPUT_ACK => Frame::OutputAck(bincode::deserialize(body).map_err(codec_err)?),
            TAG_UNSIGNED_PSBT => {
                Frame::UnsignedPsbt(bincode::deserialize(body).map_err(codec_err)?)
            }
            TAG_SIGNED_PSBT => Frame::SignedPsbt(bincode::deserialize(body).map_err(codec_err)?),
            TAG_RESTART_ROUND => {
                Frame::RestartRound(bincode::deserialize(body).map_err(codec_err)?)
            }
            TAG_ROUND_FAILED => Frame::RoundFailed(bincode::deserialize(body).map_err(codec_err)?),
            TAG_ERROR => Frame::Error(bincode::deserialize(body).map_err(codec_err)?),
            other => {
                return Err(VortexError::Codec(format!("unknown message tag {}", other)));
            }
        };
        Ok(frame)
    }

    /// Encode as a complete frame: length, tag, body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let payload_len = 2 + body.len();
        if payload_len > MAX_FRAME_SIZE {
            return Err(VortexError::Codec(format!(
                "message too large: {} bytes (max {})",
                payload_len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(2 + payload_len);
        buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
        buf.extend_from_slice(&self.tag().to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

/// Write one frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let encoded = frame.encode()?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| VortexError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| VortexError::Transport(e.to_string()))?;
    Ok(())
}

/// Read one frame from an async reader.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 2];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| VortexError::Transport(e.to_string()))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len < 2 {
        return Err(VortexError::Codec(format!("frame too short: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| VortexError::Transport(e.to_string()))?;

    let tag = u16::from_be_bytes([payload[0], payload[1]]);
    Frame::decode_body(tag, &payload[2..])
}
