use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

// Nothing legitimate comes close: a piece frame is 16 KiB + 9 and bitfields
// for very large torrents stay well under this.
const MAX_FRAME_LEN: usize = 0x200000;

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum Message {

    // Advises the peer the connection is alive even when quiet.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // The client wants to request blocks from the peer.
    Interested,

    NotInterested,

    // The client acquired the piece at this index.
    Have { idx: u32 },

    // One bit per piece, MSB first within each byte; only sent directly
    // after the handshake if at all.
    Bitfield(Bitfield),

    Request(block::BlockInfo),

    // A block of data, the response to a request.
    Block(block::BlockData),

    Cancel(block::BlockInfo),

    // DHT listen port; tolerated, never acted on.
    Port { port: u16 },

    // BEP-10 frame: one byte of extension id, then the extension payload.
    Extended { ext_id: u8, payload: Vec<u8> },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // keep-alive: <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // choke: <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // unchoke: <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // interested: <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // not interested: <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bitfield.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            // extended: <len=0002+X><id=20><ext id><payload>
            Message::Extended { ext_id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(ext_id);
                dst.extend_from_slice(&payload);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read the length prefix yet.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32() as usize;

        if msg_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(msg_len));
        }

        if src.remaining() < 4 + msg_len {
            // Haven't received the whole frame.
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg = match src.get_u8() {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if msg_len != 5 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Have { idx: src.get_u32() }
            },
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            7 => {
                if msg_len < 9 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(block::BlockData { piece_idx, offset, data })
            },
            8 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            9 => {
                if msg_len != 3 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Port { port: src.get_u16() }
            },
            20 => {
                if msg_len < 2 {
                    return Err(PeerError::InvalidMessage);
                }
                let ext_id = src.get_u8();
                let mut payload = vec![0; msg_len - 2];
                src.copy_to_slice(&mut payload);
                Message::Extended { ext_id, payload }
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(
                f,
                "request {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::Block(block) => write!(
                f,
                "block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx, block.offset, block.data.len(),
            ),
            Message::Cancel(block) => write!(
                f,
                "cancel {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Extended { ext_id, payload } => {
                write!(f, "extended {{ ext id: {}, {} bytes }}", ext_id, payload.len())
            },
        }
    }
}
