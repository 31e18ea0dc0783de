//! The `msg_type`-tagged sum wire format (`spec.md` §6): encode/decode
//! for the fixed binary body layouts carried inside a `veilnet_wire`
//! frame's deobfuscated payload.
//!
//! Kept deliberately separate from `veilnet_wire` (which only knows
//! about raw byte frames) because these bodies reference
//! `veilnet_crypto` types (`Header`, X3DH's `InitialMessage`). Hand
//! `to_be_bytes`/`from_be_bytes` encoding throughout, mirroring
//! `veilnet_crypto::ratchet::Header::to_bytes` rather than reaching for
//! `serde` on the wire (§2 ambient-stack note: the wire format is a
//! fixed binary layout, not JSON).

use veilnet_crypto::ratchet::Header;
use veilnet_crypto::x3dh::InitialMessage;
use veilnet_crypto::{NodeId, SealedMessage};

use crate::error::NodeError;

/// `inner_msg := u8 version=1 ‖ u8 msg_type ‖ body`
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Hello,
    Welcome,
    Ping,
    Pong,
    FindNode,
    Nodes,
    X3dhInit,
    RatchetMsg,
}

impl MsgType {
    fn tag(self) -> u8 {
        match self {
            MsgType::Hello => 0x01,
            MsgType::Welcome => 0x02,
            MsgType::Ping => 0x03,
            MsgType::Pong => 0x04,
            MsgType::FindNode => 0x05,
            MsgType::Nodes => 0x06,
            MsgType::X3dhInit => 0x10,
            MsgType::RatchetMsg => 0x11,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, NodeError> {
        match tag {
            0x01 => Ok(MsgType::Hello),
            0x02 => Ok(MsgType::Welcome),
            0x03 => Ok(MsgType::Ping),
            0x04 => Ok(MsgType::Pong),
            0x05 => Ok(MsgType::FindNode),
            0x06 => Ok(MsgType::Nodes),
            0x10 => Ok(MsgType::X3dhInit),
            0x11 => Ok(MsgType::RatchetMsg),
            other => Err(NodeError::Protocol(format!("unknown msg_type 0x{other:02x}"))),
        }
    }
}

/// A peer address as carried in `HELLO`/`WELCOME`/`NODES` bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub addr: PeerAddr,
    pub ik_pub: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub hello: Hello,
    pub peers: Vec<PeerAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMsgBody {
    pub dh_pub: [u8; 32],
    pub pn: u32,
    pub n: u32,
    pub ciphertext: Vec<u8>,
}

impl From<&SealedMessage> for RatchetMsgBody {
    fn from(msg: &SealedMessage) -> Self {
        RatchetMsgBody { dh_pub: msg.header.dh_pub, pn: msg.header.pn, n: msg.header.n, ciphertext: msg.ciphertext.clone() }
    }
}

impl From<RatchetMsgBody> for SealedMessage {
    fn from(body: RatchetMsgBody) -> Self {
        SealedMessage { header: Header { dh_pub: body.dh_pub, pn: body.pn, n: body.n }, ciphertext: body.ciphertext }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X3dhInitBody {
    pub ik_pub: [u8; 32],
    pub ek_pub: [u8; 32],
    pub opk_id: Option<u32>,
    pub ratchet: RatchetMsgBody,
}

impl X3dhInitBody {
    pub fn initial_message(&self) -> InitialMessage {
        InitialMessage { ik_pub: self.ik_pub, ek_pub: self.ek_pub, opk_id: self.opk_id }
    }
}

/// The closed tagged sum over `msg_type` (`spec.md` §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Ping,
    Pong,
    FindNode { target: NodeId },
    Nodes(Vec<PeerAddr>),
    X3dhInit(X3dhInitBody),
    RatchetMsg(RatchetMsgBody),
}

impl Message {
    fn msg_type(&self) -> MsgType {
        match self {
            Message::Hello(_) => MsgType::Hello,
            Message::Welcome(_) => MsgType::Welcome,
            Message::Ping => MsgType::Ping,
            Message::Pong => MsgType::Pong,
            Message::FindNode { .. } => MsgType::FindNode,
            Message::Nodes(_) => MsgType::Nodes,
            Message::X3dhInit(_) => MsgType::X3dhInit,
            Message::RatchetMsg(_) => MsgType::RatchetMsg,
        }
    }

    /// Encode `version ‖ msg_type ‖ body` as the `inner_msg` a
    /// `veilnet_wire::ConnectionHandle` frames and obfuscates.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![VERSION, self.msg_type().tag()];
        match self {
            Message::Hello(h) => write_hello(&mut out, h),
            Message::Welcome(w) => {
                write_hello(&mut out, &w.hello);
                out.extend_from_slice(&(w.peers.len() as u16).to_be_bytes());
                for p in &w.peers {
                    write_peer_addr(&mut out, p);
                }
            }
            Message::Ping | Message::Pong => {}
            Message::FindNode { target } => out.extend_from_slice(target),
            Message::Nodes(peers) => {
                out.extend_from_slice(&(peers.len() as u16).to_be_bytes());
                for p in peers {
                    write_peer_addr(&mut out, p);
                }
            }
            Message::X3dhInit(body) => {
                out.extend_from_slice(&body.ik_pub);
                out.extend_from_slice(&body.ek_pub);
                out.extend_from_slice(&body.opk_id.unwrap_or(0xFFFF_FFFF).to_be_bytes());
                write_ratchet_msg(&mut out, &body.ratchet);
            }
            Message::RatchetMsg(body) => write_ratchet_msg(&mut out, body),
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, NodeError> {
        let mut r = Reader::new(data);
        let version = r.u8()?;
        if version != VERSION {
            return Err(NodeError::Protocol(format!("unsupported wire version {version}")));
        }
        let msg_type = MsgType::from_tag(r.u8()?)?;
        let msg = match msg_type {
            MsgType::Hello => Message::Hello(read_hello(&mut r)?),
            MsgType::Welcome => {
                let hello = read_hello(&mut r)?;
                let count = r.u16()?;
                let peers = (0..count).map(|_| read_peer_addr(&mut r)).collect::<Result<_, _>>()?;
                Message::Welcome(Welcome { hello, peers })
            }
            MsgType::Ping => Message::Ping,
            MsgType::Pong => Message::Pong,
            MsgType::FindNode => Message::FindNode { target: r.node_id()? },
            MsgType::Nodes => {
                let count = r.u16()?;
                let peers = (0..count).map(|_| read_peer_addr(&mut r)).collect::<Result<_, _>>()?;
                Message::Nodes(peers)
            }
            MsgType::X3dhInit => {
                let ik_pub = r.node_id()?;
                let ek_pub = r.node_id()?;
                let opk_raw = r.u32()?;
                let opk_id = if opk_raw == 0xFFFF_FFFF { None } else { Some(opk_raw) };
                let ratchet = read_ratchet_msg(&mut r)?;
                Message::X3dhInit(X3dhInitBody { ik_pub, ek_pub, opk_id, ratchet })
            }
            MsgType::RatchetMsg => Message::RatchetMsg(read_ratchet_msg(&mut r)?),
        };
        r.expect_exhausted()?;
        Ok(msg)
    }
}

fn write_peer_addr(out: &mut Vec<u8>, p: &PeerAddr) {
    out.extend_from_slice(&p.node_id);
    let host_bytes = p.host.as_bytes();
    out.push(host_bytes.len() as u8);
    out.extend_from_slice(host_bytes);
    out.extend_from_slice(&p.port.to_be_bytes());
}

fn write_hello(out: &mut Vec<u8>, h: &Hello) {
    write_peer_addr(out, &h.addr);
    out.extend_from_slice(&h.ik_pub);
}

fn write_ratchet_msg(out: &mut Vec<u8>, body: &RatchetMsgBody) {
    out.extend_from_slice(&body.dh_pub);
    out.extend_from_slice(&body.pn.to_be_bytes());
    out.extend_from_slice(&body.n.to_be_bytes());
    out.extend_from_slice(&(body.ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&body.ciphertext);
}

fn read_peer_addr(r: &mut Reader) -> Result<PeerAddr, NodeError> {
    let node_id = r.node_id()?;
    let ip_len = r.u8()? as usize;
    let host = r.string(ip_len)?;
    let port = r.u16()?;
    Ok(PeerAddr { node_id, host, port })
}

fn read_hello(r: &mut Reader) -> Result<Hello, NodeError> {
    let addr = read_peer_addr(r)?;
    let ik_pub = r.node_id()?;
    Ok(Hello { addr, ik_pub })
}

fn read_ratchet_msg(r: &mut Reader) -> Result<RatchetMsgBody, NodeError> {
    let dh_pub = r.node_id()?;
    let pn = r.u32()?;
    let n = r.u32()?;
    let ct_len = r.u32()? as usize;
    let ciphertext = r.bytes(ct_len)?.to_vec();
    Ok(RatchetMsgBody { dh_pub, pn, n, ciphertext })
}

/// A small cursor over a byte slice. Every read either succeeds or
/// yields `NodeError::Protocol`, matching `spec.md` §7's rule that a
/// malformed frame drops the connection rather than panicking.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self.pos.checked_add(len).ok_or_else(|| NodeError::Protocol("length overflow".into()))?;
        let slice = self.data.get(self.pos..end).ok_or_else(|| NodeError::Protocol("message truncated".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, NodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, NodeError> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, NodeError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    fn node_id(&mut self) -> Result<NodeId, NodeError> {
        Ok(self.bytes(32)?.try_into().expect("32 bytes"))
    }

    fn string(&mut self, len: usize) -> Result<String, NodeError> {
        String::from_utf8(self.bytes(len)?.to_vec()).map_err(|_| NodeError::Protocol("non-utf8 host".into()))
    }

    fn expect_exhausted(&self) -> Result<(), NodeError> {
        if self.pos != self.data.len() {
            return Err(NodeError::Protocol("trailing bytes after message body".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> PeerAddr {
        PeerAddr { node_id: [byte; 32], host: "127.0.0.1".into(), port: 9000 }
    }

    #[test]
    fn hello_round_trips() {
        let msg = Message::Hello(Hello { addr: addr(1), ik_pub: [2u8; 32] });
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn welcome_round_trips_with_peer_list() {
        let msg = Message::Welcome(Welcome { hello: Hello { addr: addr(1), ik_pub: [2u8; 32] }, peers: vec![addr(3), addr(4)] });
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn ping_and_pong_have_empty_bodies() {
        assert_eq!(Message::Ping.encode().len(), 2);
        assert_eq!(Message::decode(&Message::Ping.encode()).unwrap(), Message::Ping);
        assert_eq!(Message::decode(&Message::Pong.encode()).unwrap(), Message::Pong);
    }

    #[test]
    fn find_node_round_trips() {
        let msg = Message::FindNode { target: [9u8; 32] };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn nodes_round_trips() {
        let msg = Message::Nodes(vec![addr(1), addr(2), addr(3)]);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn x3dh_init_round_trips_with_and_without_opk() {
        let ratchet = RatchetMsgBody { dh_pub: [1u8; 32], pn: 0, n: 0, ciphertext: vec![1, 2, 3] };
        let with_opk = Message::X3dhInit(X3dhInitBody { ik_pub: [2u8; 32], ek_pub: [3u8; 32], opk_id: Some(7), ratchet: ratchet.clone() });
        assert_eq!(Message::decode(&with_opk.encode()).unwrap(), with_opk);

        let without_opk = Message::X3dhInit(X3dhInitBody { ik_pub: [2u8; 32], ek_pub: [3u8; 32], opk_id: None, ratchet });
        assert_eq!(Message::decode(&without_opk.encode()).unwrap(), without_opk);
    }

    #[test]
    fn ratchet_msg_round_trips() {
        let msg = Message::RatchetMsg(RatchetMsgBody { dh_pub: [4u8; 32], pn: 3, n: 7, ciphertext: vec![0xAB; 40] });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn truncated_message_is_rejected_as_protocol_error() {
        let msg = Message::Hello(Hello { addr: addr(1), ik_pub: [2u8; 32] });
        let mut encoded = msg.encode();
        encoded.truncate(encoded.len() - 5);
        assert!(matches!(Message::decode(&encoded), Err(NodeError::Protocol(_))));
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let bad = vec![VERSION, 0xEE];
        assert!(matches!(Message::decode(&bad), Err(NodeError::Protocol(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = Message::Ping.encode();
        encoded.push(0xFF);
        assert!(matches!(Message::decode(&encoded), Err(NodeError::Protocol(_))));
    }
}
