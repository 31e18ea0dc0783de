//! Traffic obfuscation methods (`spec.md` §4.4). Each method is a
//! bijective transform between an inner message and an obfuscated
//! payload; the outer length prefix (`frame.rs`) covers the obfuscated
//! bytes, not the inner ones.
//!
//! Method negotiation is out of band: both peers on a connection are
//! configured with the same `Method` ahead of time.

use rand::Rng;

use crate::error::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Raw,
    RandomPad,
    HttpLooking,
    WebSocketLooking,
}

const RANDOM_PAD_MIN: usize = 5;
const RANDOM_PAD_MAX: usize = 50;

pub fn obfuscate(method: Method, inner: &[u8]) -> Vec<u8> {
    match method {
        Method::Raw => inner.to_vec(),
        Method::RandomPad => random_pad_encode(inner),
        Method::HttpLooking => http_looking_encode(inner),
        Method::WebSocketLooking => websocket_looking_encode(inner),
    }
}

pub fn deobfuscate(method: Method, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    match method {
        Method::Raw => Ok(payload.to_vec()),
        Method::RandomPad => random_pad_decode(payload),
        Method::HttpLooking => http_looking_decode(payload),
        Method::WebSocketLooking => websocket_looking_decode(payload),
    }
}

fn random_len() -> usize {
    rand::thread_rng().gen_range(RANDOM_PAD_MIN..=RANDOM_PAD_MAX)
}

/// `prefix_len u8 ‖ prefix ‖ inner_len u32_be ‖ inner ‖ suffix_len u8 ‖ suffix`.
fn random_pad_encode(inner: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let prefix_len = random_len();
    let suffix_len = random_len();
    let mut out = Vec::with_capacity(1 + prefix_len + 4 + inner.len() + 1 + suffix_len);
    out.push(prefix_len as u8);
    out.extend((0..prefix_len).map(|_| rng.gen::<u8>()));
    out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
    out.extend_from_slice(inner);
    out.push(suffix_len as u8);
    out.extend((0..suffix_len).map(|_| rng.gen::<u8>()));
    out
}

fn random_pad_decode(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut cursor = 0usize;
    let prefix_len = *payload.get(cursor).ok_or_else(|| proto("truncated random-pad prefix length"))? as usize;
    cursor += 1;
    cursor += prefix_len;
    let len_bytes = payload
        .get(cursor..cursor + 4)
        .ok_or_else(|| proto("truncated random-pad inner length"))?;
    let inner_len = u32::from_be_bytes(len_bytes.try_into().expect("slice is 4 bytes")) as usize;
    cursor += 4;
    let inner = payload
        .get(cursor..cursor + inner_len)
        .ok_or_else(|| proto("truncated random-pad inner payload"))?;
    Ok(inner.to_vec())
}

const HTTP_METHOD_LINE: &str = "POST /v1/relay HTTP/1.1\r\n";
const HTTP_HEADERS: &str = "Host: veilnet.local\r\nContent-Type: application/octet-stream\r\n";

fn http_looking_encode(inner: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let trailing_len = random_len();
    let mut out = Vec::with_capacity(128 + inner.len() + trailing_len);
    out.extend_from_slice(HTTP_METHOD_LINE.as_bytes());
    out.extend_from_slice(HTTP_HEADERS.as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", inner.len()).as_bytes());
    out.extend_from_slice(inner);
    out.extend((0..trailing_len).map(|_| rng.gen::<u8>()));
    out
}

fn http_looking_decode(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    const SEP: &[u8] = b"\r\n\r\n";
    let header_end = payload
        .windows(SEP.len())
        .position(|w| w == SEP)
        .ok_or_else(|| proto("http-looking frame missing header terminator"))?
        + SEP.len();
    let header_text = std::str::from_utf8(&payload[..header_end]).map_err(|_| proto("http-looking header is not utf-8"))?;
    let content_length: usize = header_text
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .ok_or_else(|| proto("http-looking frame missing Content-Length"))?
        .trim()
        .parse()
        .map_err(|_| proto("http-looking Content-Length is not a number"))?;
    let body = payload
        .get(header_end..header_end + content_length)
        .ok_or_else(|| proto("http-looking body shorter than Content-Length"))?;
    Ok(body.to_vec())
}

fn websocket_looking_encode(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + inner.len());
    out.push(0b1000_0001); // FIN=1, opcode=1 (text)
    let len = inner.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(inner);
    out
}

fn websocket_looking_decode(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let first = *payload.first().ok_or_else(|| proto("websocket-looking frame empty"))?;
    if first != 0b1000_0001 {
        return Err(proto("websocket-looking frame header mismatch"));
    }
    let second = *payload.get(1).ok_or_else(|| proto("websocket-looking frame missing length byte"))?;
    let (len, header_len) = match second {
        126 => {
            let bytes = payload.get(2..4).ok_or_else(|| proto("websocket-looking frame truncated 16-bit length"))?;
            (u16::from_be_bytes(bytes.try_into().expect("2 bytes")) as usize, 4)
        }
        127 => {
            let bytes = payload.get(2..10).ok_or_else(|| proto("websocket-looking frame truncated 64-bit length"))?;
            (u64::from_be_bytes(bytes.try_into().expect("8 bytes")) as usize, 10)
        }
        n => (n as usize, 2),
    };
    let body = payload
        .get(header_len..header_len + len)
        .ok_or_else(|| proto("websocket-looking frame body shorter than declared length"))?;
    Ok(body.to_vec())
}

fn proto(msg: &str) -> WireError {
    WireError::Protocol(msg.to_string())
}
