// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by a
// JSON-serialized message payload. `write_frame` / `read_frame` operate on
// raw bytes; `send_json` / `recv_json` add the serde layer on top so both
// sides of a connection share one encoding path.
//
// `MAX_MESSAGE_SIZE` (16 MB) protects against unbounded allocation from
// malformed or malicious length prefixes. Full-history replays are sent as
// individual turn messages, so no single frame approaches the limit.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum allowed frame payload (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Write a length-delimited frame: 4-byte big-endian length, then payload.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read a length-delimited frame.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame and
/// `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialize `msg` as JSON and write it as one frame.
pub fn send_json<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(io::Error::other)?;
    write_frame(writer, &json)
}

/// Read one frame and deserialize it from JSON. Malformed JSON is reported
/// as `InvalidData`.
pub fn recv_json<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let bytes = read_frame(reader)?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
