/*
    navcard
    https://github.com/navcard/navcard

    Copyright 2025 navcard contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/ngt.rs

    Packet framing for the Avidyne/L-3 NGT transponder serial protocol.
    Messages travel in '~'-delimited frames with a two-character escape for
    the delimiter and escape bytes, and carry a little-endian word-sum
    checksum trailer.
*/

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NgtError {
    #[error("packet is missing a '~' frame marker")]
    MissingMarker,
    #[error("checksum mismatch: expected {expected:08x}, got {got:08x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("message is too short")]
    TooShort,
}

/// Sum of the little-endian 32-bit words of `data`; a short final word is
/// zero-extended.
pub fn checksum(data: &[u8]) -> u32 {
    let mut chk: u32 = 0;
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        chk = chk.wrapping_add(u32::from_le_bytes(word));
    }
    chk
}

fn decode_chunk(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len());
    let mut i = 0;
    while i < msg.len() {
        if msg[i] == b'}' && i + 1 < msg.len() {
            match msg[i + 1] {
                b'^' => {
                    out.push(b'~');
                    i += 2;
                    continue;
                }
                b']' => {
                    out.push(b'}');
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(msg[i]);
        i += 1;
    }
    out
}

fn encode_chunk(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len());
    for &b in msg {
        match b {
            b'}' => out.extend_from_slice(b"}]"),
            b'~' => out.extend_from_slice(b"}^"),
            _ => out.push(b),
        }
    }
    out
}

/// Split a raw packet into its unescaped frames.
pub fn decode_packet(packet: &[u8]) -> Result<Vec<Vec<u8>>, NgtError> {
    if packet.is_empty() {
        return Ok(Vec::new());
    }
    if !packet.starts_with(b"~") || !packet.ends_with(b"~") {
        return Err(NgtError::MissingMarker);
    }
    let inner = &packet[1..packet.len() - 1];
    Ok(split_frames(inner).iter().map(|chunk| decode_chunk(chunk)).collect())
}

fn split_frames(inner: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < inner.len() {
        if inner[i] == b'~' && inner[i + 1] == b'~' {
            frames.push(&inner[start..i]);
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    frames.push(&inner[start..]);
    frames
}

/// Re-wrap frames into a raw packet, escaping each frame.
pub fn encode_packet(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.push(b'~');
        out.extend_from_slice(&encode_chunk(frame));
        out.push(b'~');
    }
    out
}

/// Strip and verify the trailing checksum of a frame.
pub fn remove_checksum(data: &[u8]) -> Result<Vec<u8>, NgtError> {
    if data.len() < 4 {
        return Err(NgtError::TooShort);
    }
    let (content, trailer) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes(trailer.try_into().unwrap());
    let got = checksum(content);
    if got != expected {
        return Err(NgtError::ChecksumMismatch { expected, got });
    }
    Ok(content.to_vec())
}

/// Append the checksum trailer to a frame.
pub fn add_checksum(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.extend_from_slice(&checksum(data).to_le_bytes());
    out
}

/// Split a frame into its message type and payload, checking the declared
/// length.
pub fn unwrap_message(data: &[u8]) -> Result<(u16, Vec<u8>), NgtError> {
    if data.len() < 4 {
        return Err(NgtError::TooShort);
    }
    let msg_type = u16::from_le_bytes([data[0], data[1]]);
    let msg_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    if msg_len != data.len() - 4 {
        return Err(NgtError::LengthMismatch {
            expected: data.len() - 4,
            got: msg_len,
        });
    }
    Ok((msg_type, data[4..].to_vec()))
}

/// Prepend the message type and length header to a payload.
pub fn wrap_message(msg_type: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.extend_from_slice(&msg_type.to_le_bytes());
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Strip the checksum of a data block and split off its leading type word.
pub fn unwrap_data_block(data: &[u8]) -> Result<(u32, Vec<u8>), NgtError> {
    let data = remove_checksum(data)?;
    if data.len() < 4 {
        return Err(NgtError::TooShort);
    }
    let data_type = u32::from_le_bytes(data[0..4].try_into().unwrap());
    Ok((data_type, data[4..].to_vec()))
}

/// Build a checksummed data block from a type word and content.
pub fn wrap_data_block(data_type: u32, content: &[u8]) -> Vec<u8> {
    let mut block = data_type.to_le_bytes().to_vec();
    block.extend_from_slice(content);
    add_checksum(&block)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: [u8; 64] = [
        0x7E, 0x09, 0x00, 0x24, 0x00, 0xFF, 0xA0, 0x06, 0x00, 0xE8, 0x00, 0x21, 0x01, 0x0B, 0x00,
        0x04, 0x80, 0xB8, 0x02, 0x00, 0x00, 0xBC, 0x00, 0x00, 0x08, 0x0D, 0x60, 0xA3, 0x05, 0x0E,
        0x00, 0xD4, 0x2C, 0x83, 0x06, 0x00, 0x00, 0xD0, 0x00, 0x00, 0x00, 0xDD, 0x0C, 0xC7, 0xBB,
        0x7E, 0x7E, 0x09, 0x00, 0x08, 0x00, 0xEF, 0x10, 0xE0, 0x97, 0xEF, 0x10, 0x00, 0x18, 0xE7,
        0x21, 0xE8, 0xAF, 0x7E,
    ];

    #[test]
    fn test_decode_encode() {
        let frames = decode_packet(&SAMPLE).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(encode_packet(&frames), SAMPLE.to_vec());

        let msg1 = remove_checksum(&frames[0]).unwrap();
        let msg2 = remove_checksum(&frames[1]).unwrap();

        assert_eq!(add_checksum(&msg1), frames[0]);
        assert_eq!(add_checksum(&msg2), frames[1]);

        let (type1, content1) = unwrap_message(&msg1).unwrap();
        let (type2, content2) = unwrap_message(&msg2).unwrap();

        assert_eq!(wrap_message(type1, &content1), msg1);
        assert_eq!(wrap_message(type2, &content2), msg2);
    }

    #[test]
    fn test_escapes() {
        let frame = vec![b'a', b'~', b'}', b'b'];
        let packet = encode_packet(&[frame.clone()]);
        assert_eq!(packet, b"~a}^}]b~");
        assert_eq!(decode_packet(&packet).unwrap(), vec![frame]);
    }

    #[test]
    fn test_bad_checksum() {
        let mut frame = add_checksum(b"hello!!!");
        *frame.last_mut().unwrap() ^= 1;
        assert!(matches!(
            remove_checksum(&frame),
            Err(NgtError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_data_block() {
        let block = wrap_data_block(0x3700_01F8, &5u32.to_le_bytes());
        let (data_type, content) = unwrap_data_block(&block).unwrap();
        assert_eq!(data_type, 0x3700_01F8);
        assert_eq!(content, 5u32.to_le_bytes());
    }
}
