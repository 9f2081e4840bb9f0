use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Canned TLS ClientHello decoy: 52 bytes, TLS 1.2 handshake version,
/// zeroed random, two RSA cipher suites, null compression. Middleboxes
/// key on this fingerprint, so the bytes must not change.
pub const FAKE_TLS: &[u8] = &[
    0x16, 0x03, 0x01, 0x00, 0x2f, // record header
    0x01, 0x00, 0x00, 0x2b, // handshake header
    0x03, 0x03, // client version
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // random
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, // session id length
    0x00, 0x04, // cipher suites length
    0x00, 0x2f, 0x00, 0x35, // TLS_RSA_WITH_AES_{128,256}_CBC_SHA
    0x01, 0x00, // null compression
];

pub const FAKE_HTTP: &[u8] =
    b"GET / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: Mozilla/5.0\r\nAccept: */*\r\n\r\n";

pub const FAKE_UDP: &[u8] = &[0x00; 8];

/// An immutable byte-slice value with an offset cursor. Splitting is
/// zero-copy: both halves share the underlying buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    offset: usize,
    size: usize,
}

impl Packet {
    pub fn owned(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data: Bytes::from(data),
            offset: 0,
            size,
        }
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
            offset: 0,
            size: data.len(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Advances the cursor, shrinking the visible payload from the front.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.size);
        self.offset += n;
        self.size -= n;
    }

    /// Splits at `pos` within the payload. `pos >= len` leaves the
    /// second half empty.
    pub fn split_at(&self, pos: usize) -> (Packet, Packet) {
        let pos = pos.min(self.size);
        let first = Packet {
            data: self.data.clone(),
            offset: self.offset,
            size: pos,
        };
        let second = Packet {
            data: self.data.clone(),
            offset: self.offset + pos,
            size: self.size - pos,
        };
        (first, second)
    }
}

/// Reads and writes packets on a stream socket and hands out the canned
/// decoy payloads.
#[derive(Debug, Clone)]
pub struct PacketHandler {
    buffer_size: usize,
}

impl PacketHandler {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    /// Reads up to `buffer_size` bytes. `None` means EOF.
    pub async fn read<R>(&self, stream: &mut R) -> io::Result<Option<Packet>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Packet::owned(buf)))
    }

    /// Writes the packet payload as one logical send and flushes so it
    /// is not coalesced with later writes.
    pub async fn write<W>(&self, stream: &mut W, packet: &Packet) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stream.write_all(packet.payload()).await?;
        stream.flush().await
    }

    pub fn fake_tls(&self) -> Packet {
        Packet::from_static(FAKE_TLS)
    }

    pub fn fake_http(&self) -> Packet {
        Packet::from_static(FAKE_HTTP)
    }

    pub fn fake_udp(&self) -> Packet {
        Packet::from_static(FAKE_UDP)
    }
}

/// Check whether the buffer starts with a TLS handshake record.
pub fn is_tls_client_hello(buffer: &[u8]) -> bool {
    if buffer.len() < 5 {
        return false;
    }
    let version = u16::from_be_bytes([buffer[1], buffer[2]]);
    buffer[0] == 0x16 && (0x0301..=0x0304).contains(&version)
}

fn read_u16(buffer: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *buffer.get(at)?,
        *buffer.get(at + 1)?,
    ]))
}

/// Byte index of the SNI hostname inside a TLS ClientHello, if any.
pub fn find_sni_offset(buffer: &[u8]) -> Option<usize> {
    if !is_tls_client_hello(buffer) {
        return None;
    }

    // record header, handshake header, client version, random
    let mut at = 5 + 4 + 2 + 32;
    at += 1 + *buffer.get(at)? as usize; // session id
    at += 2 + read_u16(buffer, at)? as usize; // cipher suites
    at += 1 + *buffer.get(at)? as usize; // compression methods

    let extensions_end = at + 2 + read_u16(buffer, at)? as usize;
    at += 2;

    while at + 4 <= extensions_end.min(buffer.len()) {
        let ext_type = read_u16(buffer, at)?;
        let ext_len = read_u16(buffer, at + 2)? as usize;
        at += 4;

        if ext_type == 0x0000 {
            // server_name: list length (2), name type (1), name length (2)
            if *buffer.get(at + 2)? != 0x00 {
                return None;
            }
            let name_at = at + 5;
            return (name_at <= buffer.len()).then_some(name_at);
        }
        at += ext_len;
    }
    None
}

/// Byte index of the value of an HTTP `Host:` header, if any.
pub fn find_http_host_offset(buffer: &[u8]) -> Option<usize> {
    const NEEDLE: &[u8] = b"Host: ";
    buffer
        .windows(NEEDLE.len())
        .position(|w| w == NEEDLE)
        .map(|at| at + NEEDLE.len())
}

/// Minimal ClientHello carrying a single server_name extension.
#[cfg(test)]
pub(crate) fn client_hello_with_sni(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    let mut ext = Vec::new();
    ext.extend([0x00, 0x00]); // server_name
    ext.extend(((name.len() + 5) as u16).to_be_bytes()); // extension length
    ext.extend(((name.len() + 3) as u16).to_be_bytes()); // list length
    ext.push(0x00); // host_name
    ext.extend((name.len() as u16).to_be_bytes());
    ext.extend(name);

    let mut body = vec![0x03, 0x03];
    body.extend([0u8; 32]);
    body.push(0x00); // empty session id
    body.extend([0x00, 0x02, 0x13, 0x01]); // one cipher suite
    body.extend([0x01, 0x00]); // null compression
    body.extend((ext.len() as u16).to_be_bytes());
    body.extend(&ext);

    let mut hs = vec![0x01];
    hs.extend(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend((hs.len() as u16).to_be_bytes());
    record.extend(&hs);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_tls_shape() {
        assert_eq!(FAKE_TLS.len(), 52);
        assert!(is_tls_client_hello(FAKE_TLS));
        // record and handshake lengths cover the remaining bytes
        assert_eq!(u16::from_be_bytes([FAKE_TLS[3], FAKE_TLS[4]]) as usize, 47);
        assert_eq!(FAKE_TLS[8] as usize, 43);
        // cipher suites 0x002f, 0x0035
        assert_eq!(&FAKE_TLS[46..50], &[0x00, 0x2f, 0x00, 0x35]);
    }

    #[test]
    fn canned_decoys_expose_full_payload() {
        let handler = PacketHandler::new(64);
        assert_eq!(handler.fake_tls().payload(), FAKE_TLS);
        assert_eq!(handler.fake_http().payload(), FAKE_HTTP);
        assert_eq!(handler.fake_udp().payload(), FAKE_UDP);
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let handler = PacketHandler::new(16);

        handler
            .write(&mut a, &Packet::owned(b"hello".to_vec()))
            .await
            .unwrap();
        let packet = handler.read(&mut b).await.unwrap().unwrap();
        assert_eq!(packet.payload(), b"hello");

        drop(a);
        assert!(handler.read(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn split_concatenation_is_identity() {
        let packet = Packet::owned(b"HELLOWORLD".to_vec());
        for pos in 0..=packet.len() + 2 {
            let (first, second) = packet.split_at(pos);
            let mut joined = first.payload().to_vec();
            joined.extend(second.payload());
            assert_eq!(joined, b"HELLOWORLD");
        }
    }

    #[test]
    fn split_past_end_leaves_second_empty() {
        let packet = Packet::owned(b"abc".to_vec());
        let (first, second) = packet.split_at(10);
        assert_eq!(first.payload(), b"abc");
        assert!(second.is_empty());
    }

    #[test]
    fn advance_moves_cursor() {
        let mut packet = Packet::owned(b"abcdef".to_vec());
        packet.advance(2);
        assert_eq!(packet.payload(), b"cdef");
        packet.advance(100);
        assert!(packet.is_empty());
    }

    #[test]
    fn finds_sni_in_client_hello() {
        let hello = client_hello_with_sni("example.org");
        let at = find_sni_offset(&hello).unwrap();
        assert_eq!(&hello[at..at + 11], b"example.org");
    }

    #[test]
    fn no_sni_in_plain_bytes() {
        assert!(find_sni_offset(b"GET / HTTP/1.1\r\n\r\n").is_none());
        assert!(find_sni_offset(&[]).is_none());
        // canned hello has no extensions at all
        assert!(find_sni_offset(FAKE_TLS).is_none());
    }

    #[test]
    fn finds_http_host_value() {
        let at = find_http_host_offset(FAKE_HTTP).unwrap();
        assert_eq!(&FAKE_HTTP[at..at + 11], b"example.com");
        assert!(find_http_host_offset(b"no headers here").is_none());
    }
}
