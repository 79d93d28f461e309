//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! The TLS listener reads the first record of every connection before it
//! decides between passthrough and termination. The bytes consumed here are
//! handed back to the caller so they can be replayed into the TLS acceptor
//! or forwarded verbatim to the passthrough upstream.
//!
//! Bounds:
//! - sniff timeout: 200ms default
//! - sniff buffer: 8192 bytes default

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default timeout for SNI sniffing.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

/// Default maximum bytes to read when sniffing for SNI.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// SNI hostname, lowercased with any trailing dot removed.
    Found(String),
    /// ClientHello without a server_name extension (or an empty one).
    NoSni,
    /// First bytes are not a TLS handshake record.
    NotTls,
    /// Client did not send a ClientHello in time.
    Timeout,
    /// I/O error while reading.
    IoError(String),
    /// ClientHello is truncated or inconsistent.
    Malformed,
}

impl SniResult {
    /// The hostname, if one was found.
    pub fn hostname(&self) -> Option<&str> {
        match self {
            SniResult::Found(host) => Some(host),
            _ => None,
        }
    }
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Reads and parses the ClientHello at the start of a TLS connection.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Read the first TLS record into `buffer` and extract the SNI hostname.
    ///
    /// On return `buffer` holds exactly the bytes consumed from `stream`;
    /// the caller must replay them downstream.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> SniResult {
        buffer.clear();
        buffer.resize(self.config.max_bytes, 0);

        match timeout(self.config.timeout, self.read_first_record(stream, buffer)).await {
            Ok(Ok(read)) => {
                buffer.truncate(read);
                parse_sni(buffer)
            }
            Ok(Err(e)) => {
                buffer.clear();
                SniResult::IoError(e.to_string())
            }
            Err(_) => {
                buffer.clear();
                warn!(timeout_ms = self.config.timeout.as_millis() as u64, "SNI sniff timeout");
                SniResult::Timeout
            }
        }
    }

    async fn read_first_record<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut [u8],
    ) -> io::Result<usize> {
        let mut read = 0;

        while read < RECORD_HEADER_LEN {
            let n = stream.read(&mut buffer[read..]).await?;
            if n == 0 {
                return Ok(read);
            }
            read += n;
        }

        if buffer[0] != CONTENT_TYPE_HANDSHAKE {
            return Ok(read);
        }

        let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
        let wanted = (RECORD_HEADER_LEN + record_len).min(buffer.len());

        while read < wanted {
            let n = stream.read(&mut buffer[read..wanted]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }

        debug!(bytes = read, record_len, "Read ClientHello record");
        Ok(read)
    }
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    /// Take up to `len` bytes; a truncated buffer yields what is there.
    fn take_clipped(&mut self, len: usize) -> &'a [u8] {
        let len = len.min(self.remaining());
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        bytes
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.take(len).map(|_| ())
    }
}

/// Parse the SNI hostname out of a buffered TLS record.
///
/// Layout walked: record header (5), handshake type (1) and length (3),
/// client version (2), random (32), session id, cipher suites,
/// compression methods, then the extension list.
pub fn parse_sni(data: &[u8]) -> SniResult {
    if data.len() < RECORD_HEADER_LEN + 4 {
        return SniResult::Malformed;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }

    let mut r = Reader::new(&data[RECORD_HEADER_LEN..]);
    if r.u8() != Some(HANDSHAKE_CLIENT_HELLO) {
        return SniResult::NotTls;
    }

    let parsed = (|| {
        r.skip(3)?; // handshake length
        r.skip(2 + 32)?; // version + random
        let session_id_len = r.u8()? as usize;
        r.skip(session_id_len)?;
        let suites_len = r.u16()? as usize;
        r.skip(suites_len)?;
        let compression_len = r.u8()? as usize;
        r.skip(compression_len)?;
        Some(())
    })();
    if parsed.is_none() {
        return SniResult::Malformed;
    }

    // A ClientHello may legally end without extensions.
    let Some(extensions_len) = r.u16() else {
        return SniResult::NoSni;
    };
    let mut extensions = Reader::new(r.take_clipped(extensions_len as usize));

    while extensions.remaining() >= 4 {
        let (Some(kind), Some(len)) = (extensions.u16(), extensions.u16()) else {
            return SniResult::Malformed;
        };
        let body = extensions.take_clipped(len as usize);
        if kind == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }

    SniResult::NoSni
}

/// Parse the server_name extension body: a list of (type, length, name).
fn parse_server_name(data: &[u8]) -> SniResult {
    let mut r = Reader::new(data);
    let Some(list_len) = r.u16() else {
        return SniResult::Malformed;
    };
    let Some(list) = r.take(list_len as usize) else {
        return SniResult::Malformed;
    };

    let mut entries = Reader::new(list);
    while entries.remaining() >= 3 {
        let (Some(name_type), Some(name_len)) = (entries.u8(), entries.u16()) else {
            return SniResult::Malformed;
        };
        let Some(name) = entries.take(name_len as usize) else {
            return SniResult::Malformed;
        };
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        return match std::str::from_utf8(name) {
            Ok(host) => {
                let host = host.trim_end_matches('.').to_ascii_lowercase();
                if host.is_empty() {
                    SniResult::NoSni
                } else {
                    SniResult::Found(host)
                }
            }
            Err(_) => SniResult::Malformed,
        };
    }

    SniResult::NoSni
}
