//! Non-consuming extraction of the Server Name Indication from a TLS
//! ClientHello, plus a wrapper that replays the peeked bytes to the real TLS
//! stack.
//!
//! Grounded on the teacher's CONNECT-tunnel sniffing in `proxy::server`
//! (peek-then-replay over a buffered stream) generalized to the strict
//! record/handshake parsing required by §4.4.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::SniError;

const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 22;
const CLIENT_HELLO_HANDSHAKE_TYPE: u8 = 1;
const SNI_EXTENSION_TYPE: u16 = 0x0000;
const SNI_HOST_NAME_TYPE: u8 = 0;

/// Result of peeking a ClientHello: the extracted server name (empty string
/// if the extension was absent) and the raw bytes read from the connection,
/// which must be replayed before any further reads.
pub struct SniPeek {
    pub server_name: String,
    pub peeked_bytes: Vec<u8>,
}

/// Peek a TLS ClientHello from an async reader without consuming it from the
/// caller's perspective. The peeked bytes are always returned, even on
/// error, so a caller can pass them through unmodified.
pub async fn extract_sni<R>(conn: &mut R) -> Result<SniPeek, (SniError, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    if conn.read_exact(&mut header).await.is_err() {
        return Err((SniError::NotTls, header.to_vec()));
    }

    if header[0] != TLS_HANDSHAKE_CONTENT_TYPE {
        return Err((SniError::NotTls, header.to_vec()));
    }
    let record_len = u16::from_be_bytes([header[1 + 2], header[1 + 3]]) as usize;
    if !(4..=16384).contains(&record_len) {
        return Err((SniError::InvalidClientHello("record length out of range"), header.to_vec()));
    }

    let mut body = vec![0u8; record_len];
    let mut peeked = header.to_vec();
    if conn.read_exact(&mut body).await.is_err() {
        peeked.extend_from_slice(&body);
        return Err((SniError::InvalidClientHello("short record"), peeked));
    }
    peeked.extend_from_slice(&body);

    match parse_client_hello(&body) {
        Ok(server_name) => Ok(SniPeek {
            server_name,
            peeked_bytes: peeked,
        }),
        Err(e) => Err((e, peeked)),
    }
}

fn parse_client_hello(body: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(body);

    let handshake_type = cursor.take_u8()?;
    if handshake_type != CLIENT_HELLO_HANDSHAKE_TYPE {
        return Err(SniError::InvalidClientHello("not a ClientHello"));
    }
    let _handshake_len = cursor.take_u24()?;

    cursor.skip(2)?; // legacy protocol version
    cursor.skip(32)?; // random

    let session_id_len = cursor.take_u8()? as usize;
    cursor.skip(session_id_len)?;

    let cipher_suites_len = cursor.take_u16()? as usize;
    cursor.skip(cipher_suites_len)?;

    let compression_methods_len = cursor.take_u8()? as usize;
    cursor.skip(compression_methods_len)?;

    if cursor.remaining() == 0 {
        return Ok(String::new());
    }

    let extensions_len = cursor.take_u16()? as usize;
    let extensions = cursor.take_slice(extensions_len)?;
    parse_extensions(extensions)
}

fn parse_extensions(data: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(data);
    while cursor.remaining() > 0 {
        let ext_type = cursor.take_u16()?;
        let ext_len = cursor.take_u16()? as usize;
        let ext_data = cursor.take_slice(ext_len)?;
        if ext_type == SNI_EXTENSION_TYPE {
            if let Some(name) = parse_server_name_list(ext_data)? {
                return Ok(name);
            }
        }
    }
    Ok(String::new())
}

fn parse_server_name_list(data: &[u8]) -> Result<Option<String>, SniError> {
    let mut cursor = Cursor::new(data);
    let list_len = cursor.take_u16()? as usize;
    let mut list = Cursor::new(cursor.take_slice(list_len)?);

    while list.remaining() > 0 {
        let name_type = list.take_u8()?;
        let name_len = list.take_u16()? as usize;
        let name_bytes = list.take_slice(name_len)?;
        if name_type == SNI_HOST_NAME_TYPE {
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| SniError::InvalidClientHello("server name not utf8"))?;
            return Ok(Some(name.to_string()));
        }
    }
    Ok(None)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], SniError> {
        if self.remaining() < len {
            return Err(SniError::InvalidClientHello("out of bounds read"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), SniError> {
        self.take_slice(len).map(|_| ())
    }

    fn take_u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take_slice(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, SniError> {
        let b = self.take_slice(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u24(&mut self) -> Result<u32, SniError> {
        let b = self.take_slice(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

/// Wraps an async connection, replaying previously peeked bytes before
/// delegating to the underlying connection for both reads and writes.
pub struct ReplayConn<C> {
    inner: C,
    prefix: Vec<u8>,
    prefix_pos: usize,
}

impl<C> ReplayConn<C> {
    pub fn new(inner: C, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            prefix_pos: 0,
        }
    }

    fn prefix_remaining(&self) -> &[u8] {
        &self.prefix[self.prefix_pos..]
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ReplayConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = self.prefix_remaining();
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ReplayConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(server_name: &str) -> Vec<u8> {
        let mut sni_host_name = vec![0u8]; // name_type = host_name
        sni_host_name.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
        sni_host_name.extend_from_slice(server_name.as_bytes());

        let mut server_name_list = (sni_host_name.len() as u16).to_be_bytes().to_vec();
        server_name_list.extend_from_slice(&sni_host_name);

        let mut sni_extension = vec![0u8, 0u8]; // extension type 0x0000
        sni_extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_extension.extend_from_slice(&server_name_list);

        let mut extensions = (sni_extension.len() as u16).to_be_bytes().to_vec();
        extensions.extend_from_slice(&sni_extension);

        let mut body = vec![CLIENT_HELLO_HANDSHAKE_TYPE];
        let mut handshake_payload = vec![0u8, 0x03, 0x03]; // legacy version
        handshake_payload.extend_from_slice(&[0u8; 32]); // random
        handshake_payload.push(0); // session id len
        handshake_payload.extend_from_slice(&[0u8, 2, 0x13, 0x01]); // cipher suites
        handshake_payload.push(1); // compression methods len
        handshake_payload.push(0);
        handshake_payload.extend_from_slice(&extensions);

        let handshake_len = handshake_payload.len() as u32;
        body.extend_from_slice(&handshake_len.to_be_bytes()[1..]);
        body.extend_from_slice(&handshake_payload);

        let mut record = vec![TLS_HANDSHAKE_CONTENT_TYPE, 0x03, 0x03];
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    }

    #[tokio::test]
    async fn extracts_sni_from_well_formed_client_hello() {
        let record = client_hello_with_sni("api.example.com");
        let mut reader = tokio_test::io::Builder::new().read(&record).build();
        let peek = extract_sni(&mut reader).await.unwrap();
        assert_eq!(peek.server_name, "api.example.com");
        assert_eq!(peek.peeked_bytes, record);
    }

    #[tokio::test]
    async fn empty_server_name_when_extension_absent() {
        let mut record = client_hello_with_sni("api.example.com");
        // Truncate the extensions block so none remain (record length stays honest).
        let truncate_at = record.len() - 40;
        let new_body_len = truncate_at - 5;
        record.truncate(truncate_at);
        record[3] = ((new_body_len >> 8) & 0xff) as u8;
        record[4] = (new_body_len & 0xff) as u8;
        let handshake_len = (new_body_len - 4) as u32;
        let handshake_len_bytes = handshake_len.to_be_bytes();
        record[6] = handshake_len_bytes[1];
        record[7] = handshake_len_bytes[2];
        record[8] = handshake_len_bytes[3];

        let mut reader = tokio_test::io::Builder::new().read(&record).build();
        let peek = extract_sni(&mut reader).await.unwrap();
        assert_eq!(peek.server_name, "");
    }

    #[tokio::test]
    async fn non_handshake_content_type_is_not_tls() {
        let mut record = client_hello_with_sni("api.example.com");
        record[0] = 23; // application data
        let mut reader = tokio_test::io::Builder::new().read(&record).build();
        let (err, _) = extract_sni(&mut reader).await.unwrap_err();
        assert_eq!(err, SniError::NotTls);
    }

    #[tokio::test]
    async fn oversized_record_length_is_invalid() {
        let mut record = client_hello_with_sni("api.example.com");
        record[3] = 0xff;
        record[4] = 0xff;
        let mut reader = tokio_test::io::Builder::new().read(&record).build();
        let result = extract_sni(&mut reader).await;
        assert!(matches!(
            result,
            Err((SniError::InvalidClientHello(_), _))
        ));
    }

    #[tokio::test]
    async fn replay_conn_prepends_peeked_bytes() {
        let record = client_hello_with_sni("api.example.com");
        let tail = b"trailing application data".to_vec();
        let mut full_stream = record.clone();
        full_stream.extend_from_slice(&tail);

        let mut reader = tokio_test::io::Builder::new().read(&full_stream).build();
        let peek = extract_sni(&mut reader).await.unwrap();

        let mut inner_reader = tokio_test::io::Builder::new().read(&tail).build();
        let mut replay = ReplayConn::new(&mut inner_reader, peek.peeked_bytes);
        let mut observed = Vec::new();
        replay.read_to_end(&mut observed).await.unwrap();

        let mut expected = record;
        expected.extend_from_slice(&tail);
        assert_eq!(observed, expected);
    }
}
