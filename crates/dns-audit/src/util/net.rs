use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message is prefixed with a big-endian u16 giving the
/// total length of the message, so the entire message can be read
/// before parsing begins.
pub async fn read_tcp_bytes<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BytesMut, TcpError> {
    let expected = stream.read_u16().await.map_err(TcpError::IO)? as usize;
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                return Err(TcpError::TooShort {
                    expected,
                    actual: bytes.len(),
                })
            }
            Ok(_) => (),
            Err(err) => return Err(TcpError::IO(err)),
        }
    }
    Ok(bytes)
}

/// Write a serialised message to a TCP stream, with the two-byte
/// length prefix.
pub async fn send_tcp_bytes<S: AsyncWrite + Unpin>(
    stream: &mut S,
    bytes: &[u8],
) -> Result<(), TcpError> {
    let len = u16::try_from(bytes.len()).map_err(|_| TcpError::TooLong { actual: bytes.len() })?;

    stream.write_all(&len.to_be_bytes()).await.map_err(TcpError::IO)?;
    stream.write_all(bytes).await.map_err(TcpError::IO)?;
    stream.flush().await.map_err(TcpError::IO)?;

    Ok(())
}

/// An error that can occur when exchanging a DNS TCP message.
#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    #[error("expected {expected} octets but got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("message of {actual} octets does not fit a length prefix")]
    TooLong { actual: usize },
    #[error(transparent)]
    IO(#[from] io::Error),
}
