//! Length-prefixed JSON framing over any async byte stream.
//!
//! The reader and writer are split so a session can hand its two halves to
//! independent tasks (`tokio::net::TcpStream::into_split`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, Result};

/// Size of the ASCII decimal length header.
pub const LENGTH_HEADER_BYTES: usize = 10;

/// Reads framed JSON messages from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_body_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_body_bytes: usize) -> Self {
        Self {
            inner,
            max_body_bytes,
        }
    }

    /// Read the next frame and decode its body.
    ///
    /// Returns `CodecError::Closed` when the peer shuts the stream down
    /// cleanly between frames. EOF inside a frame is `Truncated`.
    pub async fn read<M: DeserializeOwned>(&mut self) -> Result<M> {
        let body_len = self.read_header().await?;
        if body_len > self.max_body_bytes {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: self.max_body_bytes,
            });
        }

        let mut body = vec![0u8; body_len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| map_body_eof(e, body_len))?;

        Ok(serde_json::from_slice(&body)?)
    }

    /// Read and parse the 10-digit length header, retrying partial reads.
    async fn read_header(&mut self) -> Result<usize> {
        let mut buf = [0u8; LENGTH_HEADER_BYTES];
        let mut filled = 0;
        while filled < LENGTH_HEADER_BYTES {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Err(CodecError::Closed);
                }
                return Err(CodecError::Truncated {
                    expected: LENGTH_HEADER_BYTES,
                    got: filled,
                });
            }
            filled += n;
        }

        if !buf.iter().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::BadHeader(
                String::from_utf8_lossy(&buf).into_owned(),
            ));
        }

        // All-digit ASCII, guaranteed to parse; 10 digits fit in usize on
        // any supported target.
        let text = std::str::from_utf8(&buf)
            .map_err(|_| CodecError::BadHeader(String::from_utf8_lossy(&buf).into_owned()))?;
        text.parse::<usize>()
            .map_err(|_| CodecError::BadHeader(text.to_string()))
    }
}

/// Writes framed JSON messages to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
    max_body_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_body_bytes: usize) -> Self {
        Self {
            inner,
            max_body_bytes,
        }
    }

    /// Serialize and send one message as a single write + flush.
    pub async fn write<M: Serialize>(&mut self, msg: &M) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > self.max_body_bytes {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: self.max_body_bytes,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_HEADER_BYTES + body.len());
        frame.extend_from_slice(format!("{:010}", body.len()).as_bytes());
        frame.extend_from_slice(&body);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

fn map_body_eof(e: std::io::Error, expected: usize) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::Truncated { expected, got: 0 }
    } else {
        CodecError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::DEFAULT_MAX_FRAME_BYTES;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[tokio::test]
    async fn roundtrip_single_frame() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_BYTES);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let sent = Ping {
            seq: 7,
            note: "hello".to_string(),
        };
        writer.write(&sent).await.unwrap();

        let got: Ping = reader.read().await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn roundtrip_many_frames_in_order() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_BYTES);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        for seq in 0..32u64 {
            writer
                .write(&Ping {
                    seq,
                    note: "x".repeat(seq as usize),
                })
                .await
                .unwrap();
        }
        for seq in 0..32u64 {
            let got: Ping = reader.read().await.unwrap();
            assert_eq!(got.seq, seq);
            assert_eq!(got.note.len(), seq as usize);
        }
    }

    #[tokio::test]
    async fn header_is_zero_padded_to_ten_digits() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_BYTES);

        writer
            .write(&Ping {
                seq: 1,
                note: String::new(),
            })
            .await
            .unwrap();
        drop(writer);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let header = &raw[..LENGTH_HEADER_BYTES];
        assert!(header.iter().all(|b| b.is_ascii_digit()));
        let declared: usize = std::str::from_utf8(header).unwrap().parse().unwrap();
        assert_eq!(declared, raw.len() - LENGTH_HEADER_BYTES);
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        // Claim a 1 GiB body against a 1 KiB cap.
        client.write_all(b"1073741824").await.unwrap();
        let mut reader: FrameReader<_> = FrameReader::new(server, 1024);

        let err = reader.read::<Ping>().await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { size, max: 1024 } if size == 1 << 30));
    }

    #[tokio::test]
    async fn garbage_header_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"00000abc00").await.unwrap();
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let err = reader.read::<Ping>().await.unwrap_err();
        assert!(matches!(err, CodecError::BadHeader(_)));
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_closed() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let err = reader.read::<Ping>().await.unwrap_err();
        assert!(matches!(err, CodecError::Closed));
    }

    #[tokio::test]
    async fn eof_inside_header_is_truncated() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"00000").await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let err = reader.read::<Ping>().await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: LENGTH_HEADER_BYTES,
                got: 5
            }
        ));
    }

    #[tokio::test]
    async fn eof_inside_body_is_truncated() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"0000000100{\"seq\":").await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let err = reader.read::<Ping>().await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated { expected: 100, .. }));
    }

    #[tokio::test]
    async fn non_object_body_fails_decode() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"0000000004true").await.unwrap();
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);

        let err = reader.read::<Ping>().await.unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
