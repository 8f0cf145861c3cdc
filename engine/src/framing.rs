use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::error::{HttpError, Result};

/// Reads one HTTP/1.x response off a buffered byte stream, capturing the
/// exact bytes received into a contiguous buffer. Every individual read
/// operation (a line, or a body chunk) is bounded by `read_timeout`; the
/// overall body is bounded by `body_mem_limit`. Returns the raw bytes
/// together with the elapsed time to the status line's arrival (TTFB).
pub async fn read_response<S>(
    stream: &mut BufReader<S>,
    read_timeout: Duration,
    body_mem_limit: usize,
) -> Result<(Bytes, Duration)>
where
    S: AsyncRead + Unpin,
{
    let start = Instant::now();
    let mut raw = BytesMut::new();

    read_line(stream, read_timeout, &mut raw).await?;
    let ttfb = start.elapsed();
    let header_start = raw.len();
    loop {
        let line_start = raw.len();
        let eof = read_line(stream, read_timeout, &mut raw).await?;
        let line = &raw[line_start..];
        if line == b"\r\n" || line == b"\n" || eof {
            break;
        }
    }
    let header_bytes = &raw[header_start..];
    let headers = quick_parse_headers(header_bytes);

    if let Some(len) = headers.get("content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| HttpError::Protocol(format!("invalid Content-Length: {len}")))?;
        if len > body_mem_limit {
            return Err(HttpError::BodyTooLarge { limit: body_mem_limit });
        }
        read_exact_into(stream, read_timeout, &mut raw, len).await?;
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        read_chunked(stream, read_timeout, body_mem_limit, &mut raw).await?;
    } else {
        read_to_close(stream, read_timeout, body_mem_limit, &mut raw).await?;
    }

    Ok((raw.freeze(), ttfb))
}

/// Case-insensitive, last-value-wins header index used only to decide body
/// framing. The response's full ordered multimap is built separately by
/// [`crate::response::project`].
fn quick_parse_headers(header_bytes: &[u8]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in header_bytes.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(line) else {
            continue;
        };
        if let Some((name, value)) = text.split_once(':') {
            map.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    map
}

/// Reads one `\n`-terminated line into `raw`. Returns `true` if the stream
/// hit EOF before a terminator was found (the caller treats this as "no more
/// lines", not an error — whatever was captured stands).
async fn read_line<S>(stream: &mut BufReader<S>, read_timeout: Duration, raw: &mut BytesMut) -> Result<bool>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let n = with_timeout(read_timeout, stream.read_until(b'\n', &mut line)).await?;
    let eof = n == 0 || !line.ends_with(b"\n");
    raw.extend_from_slice(&line);
    Ok(eof)
}

async fn read_exact_into<S>(
    stream: &mut BufReader<S>,
    read_timeout: Duration,
    raw: &mut BytesMut,
    len: usize,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    with_timeout(read_timeout, stream.read_exact(&mut buf)).await?;
    raw.extend_from_slice(&buf);
    Ok(())
}

async fn read_to_close<S>(
    stream: &mut BufReader<S>,
    read_timeout: Duration,
    body_mem_limit: usize,
    raw: &mut BytesMut,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut taken = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        if taken >= body_mem_limit {
            break;
        }
        let want = std::cmp::min(chunk.len(), body_mem_limit - taken);
        let n = with_timeout(read_timeout, stream.read(&mut chunk[..want])).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        taken += n;
    }
    Ok(())
}

/// Decodes chunked transfer-encoding. Chunk-size lines, extensions, and
/// trailers are preserved verbatim in `raw`; only the hex size token is used
/// to drive the decoder.
async fn read_chunked<S>(
    stream: &mut BufReader<S>,
    read_timeout: Duration,
    body_mem_limit: usize,
    raw: &mut BytesMut,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut total = 0usize;
    loop {
        let size_line_start = raw.len();
        read_line(stream, read_timeout, raw).await?;
        let size_line = &raw[size_line_start..];
        let size_line = size_line.strip_suffix(b"\n").unwrap_or(size_line);
        let size_line = size_line.strip_suffix(b"\r").unwrap_or(size_line);
        let size_text = std::str::from_utf8(size_line)
            .map_err(|_| HttpError::Protocol("invalid chunk size line".into()))?;
        let size_token = size_text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| HttpError::Protocol(format!("invalid chunk size: {size_token}")))?;

        if size == 0 {
            loop {
                let trailer_start = raw.len();
                read_line(stream, read_timeout, raw).await?;
                let trailer = &raw[trailer_start..];
                if trailer == b"\r\n" || trailer == b"\n" || trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        total += size;
        if total > body_mem_limit {
            return Err(HttpError::BodyTooLarge { limit: body_mem_limit });
        }

        read_exact_into(stream, read_timeout, raw, size).await?;
        // Trailing CRLF after the chunk data.
        read_line(stream, read_timeout, raw).await?;
    }
    Ok(())
}

async fn with_timeout<F, T>(d: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(d, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(HttpError::Connection(e)),
        Err(_) => Err(HttpError::timeout("read deadline exceeded")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn frame(input: &[u8], body_mem_limit: usize) -> Result<Bytes> {
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        let (raw, ttfb) = read_response(&mut reader, Duration::from_secs(1), body_mem_limit).await?;
        assert!(ttfb < Duration::from_secs(1));
        Ok(raw)
    }

    #[tokio::test]
    async fn content_length_framing() {
        let input = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, World!";
        let raw = frame(input, 4096).await.expect("frames");
        assert_eq!(&raw[..], &input[..]);
    }

    #[tokio::test]
    async fn chunked_framing_preserves_wire_bytes() {
        let input: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7\r\n, World\r\n1\r\n!\r\n0\r\n\r\n";
        let raw = frame(input, 4096).await.expect("frames");
        assert_eq!(&raw[..], input);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("chunked"));
        assert!(text.contains("5\r\n"));
    }

    #[tokio::test]
    async fn chunk_extensions_and_trailers_preserved() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nHello\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let raw = frame(input, 4096).await.expect("frames");
        assert_eq!(&raw[..], input);
    }

    #[tokio::test]
    async fn read_to_close_on_eof() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nbody-without-length";
        let raw = frame(input, 4096).await.expect("frames");
        assert_eq!(&raw[..], input);
    }

    #[tokio::test]
    async fn content_length_over_cap_is_body_too_large() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\n\r\n";
        let err = frame(input, 4 * 1024 * 1024).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BodyTooLarge);
    }

    #[tokio::test]
    async fn chunked_accumulation_over_cap_is_body_too_large() {
        let input: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nA\r\n0123456789\r\n0\r\n\r\n";
        let err = frame(input, 5).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BodyTooLarge);
    }
}
