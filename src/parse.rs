// Incremental parsing of HTTP/1.x heads and bodies over raw streams, built
// on httparse. The server side needs this to classify request targets
// before anything else happens, and the raw upstream transport needs it to
// read CONNECT and challenge responses.
use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use tokio::io::{AsyncRead, AsyncReadExt};

/// How much data to read for a header section before it's considered
/// invalid.
const HEADER_SECTION_MAX_LENGTH: usize = 64 * 1024;

#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    /// The request target exactly as it appeared on the request line:
    /// authority-form for CONNECT, absolute-form for proxy requests,
    /// origin-form for requests addressed to us.
    pub target: String,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub minor_version: u8,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Reads and parses a request line plus header section. Consumed bytes are
/// removed from `buf`; anything the client pipelined after the head stays
/// there.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<RequestHead> {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).map_err(|e| anyhow!("invalid HTTP request: {}", e))? {
            httparse::Status::Complete(len) => {
                let head = RequestHead {
                    method: req.method.ok_or_else(|| anyhow!("missing HTTP method"))?.to_string(),
                    target: req.path.ok_or_else(|| anyhow!("missing request target"))?.to_string(),
                    minor_version: req.version.unwrap_or(1),
                    headers: collect_headers(req.headers),
                };
                buf.advance(len);
                return Ok(head);
            }
            httparse::Status::Partial => fill(reader, buf, "request header section").await?,
        }
    }
}

pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<ResponseHead> {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(buf).map_err(|e| anyhow!("invalid HTTP response: {}", e))? {
            httparse::Status::Complete(len) => {
                let head = ResponseHead {
                    status: resp.code.ok_or_else(|| anyhow!("missing response status"))?,
                    reason: resp.reason.unwrap_or_default().to_string(),
                    headers: collect_headers(resp.headers),
                };
                buf.advance(len);
                return Ok(head);
            }
            httparse::Status::Partial => fill(reader, buf, "response header section").await?,
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for h in parsed {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut, what: &str) -> Result<()> {
    if buf.len() >= HEADER_SECTION_MAX_LENGTH {
        bail!("{} exceeds {} bytes", what, HEADER_SECTION_MAX_LENGTH);
    }
    let n = reader.read_buf(buf).await?;
    if n == 0 {
        bail!("connection closed while reading {}", what);
    }
    Ok(())
}

/// Reads a message body according to the framing headers: Content-Length,
/// chunked transfer coding, or none at all. The whole body lands in memory
/// so it can be replayed for authentication.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    headers: &HeaderMap,
) -> Result<Vec<u8>> {
    if is_chunked(headers) {
        return read_chunked_body(reader, buf).await;
    }
    let length = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| anyhow!("unparseable Content-Length"))?,
        None => return Ok(Vec::new()),
    };
    let mut body = Vec::with_capacity(length.min(1 << 20));
    take(reader, buf, length, &mut body).await?;
    Ok(body)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = read_line(reader, buf).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| anyhow!("invalid chunk size: {:?}", size_str))?;
        if size == 0 {
            // Trailer section: skip lines through the final blank one.
            loop {
                if read_line(reader, buf).await?.is_empty() {
                    return Ok(body);
                }
            }
        }
        take(reader, buf, size, &mut body).await?;
        let crlf = read_line(reader, buf).await?;
        if !crlf.is_empty() {
            bail!("chunk data not followed by CRLF");
        }
    }
}

/// Moves exactly `n` bytes into `out`, draining `buf` before the stream.
async fn take<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    mut n: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let from_buf = n.min(buf.len());
    out.extend_from_slice(&buf[..from_buf]);
    buf.advance(from_buf);
    n -= from_buf;
    while n > 0 {
        let mut chunk = vec![0u8; n.min(64 * 1024)];
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            bail!("connection closed mid-body with {} bytes left", n);
        }
        out.extend_from_slice(&chunk[..read]);
        n -= read;
    }
    Ok(())
}

/// Reads one CRLF-terminated line (returned without the terminator).
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.advance(pos + 2);
            return Ok(line);
        }
        if buf.len() > HEADER_SECTION_MAX_LENGTH {
            bail!("line too long");
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            bail!("connection closed while reading line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_request(raw: &[u8]) -> (RequestHead, BytesMut) {
        let mut reader = tokio::io::BufReader::new(raw);
        let mut buf = BytesMut::new();
        let head = read_request_head(&mut reader, &mut buf).await.unwrap();
        // Drain whatever the reader still holds into the buffer so the
        // test can look at the leftover bytes.
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
            .await
            .unwrap();
        buf.extend_from_slice(&rest);
        (head, buf)
    }

    #[tokio::test]
    async fn parses_connect_request() {
        let (head, rest) = parse_request(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n").await;
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.test:443");
        assert_eq!(head.minor_version, 1);
        assert_eq!(head.headers.get("host").unwrap(), "example.test:443");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn leftover_bytes_stay_in_the_buffer() {
        let (head, rest) =
            parse_request(b"CONNECT example.test:443 HTTP/1.0\r\n\r\n\x16\x03\x01early").await;
        assert_eq!(head.minor_version, 0);
        assert_eq!(&rest[..], b"\x16\x03\x01early");
    }

    #[tokio::test]
    async fn parses_response_head() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut reader, &mut buf).await.unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.reason, "Proxy Authentication Required");
        assert_eq!(head.headers.get("proxy-authenticate").unwrap(), "NTLM");
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let raw = b"hello worldEXTRA";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("11"));
        let body = read_body(&mut reader, &mut buf, &headers).await.unwrap();
        assert_eq!(&body, b"hello world");
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let body = read_body(&mut reader, &mut buf, &headers).await.unwrap();
        assert_eq!(&body, b"hello world");
    }

    #[tokio::test]
    async fn missing_framing_means_no_body() {
        let raw = b"";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let body = read_body(&mut reader, &mut buf, &HeaderMap::new()).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let raw = b"short";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let mut buf = BytesMut::new();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        assert!(read_body(&mut reader, &mut buf, &headers).await.is_err());
    }
}
