use std::collections::HashMap;
use std::str;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("request body is not valid JSON")
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::json(
            200,
            json!({
                "ok": true,
                "message": message.into()
            }),
        )
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self::json(
            status_code,
            json!({
                "ok": false,
                "message": message.into()
            }),
        )
    }

    pub fn json(status_code: u16, body: serde_json::Value) -> Self {
        Self { status_code, body }
    }
}

pub async fn read_http_request<S>(stream: &mut S) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            anyhow::bail!("request headers exceed maximum size");
        }
        let read = read_chunk(stream, &mut chunk).await?;
        if read == 0 {
            anyhow::bail!("connection closed before request headers were complete");
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = str::from_utf8(&buffer[..header_end]).context("request headers are not valid UTF-8")?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().context("missing request line")?.trim();
    let mut request_parts = request_line.split_whitespace();
    let method = request_parts
        .next()
        .context("missing request method")?
        .to_ascii_uppercase();
    let path = request_parts
        .next()
        .context("missing request path")?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .with_context(|| format!("invalid content-length {value:?}"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        anyhow::bail!("request body exceeds maximum size");
    }

    let mut body = buffer.split_off(header_end + 4);
    while body.len() < content_length {
        let read = read_chunk(stream, &mut chunk).await?;
        if read == 0 {
            anyhow::bail!("connection closed before request body was complete");
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

pub async fn write_http_response<S>(stream: &mut S, response: &HttpResponse) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body_text = serde_json::to_string(&response.body).context("failed to encode response")?;
    let payload = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status_code,
        reason_phrase(response.status_code),
        body_text.len(),
        body_text
    );

    stream
        .write_all(payload.as_bytes())
        .await
        .context("failed to write response")?;
    stream.flush().await.context("failed to flush response")
}

async fn read_chunk<S>(stream: &mut S, chunk: &mut [u8]) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    timeout(IO_TIMEOUT, stream.read(chunk))
        .await
        .context("timed out while reading request")?
        .context("failed to read request")
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::{read_http_request, write_http_response, HttpResponse};

    #[derive(Debug, Deserialize)]
    struct NamePayload {
        name: String,
    }

    #[tokio::test]
    async fn read_http_request_parses_headers_and_body() {
        let (mut client, mut server) = duplex(4096);
        let body = r#"{"name":"api"}"#;
        let raw = format!(
            "post /service-start HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        client
            .write_all(raw.as_bytes())
            .await
            .expect("failed to write request");

        let request = read_http_request(&mut server)
            .await
            .expect("failed to parse request");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/service-start");
        assert_eq!(
            request.headers.get("host").map(String::as_str),
            Some("localhost")
        );
        let payload: NamePayload = request.json().expect("valid body");
        assert_eq!(payload.name, "api");
    }

    #[tokio::test]
    async fn read_http_request_waits_for_split_body() {
        let (mut client, mut server) = duplex(4096);
        let reader = tokio::spawn(async move { read_http_request(&mut server).await });

        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 12\r\n\r\n{\"name\"")
            .await
            .expect("write head");
        client.write_all(b":\"a\"}").await.expect("write tail");

        let request = reader
            .await
            .expect("reader task")
            .expect("request should parse");
        assert_eq!(request.body, br#"{"name":"a"}"#.to_vec());
    }

    #[tokio::test]
    async fn read_http_request_rejects_truncated_stream() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"GET /healthz HTTP/1.1\r\nHost")
            .await
            .expect("write partial");
        drop(client);

        assert!(read_http_request(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn write_http_response_emits_json_with_length() {
        let (mut client, mut server) = duplex(4096);
        write_http_response(&mut server, &HttpResponse::error(404, "service not found"))
            .await
            .expect("write response");
        drop(server);

        let mut text = String::new();
        client
            .read_to_string(&mut text)
            .await
            .expect("read response");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 42\r\n"));
        assert!(text.ends_with(r#"{"message":"service not found","ok":false}"#));
    }
}
