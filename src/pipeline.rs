//! HTTP parsing and forwarding pipeline: turns a client's request into an
//! upstream request, and an upstream response back into bytes on the wire.
//!
//! The three stages below (`parse_request`, `forward_client_request`,
//! `forward_server_response`) are always invoked in that order for a given
//! connection; none of them retry or loop back into an earlier stage.

use crate::error::{ProxyError, ProxyResult};
use crate::io::LineReader;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Request line / header accumulation buffer.
pub const LINE_BUFFER_SIZE: usize = 8192;
/// Header block staging buffer.
pub const HEADER_BUFFER_SIZE: usize = 1_048_576;

const USER_AGENT_HDR: &str =
    "User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:98.0) Gecko/20100101 Firefox/98.0\r\n";
const CONN_HDR: &str = "Connection: close\r\n";
const PROXY_CONN_HDR: &str = "Proxy-Connection: close\r\n";

/// A parsed, forward-ready client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    /// The request line exactly as sent by the client, CRLF-terminated.
    /// Used (together with `headers`) as the cache fingerprint input.
    pub request_line: String,
    /// CRLF-terminated header block copied verbatim from the client,
    /// including the trailing blank line.
    pub headers: String,
}

/// A parsed origin response, ready to be forwarded or cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_line: String,
    /// CRLF-terminated header block, including the trailing blank line.
    pub headers: String,
    pub body: Bytes,
    pub body_len: usize,
}

/// Reads and parses one HTTP request from `client`. On a client protocol
/// error, writes the matching HTML error page to `client` before returning
/// `Err(ProxyError::ClientProtocol { .. })` — the caller has nothing more
/// to report and should simply close the connection.
pub async fn parse_request<S>(client: &mut S) -> ProxyResult<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = LineReader::new(&mut *client);

    let line = reader
        .read_line(LINE_BUFFER_SIZE)
        .await
        .map_err(ProxyError::ClientIo)?;
    if line.is_empty() {
        write_client_error(client, 400, "Bad request", "empty request").await?;
        return Err(ProxyError::ClientProtocol {
            status: 400,
            reason: "Bad request",
        });
    }
    let request_line = String::from_utf8_lossy(&line).to_string();
    let mut tokens = request_line.split_whitespace();
    let (method, url, version) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(m), Some(u), Some(v)) if tokens.next().is_none() => {
            (m.to_string(), u.to_string(), v.to_string())
        }
        _ => {
            write_client_error(client, 400, "Bad request", &request_line).await?;
            return Err(ProxyError::ClientProtocol {
                status: 400,
                reason: "Bad request",
            });
        }
    };

    if method != "GET" {
        write_client_error(client, 501, "Not implemented", &method).await?;
        return Err(ProxyError::ClientProtocol {
            status: 501,
            reason: "Not implemented",
        });
    }
    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        write_client_error(client, 505, "HTTP version not supported", &method).await?;
        return Err(ProxyError::ClientProtocol {
            status: 505,
            reason: "HTTP version not supported",
        });
    }

    let mut headers = String::new();
    let mut host_header: Option<String> = None;
    loop {
        let hdr = reader
            .read_line(LINE_BUFFER_SIZE)
            .await
            .map_err(ProxyError::ClientIo)?;
        if hdr.is_empty() {
            return Err(ProxyError::ClientIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed while sending headers",
            )));
        }
        let hdr_line = String::from_utf8_lossy(&hdr).to_string();

        if headers.len() + hdr_line.len() > HEADER_BUFFER_SIZE {
            write_client_error(client, 400, "Bad request", "header block too large").await?;
            return Err(ProxyError::ClientProtocol {
                status: 400,
                reason: "Bad request",
            });
        }

        if let Some(value) = find_header_value(&hdr_line, "host") {
            host_header = Some(value.to_string());
        }

        let is_blank = hdr_line == "\r\n" || hdr_line == "\n";
        headers.push_str(&hdr_line);
        if is_blank {
            break;
        }
    }

    let (url_host, url_port, path) = parse_url(&url);
    let (hostname, port) = if let Some(host) = url_host {
        (host, url_port.unwrap_or(80))
    } else if let Some(host_value) = host_header {
        split_host_port(&host_value)
    } else {
        write_client_error(client, 400, "Bad request", &request_line).await?;
        return Err(ProxyError::ClientProtocol {
            status: 400,
            reason: "Bad request",
        });
    };

    Ok(Request {
        method,
        hostname,
        port,
        path,
        request_line,
        headers,
    })
}

/// Parses `Host:`-header-style `host[:port]` text, defaulting to port 80.
fn split_host_port(value: &str) -> (String, u16) {
    match value.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.trim().parse().unwrap_or(80)),
        None => (value.to_string(), 80),
    }
}

/// Parses an absolute-form request URL (`http://host[:port][/path]`),
/// returning the authority's host, its explicit port (if any), and the
/// full path (defaulting to `/`, and — unlike a naive `strtok`-style
/// tokenizer — never truncated at the first path segment).
pub fn parse_url(url: &str) -> (Option<String>, Option<u16>, String) {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let path = if path.is_empty() { "/".to_string() } else { path };

    if authority.is_empty() {
        return (None, None, path);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => (Some(host.to_string()), port.parse().ok(), path),
        None => (Some(authority.to_string()), None, path),
    }
}

/// Opens a connection to the request's origin, sends an HTTP/1.0 request
/// built from it, and parses the origin's response in full.
pub async fn forward_client_request(request: &Request) -> ProxyResult<Response> {
    let mut upstream = TcpStream::connect((request.hostname.as_str(), request.port))
        .await
        .map_err(ProxyError::Upstream)?;

    let request_line = format!("GET {} HTTP/1.0\r\n", request.path);
    let mut header_block = String::with_capacity(
        USER_AGENT_HDR.len() + CONN_HDR.len() + PROXY_CONN_HDR.len() + request.headers.len(),
    );
    header_block.push_str(USER_AGENT_HDR);
    header_block.push_str(CONN_HDR);
    header_block.push_str(PROXY_CONN_HDR);
    header_block.push_str(&request.headers);

    upstream
        .write_all(request_line.as_bytes())
        .await
        .map_err(ProxyError::Upstream)?;
    upstream
        .write_all(header_block.as_bytes())
        .await
        .map_err(ProxyError::Upstream)?;

    let mut reader = LineReader::new(&mut upstream);
    let status_line_bytes = reader.read_line(LINE_BUFFER_SIZE).await.map_err(ProxyError::Upstream)?;
    if status_line_bytes.is_empty() {
        return Err(ProxyError::Upstream(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "origin closed before sending a status line",
        )));
    }
    let status_line = String::from_utf8_lossy(&status_line_bytes).to_string();

    let mut headers = String::new();
    let mut content_length: Option<usize> = None;
    loop {
        let hdr = reader.read_line(LINE_BUFFER_SIZE).await.map_err(ProxyError::Upstream)?;
        if hdr.is_empty() {
            return Err(ProxyError::Upstream(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "origin closed while sending headers",
            )));
        }
        let hdr_line = String::from_utf8_lossy(&hdr).to_string();

        if headers.len() + hdr_line.len() > HEADER_BUFFER_SIZE {
            return Err(ProxyError::Upstream(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "origin response headers exceeded the staging buffer",
            )));
        }

        if let Some(value) = find_header_value(&hdr_line, "content-length") {
            if let Ok(n) = value.trim().parse::<usize>() {
                content_length = Some(n);
            }
        }

        let is_blank = hdr_line == "\r\n" || hdr_line == "\n";
        headers.push_str(&hdr_line);
        if is_blank {
            break;
        }
    }

    let content_length = content_length.ok_or_else(|| {
        ProxyError::Upstream(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "origin response carried no Content-Length",
        ))
    })?;

    let body = reader.read_n(content_length).await.map_err(ProxyError::Upstream)?;

    Ok(Response {
        status_line,
        headers,
        body,
        body_len: content_length,
    })
}

/// Case-insensitively matches `name:` at the start of `line` and returns
/// the trimmed value, if present.
fn find_header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix_len = name.len() + 1; // "name:"
    if line.len() < prefix_len {
        return None;
    }
    let (candidate_name, rest) = line.split_at(prefix_len);
    if candidate_name[..name.len()].eq_ignore_ascii_case(name) && candidate_name.ends_with(':') {
        Some(rest.trim())
    } else {
        None
    }
}

/// Writes a response (status line, headers, body) to the client socket in
/// order, as three contiguous writes.
pub async fn forward_server_response<S>(client: &mut S, response: &Response) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin,
{
    client
        .write_all(response.status_line.as_bytes())
        .await
        .map_err(ProxyError::ClientIo)?;
    client
        .write_all(response.headers.as_bytes())
        .await
        .map_err(ProxyError::ClientIo)?;
    client
        .write_all(&response.body)
        .await
        .map_err(ProxyError::ClientIo)?;
    Ok(())
}

/// Writes a small self-contained HTML error page to the client socket.
async fn write_client_error<S>(client: &mut S, status: u16, short_msg: &str, cause: &str) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!(
        "<html><title>Proxy Error</title><body bgcolor=\"ffffff\">\r\n\
         {status}: {short_msg}\r\n\
         {short_msg}: {cause}\r\n"
    );
    let header = format!(
        "HTTP/1.0 {status} {short_msg}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );

    client
        .write_all(header.as_bytes())
        .await
        .map_err(ProxyError::ClientIo)?;
    client
        .write_all(body.as_bytes())
        .await
        .map_err(ProxyError::ClientIo)?;
    Ok(())
}
