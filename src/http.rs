// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP request reader and fixed response bodies.
//!
//! Mirrors the historic `httpclients.c` templates: the same four status
//! bodies, the same `Server:` signature line, the same bare-body
//! behaviour for HTTP/0.9-style requests.

use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;

/// Bound on the request line, generous compared to the historic 50-byte
/// buffer (open question in the distilled spec, resolved in favour of
/// an explicit `400` instead of silent truncation).
pub const MAX_REQUEST_LINE: usize = 8 * 1024;

pub const SERVER_NAME: &str = "mcastgw";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// Two-token request line: no version, no status line, no headers.
    Http09,
    /// Three-token request line: full status line + headers in the reply.
    Http1x,
}

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub url: String,
    pub version: HttpVersion,
}

#[derive(Debug)]
pub enum RequestError {
    /// The request line could not be read (EOF or I/O error).
    ReadFailed,
    /// Too few tokens, or the line exceeded `MAX_REQUEST_LINE`.
    BadRequest,
    Io(io::Error),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Io(e)
    }
}

/// Read one HTTP request line plus, for three-token requests, the
/// headers that follow (discarded, up to the blank line).
pub fn read_request(reader: &mut BufReader<TcpStream>) -> Result<RequestLine, RequestError> {
    let mut line = String::new();
    let n = read_bounded_line(reader, &mut line)?;
    if n == 0 {
        return Err(RequestError::ReadFailed);
    }

    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut tokens = trimmed.split_whitespace();
    let method = tokens.next().ok_or(RequestError::BadRequest)?.to_string();
    let url = tokens.next().ok_or(RequestError::BadRequest)?.to_string();
    let has_version = tokens.next().is_some();

    let version = if has_version {
        HttpVersion::Http1x
    } else {
        HttpVersion::Http09
    };

    if version == HttpVersion::Http1x {
        discard_headers(reader)?;
    }

    Ok(RequestLine { method, url, version })
}

/// Read a line bounded to `MAX_REQUEST_LINE` bytes. Returns `BadRequest`
/// if no `\n` is seen within the bound.
fn read_bounded_line(reader: &mut BufReader<TcpStream>, out: &mut String) -> Result<usize, RequestError> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_REQUEST_LINE {
            return Err(RequestError::BadRequest);
        }
        let read = reader.read(&mut byte)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(0);
            }
            break;
        }
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    *out = String::from_utf8_lossy(&buf).into_owned();
    Ok(buf.len())
}

fn discard_headers(reader: &mut BufReader<TcpStream>) -> Result<(), RequestError> {
    loop {
        let mut line = String::new();
        let n = read_bounded_line(reader, &mut line)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(())
}

/// Write the full buffer to `stream`, looping until every byte is
/// accepted by the OS. A broken pipe or any non-positive write is
/// reported as a failure rather than causing the process to die on
/// `SIGPIPE` (Rust ignores `SIGPIPE` by default, so this surfaces as an
/// ordinary `BrokenPipe` I/O error here).
pub fn write_all_to_client(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    stream.write_all(buf)
}

fn status_body(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\r\n\
         <html><head>\r\n\
         <title>{title}</title>\r\n\
         </head><body>\r\n\
         <h1>{title}</h1>\r\n\
         <p>{body}</p>\r\n\
         <hr>\r\n\
         <address>Server {SERVER_NAME} version {SERVER_VERSION}</address>\r\n\
         </body></html>\r\n",
    )
}

pub fn not_implemented_body() -> String {
    status_body("501 Method Not Implemented", "Sorry, only GET is supported.")
}

pub fn bad_request_body() -> String {
    status_body(
        "400 Bad Request",
        "Your browser sent a request that this server could not understand.",
    )
}

pub fn service_not_found_body() -> String {
    status_body("404 Service not found!", "Sorry, this service was not configured.")
}

pub fn service_unavailable_body() -> String {
    status_body(
        "503 Service Unavailable",
        "Sorry, there are too many connections at this time. Try again later.",
    )
}

/// Write a full HTTP/1.x status line + headers + body. No-op headers for
/// HTTP/0.9 callers; use [`write_body_only`] there instead.
pub fn write_status_response(
    stream: &mut TcpStream,
    status_line: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let mut head = String::new();
    head.push_str("HTTP/1.1 ");
    head.push_str(status_line);
    head.push_str("\r\n");
    head.push_str("Content-Type: ");
    head.push_str(content_type);
    head.push_str("\r\n");
    head.push_str(&format!("Server: {SERVER_NAME}/{SERVER_VERSION}\r\n"));
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)
}

/// Write the 200 OK response header that precedes the relayed stream.
pub fn write_ok_headers(stream: &mut TcpStream) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/octet-stream\r\n\
         Server: {SERVER_NAME}/{SERVER_VERSION}\r\n\
         \r\n"
    );
    stream.write_all(head.as_bytes())
}

pub fn into_buf_reader(stream: TcpStream) -> io::Result<BufReader<TcpStream>> {
    Ok(BufReader::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    // read_bounded_line/read_request need a real TcpStream in production
    // code (BufReader<TcpStream> is the concrete type used by the
    // session worker); exercise the pure string-handling logic here via
    // a small in-memory harness instead of a live socket.
    fn parse_request_line(raw: &str) -> Result<RequestLine, RequestError> {
        let trimmed = raw.trim_end_matches(['\r', '\n']);
        let mut tokens = trimmed.split_whitespace();
        let method = tokens.next().ok_or(RequestError::BadRequest)?.to_string();
        let url = tokens.next().ok_or(RequestError::BadRequest)?.to_string();
        let version = if tokens.next().is_some() {
            HttpVersion::Http1x
        } else {
            HttpVersion::Http09
        };
        Ok(RequestLine { method, url, version })
    }

    #[test]
    fn two_token_request_is_http09() {
        let req = parse_request_line("GET /ch5\r\n").unwrap();
        assert_eq!(req.version, HttpVersion::Http09);
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/ch5");
    }

    #[test]
    fn three_token_request_is_http1x() {
        let req = parse_request_line("GET /ch5 HTTP/1.1\r\n").unwrap();
        assert_eq!(req.version, HttpVersion::Http1x);
    }

    #[test]
    fn single_token_is_bad_request() {
        assert!(matches!(parse_request_line("GET\r\n"), Err(RequestError::BadRequest)));
    }

    #[test]
    fn status_bodies_contain_server_signature() {
        let body = not_implemented_body();
        assert!(body.contains(SERVER_NAME));
        assert!(body.contains("501"));
    }
}
