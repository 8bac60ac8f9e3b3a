use std::ops::Deref;
use std::ops::DerefMut;

use bytes::BytesMut;
pub use http::*;
use io::Read;
use io::Write;
use std::io;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tungstenite::handshake::server::create_response;
use tungstenite::protocol::{Role, WebSocket};

#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    request_size_limit: Option<usize>,
}

impl HttpServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            request_size_limit: Some(4096),
        })
    }

    pub fn set_request_size_limit(&mut self, limit: Option<usize>) {
        self.request_size_limit = limit;
    }

    pub fn incoming(&self) -> Incoming {
        Incoming {
            listener: &self.listener,
            request_size_limit: self.request_size_limit,
            shutdown: None,
        }
    }

    /// Like [`HttpServer::incoming`], but stops accepting new connections
    /// once `shutdown` is set, for the graceful-drain ordering in §5
    /// ("stop accepting new HTTP" is the first step). Polls at a coarse
    /// interval rather than blocking indefinitely in `accept()`.
    pub fn incoming_until(&self, shutdown: Arc<AtomicBool>) -> std::io::Result<Incoming> {
        self.listener.set_nonblocking(true)?;
        Ok(Incoming {
            listener: &self.listener,
            request_size_limit: self.request_size_limit,
            shutdown: Some(shutdown),
        })
    }
}

#[derive(Debug)]
pub struct Incoming<'a> {
    listener: &'a TcpListener,
    request_size_limit: Option<usize>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<'a> Iterator for Incoming<'a> {
    type Item = std::result::Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(shutdown) = &self.shutdown else {
            return match self.listener.accept() {
                Ok((stream, remote_addr)) => Some(HttpRequest::from_stream(
                    stream,
                    remote_addr,
                    self.request_size_limit,
                )),
                Err(e) => Some(Err(Box::new(e))),
            };
        };

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.listener.accept() {
                Ok((stream, remote_addr)) => {
                    return Some(HttpRequest::from_stream(stream, remote_addr, self.request_size_limit))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => return Some(Err(Box::new(e))),
            }
        }
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    stream: TcpStream,
    remote_addr: SocketAddr,
    request: Request<Vec<u8>>,
}

impl HttpRequest {
    fn from_stream(
        mut stream: TcpStream,
        remote_addr: SocketAddr,
        request_size_limit: Option<usize>,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut buffer = BytesMut::new();
        let mut tmp = [0; 1024];

        loop {
            match stream.read(&mut tmp) {
                Ok(0) => {
                    return Err("Connection closed by client".into());
                }
                Ok(n) => {
                    buffer.extend_from_slice(&tmp[..n]);

                    if let Some(limit) = request_size_limit {
                        if buffer.len() > limit {
                            return Err("Request too large".into());
                        }
                    }

                    if let Some(header_end) = find_header_end(&buffer) {
                        let header_bytes = &buffer[..header_end];
                        let body_start = header_end + 4; // Skip \r\n\r\n

                        let request_line_end = header_bytes
                            .windows(2)
                            .position(|w| w == b"\r\n")
                            .ok_or("Invalid request line")?;

                        let request_line = std::str::from_utf8(&header_bytes[..request_line_end])?;
                        let mut parts = request_line.split_whitespace();
                        let method = parts.next().ok_or("Missing method")?;
                        let uri = parts.next().ok_or("Missing URI")?;
                        let version = parts.next().unwrap_or("HTTP/1.1");

                        let method = method.parse::<Method>()?;
                        let uri = uri.parse::<Uri>()?;
                        let version = match version {
                            "HTTP/1.0" => Version::HTTP_10,
                            "HTTP/1.1" => Version::HTTP_11,
                            _ => return Err("Unsupported HTTP version".into()),
                        };

                        let mut request_builder =
                            Request::builder().method(method).uri(uri).version(version);

                        let headers_start = request_line_end + 2;
                        let headers_bytes = &header_bytes[headers_start..];

                        for header_line in headers_bytes.split(|&b| b == b'\n') {
                            if header_line.is_empty() || header_line == b"\r" {
                                continue;
                            }

                            let header_line = if header_line.ends_with(b"\r") {
                                &header_line[..header_line.len() - 1]
                            } else {
                                header_line
                            };

                            if let Some(colon_pos) = header_line.iter().position(|&b| b == b':') {
                                let name = std::str::from_utf8(&header_line[..colon_pos])?.trim();
                                let value =
                                    std::str::from_utf8(&header_line[colon_pos + 1..])?.trim();
                                request_builder = request_builder.header(name, value);
                            }
                        }

                        let content_length = request_builder
                            .headers_ref()
                            .and_then(|h| h.get("content-length"))
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<usize>().ok());

                        let mut body = Vec::new();
                        if let Some(content_length) = content_length {
                            if content_length > 0 {
                                let mut bytes_read = 0;
                                if body_start < buffer.len() {
                                    let available =
                                        std::cmp::min(content_length, buffer.len() - body_start);
                                    body.extend_from_slice(
                                        &buffer[body_start..body_start + available],
                                    );
                                    bytes_read = available;
                                }

                                while bytes_read < content_length {
                                    let remaining = content_length - bytes_read;
                                    let to_read = std::cmp::min(remaining, tmp.len());
                                    match stream.read(&mut tmp[..to_read]) {
                                        Ok(0) => break,
                                        Ok(n) => {
                                            body.extend_from_slice(&tmp[..n]);
                                            bytes_read += n;
                                        }
                                        Err(e) => return Err(Box::new(e)),
                                    }
                                }
                            }
                        }

                        let request = request_builder.body(body)?;

                        return Ok(HttpRequest {
                            stream,
                            remote_addr,
                            request,
                        });
                    }
                }
                Err(e) => return Err(Box::new(e)),
            }
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn respond<T: AsRef<[u8]>>(
        &mut self,
        response: T,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stream.write_all(response.as_ref())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Writes the SSE response preamble (§4.5): event-stream content type,
    /// no caching, connection kept open. Callers then repeatedly call
    /// [`Self::write_sse_event`] as events arrive.
    pub fn respond_sse_headers(&mut self) -> io::Result<()> {
        self.stream.write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/event-stream\r\n\
              Cache-Control: no-cache\r\n\
              Connection: keep-alive\r\n\
              Access-Control-Allow-Origin: *\r\n\
              \r\n",
        )?;
        self.stream.flush()
    }

    /// Writes one `data: <payload>\n\n` frame (or `:heartbeat\n\n` when
    /// `payload` is `None`). Returns `Err` once the client has disconnected,
    /// at which point the caller should stop tailing.
    pub fn write_sse_event(&mut self, payload: Option<&str>) -> io::Result<()> {
        match payload {
            Some(data) => {
                for line in data.lines() {
                    write!(self.stream, "data: {line}\n")?;
                }
                self.stream.write_all(b"\n")?;
            }
            None => {
                self.stream.write_all(b": heartbeat\n\n")?;
            }
        }
        self.stream.flush()
    }

    /// Writes a response status line and header set, then streams `body`
    /// through to the client chunk by chunk rather than buffering it whole
    /// first. Used by the HQ proxy (§4.7) to relay a remote's SSE/binary
    /// response without re-framing it.
    pub fn respond_streaming(
        &mut self,
        status: StatusCode,
        headers: &[(String, String)],
        body: &mut impl Read,
    ) -> io::Result<()> {
        write!(
            self.stream,
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )?;
        for (name, value) in headers {
            write!(self.stream, "{name}: {value}\r\n")?;
        }
        self.stream.write_all(b"\r\n")?;
        self.stream.flush()?;

        let mut buf = [0u8; 8192];
        loop {
            match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.stream.write_all(&buf[..n])?;
                    self.stream.flush()?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Completes the WebSocket upgrade handshake (§4.6 `/buffers`) using the
    /// request this hand-rolled parser already read, then hands back the raw
    /// socket wrapped as a [`WebSocket`] — no second read of the handshake
    /// bytes off the wire.
    pub fn upgrade_to_websocket(
        mut self,
    ) -> std::result::Result<WebSocket<TcpStream>, Box<dyn std::error::Error + Send + Sync>> {
        let response = create_response(&self.request)
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { format!("{e:?}").into() })?;
        write_response_head(&mut self.stream, &response)?;
        Ok(WebSocket::from_raw_socket(self.stream, Role::Server, None))
    }
}

fn write_response_head<T>(
    stream: &mut TcpStream,
    response: &Response<T>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    write!(
        stream,
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    )?;
    for (name, value) in response.headers() {
        write!(stream, "{}: {}\r\n", name, value.to_str()?)?;
    }
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

impl Deref for HttpRequest {
    type Target = Request<Vec<u8>>;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

impl DerefMut for HttpRequest {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.request
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}
