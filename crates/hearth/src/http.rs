//! Per-connection HTTP/1.x request processor.
//!
//! A small state machine consumes the connection's receive log line by
//! line: the request line is validated by the compiled request-line
//! grammar (whose absolute-URI capture drives the file lookup), headers
//! are absorbed until the blank line, an optional body is skipped by
//! `Content-Length`, and the response is synthesized into a byte buffer
//! with the file streamed afterwards by the zero-copy primitive.

use std::{
    fs::File,
    io::{self, SeekFrom, Write},
    os::fd::AsRawFd,
};

use hearth_buffer::{GetLine, RecvLog};
use tracing::{debug, trace};

use crate::{context::AppContext, mime::Mime};

/// Largest URI the server accepts.
pub const MAX_URI_SIZE: usize = 256;
/// Request-line buffer: method, SP, URI, SP, version and slack.
pub const MAX_LINE: usize = 8 + MAX_URI_SIZE + 10;

// capture slots of the request-line grammar, in declaration order
pub const CAP_FRAGMENT: usize = 0;
pub const CAP_SCHEME: usize = 1;
pub const CAP_ABS_URI: usize = 2;
pub const CAP_REL_URI: usize = 3;
pub const CAP_AUTHORITY: usize = 4;
pub const CAP_QUERY: usize = 5;
pub const REQUEST_CAPTURES: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    /// First bytes are unique except for POST/PUT, so switch on those and
    /// confirm with a full compare.
    pub fn parse(word: &[u8]) -> Option<Self> {
        let method = match word.first()? {
            b'O' => Self::Options,
            b'G' => Self::Get,
            b'H' => Self::Head,
            b'P' => {
                if word.get(1) == Some(&b'O') {
                    Self::Post
                } else {
                    Self::Put
                }
            }
            b'D' => Self::Delete,
            b'T' => Self::Trace,
            b'C' => Self::Connect,
            _ => return None,
        };
        (word == method.as_str().as_bytes()).then_some(method)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    const fn has_request_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    V1_0,
    V1_1,
}

impl Version {
    /// Only the final character separates the two supported versions.
    pub fn parse(word: &[u8]) -> Option<Self> {
        if !word.starts_with(b"HTTP/1.") {
            return None;
        }
        match word.get(7)? {
            b'0' => Some(Self::V1_0),
            b'1' => Some(Self::V1_1),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    None = 0,
    Continue,
    SwitchingProtocols,
    Ok,
    Created,
    Accepted,
    NonAuthoritativeInformation,
    NoContent,
    ResetContent,
    PartialContent,
    MultipleChoices,
    MovedPermanently,
    Found,
    SeeOther,
    NotModified,
    UseProxy,
    TemporaryRedirect,
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    ProxyAuthenticationRequired,
    RequestTimeout,
    Conflict,
    Gone,
    LengthRequired,
    PreconditionFailed,
    RequestEntityTooLarge,
    RequestUriTooLarge,
    UnsupportedMediaType,
    RequestedRangeNotSatisfiable,
    ExpectationFailed,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    HttpVersionNotSupported,
}

static STATUS_LINES: [&str; 41] = [
    "000 None",
    "100 Continue",
    "101 Switching Protocols",
    "200 OK",
    "201 Created",
    "202 Accepted",
    "203 Non-Authoritative Information",
    "204 No Content",
    "205 Reset Content",
    "206 Partial Content",
    "300 Multiple Choices",
    "301 Moved Permanently",
    "302 Found",
    "303 See Other",
    "304 Not Modified",
    "305 Use Proxy",
    "307 Temporary Redirect",
    "400 Bad Request",
    "401 Unauthorized",
    "402 Payment Required",
    "403 Forbidden",
    "404 Not Found",
    "405 Method Not Allowed",
    "406 Not Acceptable",
    "407 Proxy Authentication Required",
    "408 Request Time-Out",
    "409 Conflict",
    "410 Gone",
    "411 Length Required",
    "412 Precondition Failed",
    "413 Request Entity Too Large",
    "414 Request-URI Too Large",
    "415 Unsupported Media Type",
    "416 Requested Range Not Satisfiable",
    "417 Expectation Failed",
    "500 Internal Server Error",
    "501 Not Implemented",
    "502 Bad Gateway",
    "503 Service Unavailable",
    "504 Gateway Time-Out",
    "505 HTTP Version Not Supported",
];

impl Status {
    pub fn line(self) -> &'static str {
        STATUS_LINES[self as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Request,
    Headers,
    Body,
    Response,
    SendingFile,
}

/// Outcome of [`HttpConn::parse`].
#[derive(Debug, PartialEq, Eq)]
pub enum Parse {
    /// The request is fully absorbed (or failed); respond now.
    Done,
    /// More bytes are needed.
    NotDone,
}

pub struct HttpConn {
    state: ParseState,
    method: Option<Method>,
    version: Option<Version>,
    status: Status,
    mime: Mime,
    keep_alive: bool,
    /// Request body bytes still to be consumed.
    content_length: u64,
    /// The requested resource, when the open succeeded.
    file: Option<File>,
    file_size: u64,
    /// File bytes already handed to the socket.
    sent: u64,
}

impl HttpConn {
    pub fn new() -> Self {
        Self {
            state: ParseState::Request,
            method: None,
            version: None,
            status: Status::None,
            mime: Mime::OctetStream,
            keep_alive: false,
            content_length: 0,
            file: None,
            file_size: 0,
            sent: 0,
        }
    }

    /// Back to a fresh request on the same connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn fail(&mut self, status: Status) {
        self.status = status;
        self.state = ParseState::Response;
        self.keep_alive = false;
        self.file = None;
        self.file_size = 0;
    }

    /// Absorbs whatever the receive log holds. `Done` means the state
    /// machine reached RESPONSE; `NotDone` means the request is still in
    /// flight and the caller should read more.
    pub fn parse(&mut self, log: &mut RecvLog, ctx: &AppContext) -> Parse {
        let mut buf = [0u8; MAX_LINE];
        loop {
            match self.state {
                ParseState::Request => match log.getline(&mut buf) {
                    GetLine::Line(n) => {
                        let line = trim_cr(&buf[..n]);
                        self.parse_request_line(line, ctx);
                        if self.state == ParseState::Response {
                            return Parse::Done;
                        }
                        self.state = ParseState::Headers;
                    }
                    GetLine::Partial(_) => {
                        // the request line outgrew any URI we accept
                        self.fail(Status::RequestUriTooLarge);
                        return Parse::Done;
                    }
                    GetLine::NoNewline => return Parse::NotDone,
                },
                ParseState::Headers => match log.getline(&mut buf) {
                    GetLine::Line(n) => {
                        let line = trim_cr(&buf[..n]);
                        if line.is_empty() {
                            let has_body = self
                                .method
                                .is_some_and(Method::has_request_body) &&
                                self.content_length > 0;
                            if has_body {
                                self.state = ParseState::Body;
                            } else {
                                self.status = Status::Ok;
                                self.state = ParseState::Response;
                                return Parse::Done;
                            }
                        } else {
                            self.absorb_header(line);
                        }
                    }
                    // an oversize header line is drained in chunks; nothing
                    // in it matters beyond the few fields absorbed below
                    GetLine::Partial(_) => {}
                    GetLine::NoNewline => return Parse::NotDone,
                },
                ParseState::Body => {
                    let take = (log.unread() as u64).min(self.content_length);
                    let _ = log.seek(SeekFrom::Current(take as i64));
                    self.content_length -= take;
                    if self.content_length > 0 {
                        return Parse::NotDone;
                    }
                    self.status = Status::Ok;
                    self.state = ParseState::Response;
                    return Parse::Done;
                }
                ParseState::Response | ParseState::SendingFile => return Parse::Done,
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8], ctx: &AppContext) {
        trace!(line = %String::from_utf8_lossy(line), "request line");

        let mut fields = line.splitn(3, |&b| b == b' ');
        let (Some(method), Some(_uri), Some(version)) =
            (fields.next(), fields.next(), fields.next())
        else {
            self.fail(Status::BadRequest);
            return;
        };

        let Some(method) = Method::parse(method) else {
            self.fail(Status::BadRequest);
            return;
        };
        self.method = Some(method);

        let Some(version) = Version::parse(version) else {
            self.fail(Status::BadRequest);
            return;
        };
        self.version = Some(version);
        // HTTP/1.1 defaults to persistent connections
        self.keep_alive = version == Version::V1_1;

        // method and version are already vetted, so a grammar refusal
        // indicts the URI
        let mut caps = [None; REQUEST_CAPTURES];
        if ctx.request_line.match_full(line, &mut caps).is_err() {
            self.fail(Status::NotFound);
            return;
        }
        let Some(span) = caps[CAP_ABS_URI] else {
            // nothing served without an absolute path
            self.fail(Status::NotFound);
            return;
        };
        let uri = span.slice(line);

        // extension drives the Content-Type header
        let ext = match uri.iter().position(|&b| b == b'.') {
            Some(dot) => &uri[dot + 1..],
            None => &[],
        };
        self.mime = ctx.mime.lookup(std::str::from_utf8(ext).unwrap_or(""));

        if uri.split(|&b| b == b'/').any(|seg| seg == b"..") {
            // no escaping the document root
            self.fail(Status::NotFound);
            return;
        }
        let rel = std::str::from_utf8(uri).unwrap_or("").trim_start_matches('/');
        let path = ctx.root.join(rel);
        let opened = File::open(&path).and_then(|f| f.metadata().map(|m| (f, m)));
        match opened {
            Ok((file, meta)) if meta.is_file() => {
                debug!(path = %path.display(), size = meta.len(), "serving file");
                self.file_size = meta.len();
                self.file = Some(file);
            }
            _ => {
                debug!(path = %path.display(), "no such file");
                self.fail(Status::NotFound);
            }
        }
    }

    fn absorb_header(&mut self, line: &[u8]) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return;
        };
        let name = line[..colon].trim_ascii();
        let value = line[colon + 1..].trim_ascii();
        if name.eq_ignore_ascii_case(b"Content-Length") {
            self.content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if name.eq_ignore_ascii_case(b"Connection") {
            self.keep_alive = value.eq_ignore_ascii_case(b"keep-alive");
        }
    }

    /// Synthesizes the status line, headers and blank line into `out` and
    /// moves the machine to SENDING_FILE.
    pub fn render_response(&mut self, out: &mut Vec<u8>) {
        let size = if self.file.is_some() { self.file_size } else { 0 };
        let _ = write!(
            out,
            "HTTP/1.1 {}\nContent-Length: {}\nContent-Type: {}\n\n",
            self.status.line(),
            size,
            self.mime.as_str(),
        );
        self.state = ParseState::SendingFile;
    }

    /// HEAD answers with headers only.
    pub fn suppresses_body(&self) -> bool {
        self.method == Some(Method::Head)
    }

    /// Streams the opened file to the socket from the transmitted-offset
    /// cursor until everything has been handed to the kernel; would-block
    /// surfaces as an error for the caller's re-arm logic.
    pub fn stream_file<S: Write + AsRawFd>(&mut self, sock: &mut S) -> io::Result<()> {
        let Some(file) = &self.file else { return Ok(()) };
        while self.sent < self.file_size {
            let remaining = (self.file_size - self.sent) as usize;
            let n = send_file(sock, file, &mut self.sent, remaining)?;
            if n == 0 {
                // the file shrank underneath us; nothing more to send
                break;
            }
        }
        Ok(())
    }
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Zero-copy file send on Linux; positional read + write elsewhere.
#[cfg(target_os = "linux")]
fn send_file<S: AsRawFd>(
    sock: &mut S,
    file: &File,
    offset: &mut u64,
    count: usize,
) -> io::Result<usize> {
    let mut off = *offset as libc::off_t;
    let n = unsafe { libc::sendfile(sock.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    *offset = off as u64;
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
fn send_file<S: Write + AsRawFd>(
    sock: &mut S,
    file: &File,
    offset: &mut u64,
    count: usize,
) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut buf = [0u8; 16 * 1024];
    let want = count.min(buf.len());
    let read = file.read_at(&mut buf[..want], *offset)?;
    if read == 0 {
        return Ok(0);
    }
    let written = sock.write(&buf[..read])?;
    *offset += written as u64;
    Ok(written)
}
