//! One accepted connection: socket, receive log, HTTP state, response
//! buffer.

use std::{io, net::SocketAddr};

use hearth_buffer::{Fill, RecvLog};
use mio::net::TcpStream;
use tracing::trace;

use crate::{
    context::AppContext,
    http::{HttpConn, Parse},
};

/// Most bytes pulled off a connection in one pass of the event loop.
pub const MAX_READ_SIZE: usize = 4096;

/// What the connection needs next after feeding the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Request still incomplete; keep watching for reads.
    ReadMore,
    /// A response is staged; watch for writability.
    Respond,
}

/// Outcome of a write pass.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The socket filled up mid-response; re-arm for writability.
    Incomplete,
    /// Response fully sent and the connection stays open for the next
    /// request.
    KeepAlive,
    /// Response fully sent; close the connection.
    Close,
}

pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    log: RecvLog,
    http: HttpConn,
    response: Vec<u8>,
    response_sent: usize,
}

impl Client {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            log: RecvLog::new(),
            http: HttpConn::new(),
            response: Vec::new(),
            response_sent: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Total bytes this connection has sent us.
    pub fn received(&self) -> usize {
        self.log.len()
    }

    pub fn log_text(&self) -> String {
        String::from_utf8_lossy(&self.log.copy_to_vec()).into_owned()
    }

    /// Drains the socket into the receive log, up to [`MAX_READ_SIZE`].
    pub fn receive(&mut self) -> io::Result<Fill> {
        self.log.fill_from(&mut self.stream, MAX_READ_SIZE)
    }

    /// Feeds the parser; on completion the response bytes are staged.
    pub fn advance(&mut self, ctx: &AppContext) -> Step {
        match self.http.parse(&mut self.log, ctx) {
            Parse::NotDone => Step::ReadMore,
            Parse::Done => {
                self.response.clear();
                self.response_sent = 0;
                self.http.render_response(&mut self.response);
                Step::Respond
            }
        }
    }

    /// Writes staged response bytes and then the requested file.
    pub fn send(&mut self) -> io::Result<SendOutcome> {
        use std::io::Write;

        while self.response_sent < self.response.len() {
            match self.stream.write(&self.response[self.response_sent..]) {
                Ok(0) => return Ok(SendOutcome::Close),
                Ok(n) => self.response_sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendOutcome::Incomplete);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if !self.http.suppresses_body() {
            match self.http.stream_file(&mut self.stream) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendOutcome::Incomplete);
                }
                Err(e) => return Err(e),
            }
        }

        if self.http.keep_alive() {
            trace!(peer = %self.peer, "response complete, keeping alive");
            self.http.reset();
            self.log.clear();
            Ok(SendOutcome::KeepAlive)
        } else {
            Ok(SendOutcome::Close)
        }
    }
}
