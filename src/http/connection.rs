use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::engine::ContextManager;
use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;

/// Upper bound on buffered request bytes before the connection is dropped.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
    state: ConnectionState,
    manager: Arc<ContextManager>,
    secure: bool,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        manager: Arc<ContextManager>,
        secure: bool,
    ) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(4096),
            state: ConnectionState::Reading,
            manager,
            secure,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.read_request().await? {
                    Some(req) => self.state = ConnectionState::Processing(req),
                    None => self.state = ConnectionState::Closed,
                },

                ConnectionState::Processing(mut req) => {
                    req.secure = self.secure;
                    let keep_alive = req.keep_alive();
                    let response = self.dispatch(req).await;

                    let writer = ResponseWriter::new(&response);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading;
                    }
                }

                ConnectionState::Closed => break,
            }
        }

        Ok(())
    }

    /// Runs the request on a blocking worker; handlers are synchronous and may
    /// hold locks for as long as their `init` takes.
    async fn dispatch(&self, req: Request) -> Response {
        let manager = Arc::clone(&self.manager);
        let path = req.path.clone();

        match tokio::task::spawn_blocking(move || manager.service(req)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(peer = %self.peer, path = %path, error = %e, "Request worker failed");
                Response::error(StatusCode::InternalServerError, "request worker failed")
            }
        }
    }

    pub async fn read_request(&mut self) -> anyhow::Result<Option<Request>> {
        loop {
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(request));
                }

                Err(ParseError::Incomplete) => {
                    if self.buffer.len() > MAX_REQUEST_BYTES {
                        return Err(anyhow::anyhow!("request exceeds {MAX_REQUEST_BYTES} bytes"));
                    }
                }

                Err(e) => {
                    return Err(anyhow::anyhow!("HTTP parse error: {:?}", e));
                }
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;

            if n == 0 {
                // Client closed connection
                return Ok(None);
            }
        }
    }
}
