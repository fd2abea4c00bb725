//! TCP server for pin control connections.
//!
//! Accepts connections, reads request lines, and executes them against the
//! shared pin-control backend. Each connection runs in its own task and owns
//! its socket until the task ends.

use crate::config::Config;
use crate::gpio::{Direction, Gpio, Level, Pull};
use crate::protocol::{Command, Operation, Parser, Response};
use crate::reader::{LineReader, ReadCause, ReadError};
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Pending connection queue length
const LISTEN_BACKLOG: i32 = 1024;

/// Delay before accepting again after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that end a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[from] ReadError),

    #[error("write failed: {0}")]
    Write(#[from] io::Error),
}

/// Server instance
pub struct Server {
    config: Config,
    gpio: Arc<dyn Gpio>,
    parser: Parser,
}

impl Server {
    /// Create a new server instance around an opened backend
    pub fn new(config: Config, gpio: Arc<dyn Gpio>) -> Self {
        let parser = Parser::new(config.pin_overflow);

        Server {
            config,
            gpio,
            parser,
        }
    }

    /// Bind the listener and serve until a shutdown signal arrives
    pub async fn run(&self) -> io::Result<()> {
        let listener = bind(&self.config.listen).await?;
        info!(address = %listener.local_addr()?, backend = self.gpio.name(), "Listening");

        self.serve(listener, shutdown_signal()).await
    }

    /// Accept connections on `listener` until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    fn spawn_connection<S>(&self, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let gpio = Arc::clone(&self.gpio);
        let parser = self.parser;

        tokio::spawn(
            async move {
                info!("Connection");
                match handle_connection(stream, &*gpio, parser).await {
                    Ok(()) => debug!("Connection finished"),
                    Err(e) => debug!(error = %e, "Connection error"),
                }
            }
            .instrument(info_span!("conn", peer = %addr)),
        );
    }
}

/// Resolve `listen` and bind a reusable listening socket
pub async fn bind(listen: &str) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(listen).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{}'", listen),
        )
    })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Complete on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Handle a single client connection.
///
/// Loops reading a line, answering it, and reading the next one. Parse
/// errors, unknown commands and overlong lines are answered inline and the
/// loop continues. The loop ends on `close`, on end of stream, or on an I/O
/// error. The stream is dropped (closed) when this returns.
pub async fn handle_connection<S>(
    stream: S,
    gpio: &dyn Gpio,
    parser: Parser,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = LineReader::new(stream);
    let mut out = BytesMut::with_capacity(64);

    loop {
        let line = match reader.next_line().await {
            Ok(line) => line,
            Err(e) => {
                if !e.partial.is_empty() {
                    debug!(partial = %e.partial, "Discarding unterminated line");
                }

                out.clear();
                Response::Error(e.to_string()).encode(&mut out);

                if !e.is_fatal() {
                    warn!(error = %e, "Dropping line");
                    send(reader.get_mut(), &out).await?;
                    continue;
                }

                // Best effort: the peer may already be gone.
                let _ = send(reader.get_mut(), &out).await;

                if matches!(e.cause, ReadCause::Eof) {
                    trace!("Connection closed by client");
                    return Ok(());
                }
                return Err(e.into());
            }
        };

        trace!(%line, "Processing line");
        out.clear();

        match parser.parse(&line) {
            Ok(Command::Close) => {
                debug!("Close");
                Response::Bye.encode(&mut out);
                send(reader.get_mut(), &out).await?;
                return Ok(());
            }

            Ok(Command::Pin { name, pin }) => execute_command(gpio, &name, pin).encode(&mut out),

            Err(e) => {
                warn!(error = %e, "Parse error");
                Response::Error(e.to_string()).encode(&mut out);
            }
        }

        send(reader.get_mut(), &out).await?;
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}

/// Execute a named pin operation against the backend
pub fn execute_command(gpio: &dyn Gpio, name: &str, pin: u8) -> Response {
    let Some(op) = Operation::from_name(name) else {
        return Response::UnknownCommand(name.to_string());
    };

    trace!(?op, pin, "Executing");

    match op {
        Operation::Input => gpio.set_direction(pin, Direction::Input),
        Operation::Output => gpio.set_direction(pin, Direction::Output),
        Operation::PullUp => gpio.set_pull(pin, Pull::Up),
        Operation::PullDown => gpio.set_pull(pin, Pull::Down),
        Operation::PullOff => gpio.set_pull(pin, Pull::Off),
        Operation::High => gpio.write(pin, Level::High),
        Operation::Low => gpio.write(pin, Level::Low),
        Operation::Toggle => gpio.toggle(pin),
        Operation::Read => return Response::Level(gpio.read(pin)),
    }

    Response::Ok
}
