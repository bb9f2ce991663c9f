//! SMTP server implementation

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::config::SmtpConfig;
use crate::smtp::connection;
use crate::smtp::error::SmtpError;
use crate::smtp::shutdown::Shutdown;
use crate::smtp::store::{MessageSink, RecipientValidator};

/// Accepts connections and runs every session on its own thread
#[derive(Clone)]
pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    validator: Arc<dyn RecipientValidator>,
    sink: Arc<dyn MessageSink>,
    shutdown: Shutdown,
}

impl SmtpServer {
    /// Create a new SMTP server with default settings
    pub fn new(
        hostname: &str,
        validator: Arc<dyn RecipientValidator>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self::with_config(SmtpConfig::new(hostname), validator, sink)
    }

    pub fn with_config(
        config: SmtpConfig,
        validator: Arc<dyn RecipientValidator>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            validator,
            sink,
            shutdown: Shutdown::new(),
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Handle that stops this server from any thread
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Start the server on the specified address (blocking)
    pub fn start(&self, addr: &str) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(addr)?;
        self.start_with_listener(listener)
    }

    /// Start the server with an existing listener (blocking).
    ///
    /// Returns once the shutdown handle is triggered. Sessions still running at that point
    /// are aborted but not waited for.
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), SmtpError> {
        let local_addr = listener.local_addr()?;
        self.shutdown.set_listener_addr(local_addr);
        info!(addr = %local_addr, hostname = %self.config.hostname, "SMTP server listening");

        for stream in listener.incoming() {
            if self.shutdown.is_triggered() {
                break;
            }

            match stream {
                Ok(stream) => {
                    if let Err(e) = self.spawn_session(stream) {
                        error!(error = %e, "could not start session");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                }
            }
        }

        info!(addr = %local_addr, "SMTP server stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream) -> Result<(), SmtpError> {
        let peer = stream.peer_addr()?;
        stream.set_read_timeout(self.config.read_timeout)?;
        let registration = self.shutdown.register(&stream)?;
        let server = self.clone();

        thread::Builder::new()
            .name(format!("smtp-{peer}"))
            .spawn(move || {
                let _registration = registration;
                server.handle_client(stream, peer);
            })?;

        Ok(())
    }

    /// Handle a client connection
    fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "connection opened");

        let handler =
            SmtpCommandHandler::new(&self.config, self.validator.as_ref(), self.sink.as_ref());

        match connection::handle(&mut stream, &handler, &self.shutdown) {
            Ok(reason) => info!(%peer, ?reason, "connection closed"),
            Err(e) => warn!(%peer, error = %e, "connection aborted"),
        }

        if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
            debug!(%peer, error = %e, "socket already closed");
        }
    }
}
