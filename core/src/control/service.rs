//! TCP control service: accepts one framed command per connection
//!
//! The service runs on its own worker thread. Operations serialize
//! naturally because accepting is single-threaded and every command holds
//! the daemon lock for its whole duration.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::*;
use socket2::{Domain, Protocol, Socket, Type};

use super::context::{CommandContext, StreamSink};
use super::executor::{self, CommandOutcome};
use super::framing::{self, FramingError};
use super::locale::LocalizationKey;
use super::proto::{PbCommand, PbErrorCode};
use crate::daemon::{Daemon, SharedLocalizer};
use crate::run;

pub struct ControlService {
    listener: TcpListener,
    locale: String,
}

impl ControlService {
    /// Binds the listening socket. Address reuse is enabled so a restarted
    /// daemon can rebind immediately.
    pub fn bind(port: u16, locale: &str) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        let address: std::net::SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        socket
            .bind(&address.into())
            .with_context(|| format!("Port {} is in use, is the daemon already running?", port))?;
        socket.listen(1)?;

        Ok(Self {
            listener: socket.into(),
            locale: locale.to_string(),
        })
    }

    /// Starts the accept loop on a worker thread
    pub fn spawn(
        self,
        daemon: Arc<Mutex<Daemon>>,
        localizer: SharedLocalizer,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            info!("Control service listening on port {}", port_of(&self.listener));

            loop {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        if let Err(e) =
                            self.handle_connection(stream, &daemon, &localizer)
                        {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => {
                        error!("accept() failed: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
    }

    fn handle_connection(
        &self,
        stream: TcpStream,
        daemon: &Arc<Mutex<Daemon>>,
        localizer: &SharedLocalizer,
    ) -> Result<(), FramingError> {
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        let mut reader = BufReader::new(stream.try_clone()?);

        framing::read_magic(&mut reader)?;
        let command: PbCommand = framing::read_message(&mut reader)?;

        let locale = {
            let requested = command.param("locale");
            if requested.is_empty() {
                self.locale.clone()
            } else {
                requested
            }
        };

        let mut sink = StreamSink::new(stream);
        let mut context = CommandContext::new(&mut sink, localizer.clone(), &locale);

        // Mutations must be visible to the bus thread before the client is
        // acknowledged, so the whole command runs under the daemon lock
        let mut daemon = daemon.lock().unwrap();

        if let Some(token) = &daemon.access_token {
            if command.param("token") != *token {
                context.return_localized_error_with_code(
                    LocalizationKey::ErrorAuthentication,
                    PbErrorCode::Unauthorized,
                    &[],
                );
                return Ok(());
            }
        }

        match executor::process_command(&mut daemon, &mut context, &command) {
            CommandOutcome::Completed(_) => {}
            CommandOutcome::Shutdown(mode) => run::execute_shutdown(&mut daemon, mode),
        }

        Ok(())
    }
}

fn port_of(listener: &TcpListener) -> u16 {
    listener.local_addr().map(|a| a.port()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::locale::Localizer;
    use crate::control::proto::{PbOperation, PbResult, PbResultPayload};
    use std::io::Write;

    fn start_service(daemon: Daemon) -> (std::net::SocketAddr, Arc<Mutex<Daemon>>) {
        let service = ControlService::bind(0, "en").unwrap();
        let address = service.listener.local_addr().unwrap();
        let daemon = Arc::new(Mutex::new(daemon));
        service.spawn(daemon.clone(), Arc::new(Localizer::new()));
        (address, daemon)
    }

    fn send_command(
        address: std::net::SocketAddr,
        command: &PbCommand,
    ) -> Result<PbResult, FramingError> {
        let stream = TcpStream::connect(address)?;
        let mut writer = stream.try_clone()?;
        framing::write_magic(&mut writer)?;
        framing::write_message(&mut writer, command)?;

        let mut reader = BufReader::new(stream);
        framing::read_message(&mut reader)
    }

    #[test]
    fn server_info_over_the_wire() {
        let (address, _daemon) = start_service(Daemon::new());

        let result = send_command(address, &PbCommand::new(PbOperation::ServerInfo)).unwrap();
        assert!(result.status);
        match result.payload {
            Some(PbResultPayload::ServerInfo(info)) => {
                assert!(info.version_info.is_some());
            }
            _ => panic!("expected server info"),
        }
    }

    #[test]
    fn invalid_magic_closes_connection() {
        let (address, _daemon) = start_service(Daemon::new());

        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"RASCS\x00").unwrap();
        stream.flush().unwrap();

        // The server closes without replying
        let mut reader = BufReader::new(stream);
        let result: Result<PbResult, _> = framing::read_message(&mut reader);
        assert!(result.is_err());
    }

    #[test]
    fn wrong_token_is_unauthorized() {
        let mut daemon = Daemon::new();
        daemon.access_token = Some("secret".to_string());
        let (address, _daemon) = start_service(daemon);

        let result = send_command(address, &PbCommand::new(PbOperation::VersionInfo)).unwrap();
        assert!(!result.status);
        assert_eq!(result.error_code, PbErrorCode::Unauthorized as i32);

        let mut command = PbCommand::new(PbOperation::VersionInfo);
        command
            .params
            .insert("token".to_string(), "secret".to_string());
        let result = send_command(address, &command).unwrap();
        assert!(result.status);
    }
}
