//! UDP front end for the server session.
//!
//! A spawned receiver task forwards raw datagrams into an unbounded channel;
//! the main loop drains that channel completely at the top of every tick,
//! then runs session upkeep, writes one update packet per client and flushes
//! the outbox. One slow socket write logs an error instead of stalling the
//! round.

use crate::session::{ServerConfig, Session};
use crate::tasks::{Directory, NullDirectory};
use log::{debug, error, info};
use shared::packets::UPDATE_INTERVAL_MS;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Ticks longer than this are clamped so timers stay stable after a stall.
const MAX_TICK_SECONDS: f32 = 0.5;

/// Public-listing refresh cadence, in ticks.
const DIRECTORY_REFRESH_TICKS: u32 = 40;

pub struct Server {
    socket: Arc<UdpSocket>,
    session: Session,
    directory: Box<dyn Directory + Send>,
    inbound_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    inbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
}

impl Server {
    /// Binds the UDP socket. A bind failure is fatal; everything after this
    /// point keeps the server running.
    pub async fn new(host: &str, config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let addr = format!("{}:{}", host, config.port);
        let socket = Arc::new(UdpSocket::bind(&addr).await?);
        info!("Server '{}' listening on {}", config.name, addr);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Server {
            socket,
            session: Session::new(config),
            directory: Box::new(NullDirectory),
            inbound_tx,
            inbound_rx,
        })
    }

    /// Replaces the public-listing backend; private servers keep the null
    /// one.
    pub fn set_directory(&mut self, directory: Box<dyn Directory + Send>) {
        self.directory = directory;
    }

    /// Spawns the task that moves datagrams from the socket into the
    /// channel drained by the main loop.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let inbound_tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if inbound_tx.send((addr, buffer[..len].to_vec())).is_err() {
                            // main loop is gone
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Main update loop. Never returns under normal operation.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.directory
            .register(&self.session.config.name, self.session.config.port);

        let mut tick_interval = interval(Duration::from_millis(UPDATE_INTERVAL_MS));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();
        let mut ticks: u32 = 0;
        info!("Server started successfully");

        loop {
            tick_interval.tick().await;
            let now = Instant::now();
            let dt = now
                .saturating_duration_since(last_tick)
                .as_secs_f32()
                .min(MAX_TICK_SECONDS);
            last_tick = now;

            // inbound is always drained fully before anything is written
            while let Ok((addr, data)) = self.inbound_rx.try_recv() {
                self.session.handle_packet(addr, &data, now);
            }

            self.session.tick(now, dt);
            self.session.write_clients(now);

            ticks = ticks.wrapping_add(1);
            if ticks % DIRECTORY_REFRESH_TICKS == 0 {
                self.directory.refresh(
                    self.session.clients.len(),
                    self.session.lifecycle.state != crate::lifecycle::RoundState::Lobby,
                );
            }

            for (addr, bytes) in self.session.take_outbox() {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    debug!("Failed to send {} bytes to {}: {}", bytes.len(), addr, e);
                }
            }
        }
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            banlist_path: PathBuf::from("/nonexistent/banlist.json"),
            permissions_path: PathBuf::from("/nonexistent/permissions.json"),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = Server::new("127.0.0.1", test_config()).await;
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Server::new("127.0.0.1", test_config()).await.unwrap();
        let port = first.socket.local_addr().unwrap().port();

        let mut config = test_config();
        config.port = port;
        assert!(Server::new("127.0.0.1", config).await.is_err());
    }
}
