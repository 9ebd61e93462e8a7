//! Server network layer handling UDP communications and game loop coordination

use crate::commands::{self, Command};
use crate::config::ScoreConfig;
use crate::fallback::FallbackSink;
use crate::game::{GameContext, GameState};
use crate::rpc::DatabaseClient;
use crate::scheduler::{Scheduler, ShutdownReport};
use crate::score::RpcScore;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{sanitize_name, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Clients silent for longer than this are dropped
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Map votes pass once they have been open this long
const MAP_VOTE_DURATION_SECS: u64 = 25;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    CheckTimeouts,
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from game loop to network tasks
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        addrs: Vec<SocketAddr>,
    },
}

/// Main server coordinating networking, the race game and score reconciliation
pub struct Server {
    socket: Arc<UdpSocket>,
    game_state: GameState,
    scheduler: Scheduler<GameState>,
    score: RpcScore,
    tick_duration: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        max_clients: usize,
        config: ScoreConfig,
        db: DatabaseClient,
        fallback: Box<dyn FallbackSink>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        let tick_duration = Duration::from_secs_f64(1.0 / config.ticks_per_sec() as f64);
        let mut game_state = GameState::new(config.clone(), max_clients);
        let mut scheduler =
            Scheduler::new(fallback).with_process_deadline(config.process_deadline_ticks());
        let score = RpcScore::new(db, config, &mut game_state, &mut scheduler);

        Ok(Server {
            socket,
            game_state,
            scheduler,
            score,
            tick_duration,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
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

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, addrs } => {
                        for addr in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that periodically asks the main loop to drop silent clients
    async fn spawn_timeout_checker(&self) {
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                if let Err(e) = server_tx.send(ServerMessage::CheckTimeouts) {
                    error!("Failed to send timeout check: {}", e);
                    break;
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet) {
        let addrs = self
            .game_state
            .clients
            .get_client_addrs()
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();
        if let Err(e) = self.game_tx.send(GameMessage::BroadcastPacket { packet, addrs }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Processes incoming packets and updates game state
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Packet::Connect {
            client_version,
            name,
        } = packet
        {
            self.handle_connect(client_version, &name, addr);
            return;
        }

        let Some(slot) = self.game_state.clients.find_client_by_addr(addr) else {
            debug!("Packet from unknown address {}", addr);
            return;
        };
        self.game_state.clients.touch(slot);

        match packet {
            Packet::Chat { message } => self.handle_chat(slot, &message),

            Packet::RaceStart => {
                if !self.game_state.start_race(slot) {
                    self.game_state
                        .send_chat_target(slot, "You have to be in a team to start racing");
                }
            }

            Packet::Finish { checkpoints } => {
                if let Some(finish) = self.game_state.finish_race(slot, checkpoints) {
                    self.score
                        .on_finish(&mut self.game_state, &mut self.scheduler, &finish);
                }
            }

            Packet::Disconnect => {
                if let Some(name) = self.game_state.client_name(slot) {
                    self.game_state.remove_player(slot);
                    self.game_state
                        .send_chat_all(&format!("'{}' has left the game", name));
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    fn handle_connect(&mut self, client_version: u32, name: &str, addr: SocketAddr) {
        info!(
            "Client connecting from {} (version: {})",
            addr, client_version
        );

        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: format!("Protocol version {} required", PROTOCOL_VERSION),
                },
                addr,
            );
            return;
        }

        // Remove existing connection if present
        if let Some(existing) = self.game_state.clients.find_client_by_addr(addr) {
            info!("Removing existing client {} from {}", existing, addr);
            self.game_state.remove_player(existing);
        }

        let name = sanitize_name(name);
        match self.game_state.add_player(addr, name.clone()) {
            Some(slot) => {
                self.send_packet(
                    Packet::Connected {
                        client_id: slot as u32,
                    },
                    addr,
                );
                self.game_state
                    .send_chat_all(&format!("'{}' entered the game", name));
                self.score
                    .load_score(&mut self.game_state, &mut self.scheduler, slot);
                self.score
                    .check_birthday(&mut self.game_state, &mut self.scheduler, slot);
            }
            None => {
                self.send_packet(
                    Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                    addr,
                );
            }
        }
    }

    fn handle_chat(&mut self, slot: usize, message: &str) {
        match commands::parse(message) {
            None => {
                self.broadcast_packet(Packet::ChatLine {
                    from: Some(slot as u32),
                    text: message.to_string(),
                });
            }
            Some(Err(e)) => self.game_state.send_chat_target(slot, &e.to_string()),
            Some(Ok(command)) => self.run_command(slot, command),
        }
    }

    fn run_command(&mut self, slot: usize, command: Command) {
        let game = &mut self.game_state;
        let queues = &mut self.scheduler;
        let score = &self.score;

        match command {
            Command::Rank(player) => score.show_rank(game, queues, slot, player.as_deref()),
            Command::TeamRank(player) => {
                score.show_team_rank(game, queues, slot, player.as_deref())
            }
            Command::Times(player) => score.show_times(game, queues, slot, player.as_deref()),
            Command::Top5(offset) => score.show_top5(game, queues, slot, offset),
            Command::TeamTop5(offset) => score.show_team_top5(game, queues, slot, offset),
            Command::Points(player) => score.show_points(game, queues, slot, player.as_deref()),
            Command::TopPoints(offset) => score.show_top_points(game, queues, slot, offset),
            Command::MapInfo(map) => {
                let map = map.unwrap_or_else(|| score.config().map_name.clone());
                score.map_info(game, queues, slot, &map)
            }
            Command::Map(map) => score.map_vote(game, queues, slot, &map),
            Command::Random(stars) => score.random_map(game, queues, slot, stars),
            Command::RandomUnfinished(stars) => {
                score.random_unfinished_map(game, queues, slot, stars)
            }
            Command::Save(code) => score.save_team(game, queues, slot, &code),
            Command::Load(code) => score.load_team(game, queues, slot, &code),
            Command::Team(team) => {
                if let Err(message) = game.set_team(slot, team) {
                    game.send_chat_target(slot, &message);
                }
            }
            Command::Lock(locked) => match game.team_of(slot) {
                Some(team) if team > 0 => game.set_team_locked(team, locked),
                _ => game.send_chat_target(slot, "You have to be in a team to lock it"),
            },
        }
    }

    /// Sends every queued chat line and broadcast to its recipients
    fn deliver_outbox(&mut self) {
        for (addr, packet) in self.game_state.deliveries() {
            self.send_packet(packet, addr);
        }
    }

    /// Switches to a new map and session. Pending session calls are dropped
    /// and every connected player's score is requested again.
    pub fn change_map(&mut self, map: &str, server_type: &str) {
        let dropped = self.scheduler.begin_session();
        self.game_state.begin_session(map, server_type);
        self.score.set_map(map, server_type);
        info!("Changed map to {} ({} pending lookups dropped)", map, dropped);

        self.game_state
            .send_chat_all(&format!("Map changed to {}", map));
        self.score
            .load_best_time(&mut self.game_state, &mut self.scheduler);
        let slots: Vec<usize> = self.game_state.clients.clients().map(|c| c.slot).collect();
        for slot in slots {
            self.score
                .load_score(&mut self.game_state, &mut self.scheduler, slot);
        }
    }

    /// Advances the game by one tick and reconciles finished database calls
    fn tick(&mut self) {
        self.game_state.tick += 1;

        let vote_ticks = self.score.config().secs_to_ticks(MAP_VOTE_DURATION_SECS);
        if let Some(vote) = self.game_state.take_passed_vote(vote_ticks) {
            self.change_map(&vote.map, &vote.server_type);
        }

        let report = self.scheduler.on_tick(&mut self.game_state);
        self.deliver_outbox();

        // Periodic queue monitoring
        if self.game_state.tick % 60 == 0 {
            debug!(
                "Tick {}: {} clients, {} session / {} process calls pending",
                self.game_state.tick,
                self.game_state.clients.len(),
                report.session_pending,
                report.process_pending
            );
        }
    }

    /// Stops accepting work and writes unconfirmed durable calls to the fallback log
    pub fn shutdown(&mut self) -> ShutdownReport {
        let report = self.scheduler.on_shutdown();
        self.deliver_outbox();
        report
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        info!("Server started successfully");

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::CheckTimeouts) => {
                            for slot in self.game_state.check_timeouts(CLIENT_TIMEOUT) {
                                info!("Client {} timed out", slot);
                            }
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    self.tick();
                },

                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down gracefully");
                    break;
                }
            }
        }

        let report = self.shutdown();
        if report.lost > 0 {
            warn!("{} durable calls could not be recorded", report.lost);
        }

        Ok(())
    }
}
