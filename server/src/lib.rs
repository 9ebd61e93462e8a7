//! # Race Server Library
//!
//! This library provides the authoritative race server together with the
//! machinery that connects it to a remote score database. Database calls
//! never block the game loop: each call is issued, handed a continuation,
//! and reconciled with the live game on a later tick.
//!
//! ## Core Responsibilities
//!
//! ### Deferred Score Effects
//! Score lookups and writes (ranks, top lists, finishes, team saves) are
//! sent to the database as soon as a player asks for them. Their answers
//! come back whenever the database is done, and are applied on the next
//! tick that observes them, exactly once.
//!
//! ### Staleness Detection
//! Player slots are reused, so a late answer may arrive after its player
//! left. Every continuation captures the epoch of the slot (or of the game
//! session) it targets and checks it before touching anything.
//!
//! ### Durable Writes
//! Finishes, team saves and savegame consumption must not be lost. If the
//! database fails them, or the server stops before they are confirmed, the
//! request is appended to a fallback log that can be replayed later.
//!
//! ## Module Organization
//!
//! ### RPC Module (`rpc`)
//! Typed database client, the one-shot [`rpc::RpcFuture`] handle and the
//! transports (TCP, offline, manual).
//!
//! ### Scheduler Module (`scheduler`)
//! Session and process queues of continuations and the per-tick sweep.
//!
//! ### Epoch Module (`epoch`)
//! Slot and session generation tokens.
//!
//! ### Fallback Module (`fallback`)
//! Append-only log of durable requests and its reader.
//!
//! ### Score Module (`score`)
//! One call site per database verb.
//!
//! ### Game Module (`game`)
//! Connected players, races, teams and the chat outbox.
//!
//! ### Network Module (`network`)
//! UDP packet handling and the main loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ScoreConfig;
//! use server::fallback::FallbackLog;
//! use server::network::Server;
//! use server::rpc::{DatabaseClient, TcpTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = DatabaseClient::new(Arc::new(TcpTransport::spawn("127.0.0.1:8304")));
//!     let fallback = FallbackLog::open("score_fallback.log")?;
//!
//!     let mut server = Server::new(
//!         "127.0.0.1:8303",
//!         64,
//!         ScoreConfig::default(),
//!         db,
//!         Box::new(fallback),
//!     )
//!     .await?;
//!
//!     // Runs until Ctrl+C, then records unconfirmed writes.
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod commands;
pub mod config;
pub mod epoch;
pub mod fallback;
pub mod game;
pub mod network;
pub mod rpc;
pub mod save;
pub mod scheduler;
pub mod score;
