//! Client connection management for the game server
//!
//! This module tracks which network address occupies which player slot:
//! - Slot assignment on connect, always the lowest free slot
//! - Disconnection and timeout cleanup
//! - A generation counter per slot that moves on every occupant change
//!
//! Slots are reused, so a slot number alone does not identify a player.
//! Anything that refers to a player across ticks captures the slot's epoch
//! together with the slot and compares it before acting.

use log::info;
use shared::MAX_CLIENTS;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::epoch::SlotEpochs;

/// A connected client occupying one slot
#[derive(Debug)]
pub struct Client {
    /// Slot index, also used as the client id on the wire
    pub slot: usize,
    /// Network address for sending responses
    pub addr: SocketAddr,
    pub name: String,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
}

impl Client {
    pub fn new(slot: usize, addr: SocketAddr, name: String) -> Self {
        Self {
            slot,
            addr,
            name,
            last_seen: Instant::now(),
        }
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients and their slots
pub struct ClientManager {
    slots: Vec<Option<Client>>,
    epochs: SlotEpochs,
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// The capacity is clamped to `MAX_CLIENTS`.
    pub fn new(max_clients: usize) -> Self {
        let max_clients = max_clients.min(MAX_CLIENTS);
        Self {
            slots: (0..max_clients).map(|_| None).collect(),
            epochs: SlotEpochs::new(max_clients),
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns the assigned slot, or None if the server is full.
    pub fn add_client(&mut self, addr: SocketAddr, name: String) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.epochs.advance(slot);
        info!("Client {} ({}) connected from {}", slot, name, addr);
        self.slots[slot] = Some(Client::new(slot, addr, name));
        Some(slot)
    }

    /// Removes a client from the server
    ///
    /// Frees the slot and moves it to its next epoch, so effects still in
    /// flight for the old occupant are discarded.
    pub fn remove_client(&mut self, slot: usize) -> Option<Client> {
        let client = self.slots.get_mut(slot)?.take()?;
        self.epochs.advance(slot);
        info!("Client {} ({}) disconnected", slot, client.name);
        Some(client)
    }

    pub fn client(&self, slot: usize) -> Option<&Client> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn name(&self, slot: usize) -> Option<&str> {
        self.client(slot).map(|client| client.name.as_str())
    }

    pub fn slot_epoch(&self, slot: usize) -> Option<u64> {
        self.epochs.get(slot)
    }

    /// Finds a client slot by network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.clients()
            .find(|client| client.addr == addr)
            .map(|client| client.slot)
    }

    /// Marks a client as recently active
    pub fn touch(&mut self, slot: usize) {
        if let Some(Some(client)) = self.slots.get_mut(slot) {
            client.last_seen = Instant::now();
        }
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the freed slots so other systems can clean up.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<usize> {
        let timed_out: Vec<usize> = self
            .clients()
            .filter(|client| client.is_timed_out(timeout))
            .map(|client| client.slot)
            .collect();

        for slot in &timed_out {
            self.remove_client(*slot);
        }

        timed_out
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.slots.iter().flatten()
    }

    /// Gets all client slots and their network addresses
    pub fn get_client_addrs(&self) -> Vec<(usize, SocketAddr)> {
        self.clients()
            .map(|client| (client.slot, client.addr))
            .collect()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients().count()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
