//! Integration tests for deferred score reconciliation
//!
//! These tests drive the real game state, scheduler and score call sites
//! against a hand-resolved database transport.

use server::config::ScoreConfig;
use server::fallback::{FallbackLog, FallbackReader, FallbackSink, MemoryFallback};
use server::game::{ChatTarget, GameContext, GameState, Outgoing};
use server::rpc::{DatabaseClient, ManualTransport, RpcError};
use server::scheduler::Scheduler;
use server::score::RpcScore;
use shared::rpc::{FinishChat, PlayerScore, Request, Response, Text};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

struct World {
    transport: Arc<ManualTransport>,
    game: GameState,
    scheduler: Scheduler<GameState>,
    score: RpcScore,
}

impl World {
    fn new(fallback: Box<dyn FallbackSink>) -> Self {
        Self::with_config(ScoreConfig::default(), fallback)
    }

    fn with_config(config: ScoreConfig, fallback: Box<dyn FallbackSink>) -> Self {
        let transport = Arc::new(ManualTransport::new());
        let mut game = GameState::new(config.clone(), 16);
        let mut scheduler =
            Scheduler::new(fallback).with_process_deadline(config.process_deadline_ticks());
        let score = RpcScore::new(
            DatabaseClient::new(transport.clone()),
            config,
            &mut game,
            &mut scheduler,
        );
        // Settle the map record lookup issued at startup.
        transport.resolve_all(|_| Err(RpcError::NotFound));
        let mut world = Self {
            transport,
            game,
            scheduler,
            score,
        };
        world.tick();
        world
    }

    fn join(&mut self, name: &str, port: u16) -> usize {
        self.game
            .add_player(SocketAddr::from(([127, 0, 0, 1], port)), name.to_string())
            .expect("server full")
    }

    fn tick(&mut self) {
        self.game.tick += 1;
        self.scheduler.on_tick(&mut self.game);
    }

    fn last_call(&self) -> u64 {
        *self.transport.pending_ids().last().expect("no pending call")
    }

    fn chat_to(&self, slot: usize) -> Vec<String> {
        self.game
            .outbox()
            .iter()
            .filter_map(|line| match line {
                Outgoing::Chat {
                    target: ChatTarget::Client(to),
                    text,
                } if *to == slot => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

fn score_response(time: f32) -> Response {
    Response::PlayerScore(PlayerScore {
        time,
        checkpoints: Vec::new(),
    })
}

/// DEFERRED APPLICATION TESTS
mod reconciliation_tests {
    use super::*;

    /// A result is applied once, on the first tick that observes it
    #[test]
    fn applied_exactly_once_after_resolution() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        let slot = world.join("nameless", 1000);
        world.score.load_score(&mut world.game, &mut world.scheduler, slot);
        let id = world.last_call();

        for _ in 0..3 {
            world.tick();
            assert!(world.game.player(slot).unwrap().best_time.is_none());
        }

        world.transport.resolve(id, Ok(score_response(30.0)));
        world.tick();
        assert_eq!(world.game.player(slot).unwrap().best_time, Some(30.0));
        assert_eq!(world.scheduler.session_len(), 0);

        // Later ticks leave the applied value alone.
        world.game.set_player_score(slot, &PlayerScore { time: 99.0, checkpoints: vec![] }, false);
        world.tick();
        world.tick();
        assert_eq!(world.game.player(slot).unwrap().best_time, Some(99.0));
        assert_eq!(world.scheduler.totals().applied, 1);
    }

    /// Lookups issued in the same tick both land and leave nothing queued
    #[test]
    fn two_lookups_same_tick() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        let a = world.join("a", 1000);
        let b = world.join("b", 1001);
        world.score.load_score(&mut world.game, &mut world.scheduler, a);
        world.score.load_score(&mut world.game, &mut world.scheduler, b);

        world.transport.resolve_all(|request| match request {
            Request::PlayerScore(lookup) if lookup.player_name == "a" => Ok(score_response(10.0)),
            _ => Ok(score_response(20.0)),
        });
        world.tick();

        assert_eq!(world.game.player(a).unwrap().best_time, Some(10.0));
        assert_eq!(world.game.player(b).unwrap().best_time, Some(20.0));
        assert_eq!(world.scheduler.session_len(), 0);
        assert_eq!(world.scheduler.process_len(), 0);
    }

    /// Not-found answers take the absence branch and never reach the log
    #[test]
    fn not_found_uses_absence_branch() {
        let fallback = MemoryFallback::new();
        let mut world = World::new(Box::new(fallback.clone()));
        let slot = world.join("a", 1000);
        world.score.load_team(&mut world.game, &mut world.scheduler, slot, "nope");

        world.transport.resolve(world.last_call(), Err(RpcError::NotFound));
        world.tick();

        assert_eq!(world.chat_to(slot), vec!["No such savegame for this map"]);
        assert!(fallback.is_empty());
        assert_eq!(world.scheduler.totals().failed, 0);
    }

    /// Answers that arrive out of order are each applied to their own addressee
    #[test]
    fn out_of_order_resolution() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        let slot = world.join("a", 1000);
        world.score.show_times(&mut world.game, &mut world.scheduler, slot, None);
        let first = world.last_call();
        world.score.show_points(&mut world.game, &mut world.scheduler, slot, None);
        let second = world.last_call();

        world.transport.resolve(second, Ok(Response::Text(Text { text: "points".into() })));
        world.tick();
        world.transport.resolve(first, Ok(Response::Text(Text { text: "times".into() })));
        world.tick();

        assert_eq!(world.chat_to(slot), vec!["points", "times"]);
    }
}

/// STALENESS TESTS
mod staleness_tests {
    use super::*;

    /// A lookup for a player who left must not touch the next occupant of the slot
    #[test]
    fn slot_reuse_suppresses_effect() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        let slot = world.join("old", 1000);
        world.score.load_score(&mut world.game, &mut world.scheduler, slot);
        let id = world.last_call();

        world.game.remove_player(slot);
        let reused = world.join("new", 1001);
        assert_eq!(reused, slot);

        world.transport.resolve(id, Ok(score_response(12.0)));
        world.tick();

        assert!(world.game.player(reused).unwrap().best_time.is_none());
        assert_eq!(world.scheduler.session_len(), 0);
        assert_eq!(world.scheduler.totals().stale, 1);
    }

    /// Finish chat reaches only the members still connected
    #[test]
    fn finish_chat_filters_departed_members() {
        let fallback = MemoryFallback::new();
        let mut world = World::new(Box::new(fallback.clone()));
        let a = world.join("a", 1000);
        let b = world.join("b", 1001);
        world.game.set_team(a, 1).unwrap();
        world.game.set_team(b, 1).unwrap();
        world.game.start_race(a);
        world.game.start_race(b);
        world.game.tick += 500;

        let finish = world.game.finish_race(a, vec![1.0]).unwrap();
        world.score.on_finish(&mut world.game, &mut world.scheduler, &finish);
        let id = world.last_call();

        world.game.remove_player(b);
        let mut chat_id = BTreeMap::new();
        chat_id.insert(a as u32, "new record for a".to_string());
        chat_id.insert(b as u32, "new record for b".to_string());
        world.transport.resolve(
            id,
            Ok(Response::FinishChat(FinishChat {
                chat_all: "Team finished".to_string(),
                chat_id,
            })),
        );
        world.tick();

        assert_eq!(world.chat_to(a), vec!["new record for a"]);
        assert!(world.chat_to(b).is_empty());
        assert!(world
            .game
            .outbox()
            .contains(&Outgoing::Chat {
                target: ChatTarget::All,
                text: "Team finished".to_string()
            }));
        assert!(fallback.is_empty());
    }

    /// Session-bound effects die with the session
    #[test]
    fn new_session_invalidates_best_time() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        world.score.load_best_time(&mut world.game, &mut world.scheduler);
        let id = world.last_call();

        world.game.begin_session("Tutorial", "Novice");
        world.transport.resolve(
            id,
            Ok(Response::Time(shared::rpc::Time { time: 5.0 })),
        );
        world.tick();

        assert_eq!(world.game.current_record(), None);
    }
}

/// DURABLE FALLBACK TESTS
mod durability_tests {
    use super::*;

    fn racing_team(world: &mut World) -> (usize, usize) {
        let a = world.join("a", 1000);
        let b = world.join("b", 1001);
        world.game.set_team(a, 7).unwrap();
        world.game.set_team(b, 7).unwrap();
        world.game.start_race(a);
        world.game.start_race(b);
        world.game.tick += 100;
        (a, b)
    }

    /// A failed team save is recorded with its original payload
    #[test]
    fn failed_team_save_is_recorded() {
        let fallback = MemoryFallback::new();
        let mut world = World::new(Box::new(fallback.clone()));
        let (a, b) = racing_team(&mut world);

        world.score.save_team(&mut world.game, &mut world.scheduler, a, "castle");
        let id = world.last_call();
        let issued = world.transport.request(id).unwrap();
        assert!(!world.game.player(b).unwrap().is_racing());

        world
            .transport
            .resolve(id, Err(RpcError::Transport("connection reset".to_string())));
        world.tick();

        assert_eq!(fallback.requests(), vec![issued]);
        assert_eq!(world.scheduler.process_len(), 0);
        assert!(world.chat_to(a).is_empty());
    }

    /// Team members get the database answer for a confirmed save
    #[test]
    fn confirmed_team_save_notifies_members() {
        let fallback = MemoryFallback::new();
        let mut world = World::new(Box::new(fallback.clone()));
        let (a, b) = racing_team(&mut world);

        world.score.save_team(&mut world.game, &mut world.scheduler, b, "castle");
        world.transport.resolve(
            world.last_call(),
            Ok(Response::Text(Text {
                text: "Team successfully saved".to_string(),
            })),
        );
        world.tick();

        assert_eq!(world.chat_to(a), vec!["Team successfully saved"]);
        assert_eq!(world.chat_to(b), vec!["Team successfully saved"]);
        assert!(fallback.is_empty());
    }

    /// Every unconfirmed durable call at shutdown ends up in the log exactly once
    #[test]
    fn shutdown_records_pending_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.log");
        let mut world = World::new(Box::new(FallbackLog::open(&path).unwrap()));
        let (a, _) = racing_team(&mut world);

        let finish = world.game.finish_race(a, vec![]).unwrap();
        world.score.on_finish(&mut world.game, &mut world.scheduler, &finish);
        let solo = world.join("solo", 1002);
        world.score.show_rank(&mut world.game, &mut world.scheduler, solo, None);
        world.tick();

        let expected: Vec<Request> = world
            .transport
            .issued()
            .into_iter()
            .filter(Request::is_mutation)
            .collect();
        assert_eq!(expected.len(), 1);

        let report = world.scheduler.on_shutdown();
        assert_eq!(report.recorded, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(world.scheduler.on_shutdown().recorded, 0);

        let replayed: Vec<Request> = FallbackReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(replayed, expected);
    }

    /// A process call that never settles is logged once its deadline passes
    #[test]
    fn stuck_write_expires_into_log() {
        let fallback = MemoryFallback::new();
        let config = ScoreConfig {
            tick_rate: 2,
            pending_deadline_secs: Some(1),
            ..ScoreConfig::default()
        };
        let mut world = World::with_config(config, Box::new(fallback.clone()));
        let (a, _) = racing_team(&mut world);

        let finish = world.game.finish_race(a, vec![]).unwrap();
        world.score.on_finish(&mut world.game, &mut world.scheduler, &finish);

        world.tick();
        assert!(fallback.is_empty());
        world.tick();
        world.tick();
        assert_eq!(fallback.len(), 1);
        assert_eq!(world.scheduler.process_len(), 0);
        assert_eq!(world.scheduler.totals().expired, 1);
    }
}

/// CHAT OUTPUT TESTS
mod chat_tests {
    use super::*;

    #[test]
    fn birthday_greets_everyone() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        let slot = world.join("nameless", 1000);
        world
            .score
            .check_birthday(&mut world.game, &mut world.scheduler, slot);
        world.transport.resolve(
            world.last_call(),
            Ok(Response::Birthday(shared::rpc::Birthday { years_ago: 2 })),
        );
        world.tick();

        let outbox = world.game.outbox();
        assert!(outbox.contains(&Outgoing::Chat {
            target: ChatTarget::All,
            text: "Happy birthday to nameless for finishing their first map 2 years ago!"
                .to_string()
        }));
        assert!(outbox
            .iter()
            .any(|line| matches!(line, Outgoing::Broadcast { slot: s, .. } if *s == slot)));
    }

    #[test]
    fn zero_years_is_silent() {
        let mut world = World::new(Box::new(MemoryFallback::new()));
        let slot = world.join("nameless", 1000);
        world
            .score
            .check_birthday(&mut world.game, &mut world.scheduler, slot);
        world.transport.resolve(
            world.last_call(),
            Ok(Response::Birthday(shared::rpc::Birthday { years_ago: 0 })),
        );
        world.tick();

        assert!(world.game.outbox().is_empty());
        assert_eq!(world.game.client_name(slot).as_deref(), Some("nameless"));
    }
}
