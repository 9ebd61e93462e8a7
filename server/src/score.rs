//! Score call sites.
//!
//! Every method issues one database call and queues a continuation that
//! applies the answer once it arrives. Whatever the effect needs (names,
//! slots, team members) is captured when the call is issued; the live game
//! is only touched from inside the continuation, after its guard has been
//! checked.

use log::debug;
use shared::rpc::{
    Birthday, FinishChat, MapFound, MapName, PlayerAndMap, PlayerName, PlayerScore, RandomMap,
    RandomMapRequest, RandomUnfinishedMapRequest, Request, TeamLoadRequest, TeamSave, TeeFinish,
    Text, Time, TopPointsRequest, TopRankRequest,
};

use crate::config::ScoreConfig;
use crate::epoch::{live_slots, EpochGuard, SlotGuard};
use crate::game::{GameContext, RaceFinish};
use crate::rpc::{DatabaseClient, RpcFuture};
use crate::scheduler::{Continuation, Cx, Enqueue};

const TOP_RANKS: u32 = 5;

pub struct RpcScore {
    db: DatabaseClient,
    config: ScoreConfig,
}

impl RpcScore {
    /// Creates the score front end and requests the map's best time.
    pub fn new<C: GameContext + 'static>(
        db: DatabaseClient,
        config: ScoreConfig,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
    ) -> Self {
        let score = Self { db, config };
        score.load_best_time(game, queues);
        score
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    /// Points later calls at another map.
    pub fn set_map(&mut self, map: &str, server_type: &str) {
        self.config.map_name = map.to_string();
        self.config.server_type = server_type.to_string();
    }

    fn map_name(&self) -> String {
        self.config.map_name.clone()
    }

    /// Requests the current map record for the running session.
    pub fn load_best_time<C: GameContext + 'static>(&self, game: &mut C, queues: &mut dyn Enqueue<C>) {
        let future = self.db.best_time(MapName {
            name: self.map_name(),
        });
        queues.enqueue_session(
            Continuation::new("best_time", future, |record: Time, cx: &mut Cx<'_, C>| {
                cx.game.set_current_record(record.time)
            })
            .guarded(EpochGuard::Run(game.run_id())),
        );
    }

    pub fn check_birthday<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
    ) {
        let Some((guard, name)) = addressee(game, slot) else {
            return;
        };
        let future = self.db.check_birthday(PlayerName { name: name.clone() });
        queues.enqueue_session(
            Continuation::new(
                "check_birthday",
                future,
                move |birthday: Birthday, cx: &mut Cx<'_, C>| {
                    let years = birthday.years_ago;
                    if years == 0 {
                        return;
                    }
                    let plural = if years > 1 { "s" } else { "" };
                    cx.game.send_chat_all(&format!(
                        "Happy birthday to {} for finishing their first map {} year{} ago!",
                        name, years, plural
                    ));
                    cx.game.send_broadcast(
                        slot,
                        &format!(
                            "Happy birthday, {}!\nYou have finished your first map exactly {} year{} ago!",
                            name, years, plural
                        ),
                    );
                },
            )
            .guarded(guard),
        );
    }

    pub fn load_score<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
    ) {
        let Some((guard, name)) = addressee(game, slot) else {
            return;
        };
        let with_checkpoints = self.config.checkpoint_save;
        let future = self.db.player_score(PlayerAndMap {
            player_name: name,
            map_name: self.map_name(),
        });
        queues.enqueue_session(
            Continuation::new(
                "player_score",
                future,
                move |score: PlayerScore, cx: &mut Cx<'_, C>| {
                    cx.game.set_player_score(slot, &score, with_checkpoints)
                },
            )
            .guarded(guard),
        );
    }

    pub fn map_info<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        map: &str,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        let missing = format!("No map like \"{}\" found.", map);
        let future = self.db.map_info(MapName {
            name: map.to_string(),
        });
        queues.enqueue_session(
            reply_to(slot, "map_info", future)
                .guarded(guard)
                .on_absent(move |cx: &mut Cx<'_, C>| cx.game.send_chat_target(slot, &missing)),
        );
    }

    pub fn map_vote<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        map: &str,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        if !vote_allowed(game, slot) {
            return;
        }
        let missing = format!(
            "No map like \"{}\" found. Try adding a '%' at the start if you don't know the first character. Example: /map %castle for \"Out of Castle\"",
            map
        );
        let future = self.db.find_map(MapName {
            name: map.to_string(),
        });
        queues.enqueue_session(
            Continuation::new("find_map", future, move |found: MapFound, cx: &mut Cx<'_, C>| {
                cx.game
                    .start_map_vote(&found.map_name, &found.server_type, slot)
            })
            .guarded(guard)
            .on_absent(move |cx: &mut Cx<'_, C>| cx.game.send_chat_target(slot, &missing)),
        );
    }

    /// Submits a finished race. The write is durable: if it cannot be
    /// confirmed it goes to the fallback log.
    pub fn on_finish<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        finish: &RaceFinish,
    ) {
        let request = shared::rpc::Finish {
            map_name: self.map_name(),
            game_uuid: game.run_id().to_string(),
            team: finish.team,
            time: finish.time,
            tees: finish
                .tees
                .iter()
                .map(|tee| TeeFinish {
                    player_name: tee.name.clone(),
                    checkpoints: tee.checkpoints.clone(),
                })
                .collect(),
        };
        let guards: Vec<SlotGuard> = finish
            .tees
            .iter()
            .filter_map(|tee| game.guard_slot(tee.slot))
            .collect();

        let future = self.db.finish(request.clone());
        queues.enqueue_process(
            Continuation::new("finish", future, move |chat: FinishChat, cx: &mut Cx<'_, C>| {
                if !chat.chat_all.is_empty() {
                    cx.game.send_chat_all(&chat.chat_all);
                }
                let live = live_slots(&guards, &*cx.game);
                for (id, text) in &chat.chat_id {
                    let slot = *id as usize;
                    if live.contains(&slot) {
                        cx.game.send_chat_target(slot, text);
                    }
                }
            })
            .guarded(EpochGuard::Run(game.run_id()))
            .durable(Request::Finish(request)),
        );
    }

    pub fn show_rank<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        player: Option<&str>,
    ) {
        self.rank_request(game, queues, slot, player, false);
    }

    pub fn show_team_rank<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        player: Option<&str>,
    ) {
        self.rank_request(game, queues, slot, player, true);
    }

    fn rank_request<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        player: Option<&str>,
        team: bool,
    ) {
        let Some((guard, requester)) = addressee(game, slot) else {
            return;
        };
        let request = PlayerAndMap {
            player_name: player.map_or_else(|| requester.clone(), str::to_string),
            map_name: self.map_name(),
        };
        let (verb, future) = if team {
            ("show_team_rank", self.db.show_team_rank(request))
        } else {
            ("show_rank", self.db.show_rank(request))
        };
        let hide_score = self.config.hide_score;
        queues.enqueue_session(
            Continuation::new(verb, future, move |rank: Text, cx: &mut Cx<'_, C>| {
                if hide_score {
                    cx.game.send_chat_target(slot, &rank.text);
                } else {
                    cx.game.send_chat_all(&format!(
                        "{}\n(requested by {})",
                        rank.text, requester
                    ));
                }
            })
            .guarded(guard),
        );
    }

    pub fn show_times<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        player: Option<&str>,
    ) {
        let Some((guard, requester)) = addressee(game, slot) else {
            return;
        };
        let future = self.db.show_times(PlayerAndMap {
            player_name: player.map_or(requester, str::to_string),
            map_name: self.map_name(),
        });
        queues.enqueue_session(reply_to(slot, "show_times", future).guarded(guard));
    }

    pub fn show_top5<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        offset: i32,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        let future = self.db.show_top(self.top_request(offset));
        queues.enqueue_session(reply_to(slot, "show_top", future).guarded(guard));
    }

    pub fn show_team_top5<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        offset: i32,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        let future = self.db.show_team_top(self.top_request(offset));
        queues.enqueue_session(reply_to(slot, "show_team_top", future).guarded(guard));
    }

    fn top_request(&self, offset: i32) -> TopRankRequest {
        TopRankRequest {
            map_name: self.map_name(),
            num_ranks: TOP_RANKS,
            offset,
        }
    }

    pub fn show_points<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        player: Option<&str>,
    ) {
        let Some((guard, requester)) = addressee(game, slot) else {
            return;
        };
        let future = self.db.show_points(PlayerName {
            name: player.map_or(requester, str::to_string),
        });
        queues.enqueue_session(reply_to(slot, "show_points", future).guarded(guard));
    }

    pub fn show_top_points<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        offset: i32,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        let future = self.db.show_top_points(TopPointsRequest {
            num_ranks: TOP_RANKS,
            offset,
        });
        queues.enqueue_session(reply_to(slot, "show_top_points", future).guarded(guard));
    }

    pub fn random_map<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        stars: i32,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        if !vote_allowed(game, slot) {
            return;
        }
        let future = self.db.random_map(RandomMapRequest {
            stars,
            current_map: self.map_name(),
            server_type: self.config.server_type.clone(),
        });
        queues.enqueue_session(self.random_vote(
            slot,
            guard,
            "random_map",
            future,
            "No maps found on this server!",
        ));
    }

    pub fn random_unfinished_map<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        stars: i32,
    ) {
        let Some((guard, name)) = addressee(game, slot) else {
            return;
        };
        if !vote_allowed(game, slot) {
            return;
        }
        let future = self.db.random_unfinished_map(RandomUnfinishedMapRequest {
            stars,
            current_map: self.map_name(),
            server_type: self.config.server_type.clone(),
            player_name: name,
        });
        queues.enqueue_session(self.random_vote(
            slot,
            guard,
            "random_unfinished_map",
            future,
            "You have no more unfinished maps on this server!",
        ));
    }

    fn random_vote<C: GameContext + 'static>(
        &self,
        slot: usize,
        guard: EpochGuard,
        verb: &'static str,
        future: RpcFuture<RandomMap>,
        missing: &'static str,
    ) -> Continuation<C> {
        let server_type = self.config.server_type.clone();
        Continuation::new(verb, future, move |map: RandomMap, cx: &mut Cx<'_, C>| {
            cx.game.start_map_vote(&map.name, &server_type, slot)
        })
        .guarded(guard)
        .on_absent(move |cx: &mut Cx<'_, C>| {
            cx.game.reset_map_vote_timer();
            cx.game.send_chat_target(slot, missing);
        })
    }

    /// Saves the team of `slot` and ends its race. Validation problems are
    /// reported to the player and nothing is sent.
    pub fn save_team<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        code: &str,
    ) {
        let (team, tees) = match game.capture_team(slot) {
            Ok(captured) => captured,
            Err(e) => {
                game.send_chat_target(slot, &e.to_string());
                return;
            }
        };
        let members: Vec<usize> = if team == 0 {
            vec![slot]
        } else {
            game.team_members(team)
        };
        let guards: Vec<SlotGuard> = members
            .iter()
            .filter_map(|&member| game.guard_slot(member))
            .collect();
        let save = TeamSave {
            code: code.to_string(),
            map_name: self.map_name(),
            team_locked: game.is_team_locked(team),
            tees,
        };

        game.kill_team(team);
        debug!("Saving team {} with {} tees", team, save.tees.len());

        let future = self.db.save_team(save.clone());
        queues.enqueue_process(
            Continuation::new("save_team", future, move |reply: Text, cx: &mut Cx<'_, C>| {
                for member in live_slots(&guards, &*cx.game) {
                    cx.game.send_chat_target(member, &reply.text);
                }
            })
            .durable(Request::SaveTeam(save)),
        );
    }

    /// Loads a savegame onto the team of `slot`. Once restored, the
    /// database is told the savegame was consumed.
    pub fn load_team<C: GameContext + 'static>(
        &self,
        game: &mut C,
        queues: &mut dyn Enqueue<C>,
        slot: usize,
        code: &str,
    ) {
        let Some((guard, _)) = addressee(game, slot) else {
            return;
        };
        let request = TeamLoadRequest {
            code: code.to_string(),
            map_name: self.map_name(),
        };
        let db = self.db.clone();
        let future = self.db.load_team(request.clone());
        queues.enqueue_session(
            Continuation::new("load_team", future, move |save: TeamSave, cx: &mut Cx<'_, C>| {
                if let Err(e) = cx.game.restore_team(slot, &save) {
                    cx.game.send_chat_target(slot, &e.to_string());
                    return;
                }
                if let Some(team) = cx.game.team_of(slot) {
                    cx.game.send_chat_team(team, "Loading successfully done");
                }
                let done = db.loading_team_done(request.clone());
                cx.enqueue_process(
                    Continuation::new("loading_team_done", done, |(), _: &mut Cx<'_, C>| {})
                        .durable(Request::LoadingTeamDone(request)),
                );
            })
            .guarded(guard)
            .on_absent(move |cx: &mut Cx<'_, C>| {
                cx.game.send_chat_target(slot, "No such savegame for this map")
            }),
        );
    }
}

/// Guard and name of the player in `slot`, `None` if the slot is empty.
fn addressee<C: GameContext>(game: &C, slot: usize) -> Option<(EpochGuard, String)> {
    let name = game.client_name(slot)?;
    let guard = game.guard_slot(slot)?;
    Some((EpochGuard::Slot(guard), name))
}

fn vote_allowed<C: GameContext>(game: &mut C, slot: usize) -> bool {
    match game.vote_wait(slot) {
        Some(wait) => {
            game.send_chat_target(slot, &wait.message());
            !wait.blocks()
        }
        None => true,
    }
}

/// Continuation that sends the returned text privately to `slot`.
fn reply_to<C: GameContext + 'static>(
    slot: usize,
    verb: &'static str,
    future: RpcFuture<Text>,
) -> Continuation<C> {
    Continuation::new(verb, future, move |reply: Text, cx: &mut Cx<'_, C>| {
        cx.game.send_chat_target(slot, &reply.text)
    })
}
