//! Typed stubs over an untyped [`RpcTransport`].

use shared::rpc::{
    Birthday, Finish, FinishChat, MapFound, MapName, PlayerAndMap, PlayerName, PlayerScore,
    RandomMap, RandomMapRequest, RandomUnfinishedMapRequest, Request, TeamLoadRequest, TeamSave,
    Text, Time, TopPointsRequest, TopRankRequest,
};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::future::{FromResponse, Reply, RpcFuture};

/// Anything that can carry a [`Request`] to the score database.
///
/// `issue` must not block; the answer arrives later through the returned
/// receiver, settled from whatever thread the transport runs on.
pub trait RpcTransport: Send + Sync {
    fn issue(&self, request: Request) -> oneshot::Receiver<Reply>;
}

/// Cloneable handle exposing one method per database verb.
#[derive(Clone)]
pub struct DatabaseClient {
    transport: Arc<dyn RpcTransport>,
}

impl DatabaseClient {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    fn call<R: FromResponse + Clone>(&self, request: Request) -> RpcFuture<R> {
        RpcFuture::new(self.transport.issue(request))
    }

    pub fn best_time(&self, map: MapName) -> RpcFuture<Time> {
        self.call(Request::BestTime(map))
    }

    pub fn check_birthday(&self, player: PlayerName) -> RpcFuture<Birthday> {
        self.call(Request::CheckBirthday(player))
    }

    pub fn player_score(&self, request: PlayerAndMap) -> RpcFuture<PlayerScore> {
        self.call(Request::PlayerScore(request))
    }

    pub fn map_info(&self, map: MapName) -> RpcFuture<Text> {
        self.call(Request::MapInfo(map))
    }

    pub fn find_map(&self, map: MapName) -> RpcFuture<MapFound> {
        self.call(Request::FindMap(map))
    }

    pub fn finish(&self, finish: Finish) -> RpcFuture<FinishChat> {
        self.call(Request::Finish(finish))
    }

    pub fn show_rank(&self, request: PlayerAndMap) -> RpcFuture<Text> {
        self.call(Request::ShowRank(request))
    }

    pub fn show_team_rank(&self, request: PlayerAndMap) -> RpcFuture<Text> {
        self.call(Request::ShowTeamRank(request))
    }

    pub fn show_times(&self, request: PlayerAndMap) -> RpcFuture<Text> {
        self.call(Request::ShowTimes(request))
    }

    pub fn show_top(&self, request: TopRankRequest) -> RpcFuture<Text> {
        self.call(Request::ShowTop(request))
    }

    pub fn show_team_top(&self, request: TopRankRequest) -> RpcFuture<Text> {
        self.call(Request::ShowTeamTop(request))
    }

    pub fn show_points(&self, player: PlayerName) -> RpcFuture<Text> {
        self.call(Request::ShowPoints(player))
    }

    pub fn show_top_points(&self, request: TopPointsRequest) -> RpcFuture<Text> {
        self.call(Request::ShowTopPoints(request))
    }

    pub fn random_map(&self, request: RandomMapRequest) -> RpcFuture<RandomMap> {
        self.call(Request::RandomMap(request))
    }

    pub fn random_unfinished_map(&self, request: RandomUnfinishedMapRequest) -> RpcFuture<RandomMap> {
        self.call(Request::RandomUnfinishedMap(request))
    }

    pub fn save_team(&self, save: TeamSave) -> RpcFuture<Text> {
        self.call(Request::SaveTeam(save))
    }

    pub fn load_team(&self, request: TeamLoadRequest) -> RpcFuture<TeamSave> {
        self.call(Request::LoadTeam(request))
    }

    pub fn loading_team_done(&self, request: TeamLoadRequest) -> RpcFuture<()> {
        self.call(Request::LoadingTeamDone(request))
    }

    /// Sends an arbitrary request and expects an acknowledgement. Used when
    /// replaying recorded mutations.
    pub fn resubmit(&self, request: Request) -> oneshot::Receiver<Reply> {
        self.transport.issue(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::manual::ManualTransport;
    use shared::rpc::Response;

    #[test]
    fn test_typed_call_goes_through_transport() {
        let transport = Arc::new(ManualTransport::new());
        let client = DatabaseClient::new(transport.clone());

        let mut future = client.best_time(MapName {
            name: "Tutorial".to_string(),
        });

        let issued = transport.issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(
            issued[0],
            Request::BestTime(MapName {
                name: "Tutorial".to_string()
            })
        );

        assert!(!future.is_ready());
        transport.resolve_next(Ok(Response::Time(Time { time: 33.0 })));
        assert_eq!(future.take(), Some(Ok(Time { time: 33.0 })));
    }
}
