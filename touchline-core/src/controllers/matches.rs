//! Match projection, on-demand indexing and bookmaker↔scout chats.

use kanau::processor::Processor;
use std::collections::{HashMap, HashSet};
use touchline_sdk::objects::chats::CreateChatResponse;
use touchline_sdk::objects::matches::{
    ChatOptionsResponse, MatchResponse, MatchScout, MatchesQuery, ScoutChatOption,
};
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{
    ChatType as SdkChatType, MatchId, MatchState as SdkMatchState, MessageContent, Role, UserId,
};
use tracing::info;

use super::chats::primary_member;
use super::{Actor, ControllerError, ControllerResult, Messenger};
use crate::cache::CacheKey;
use crate::entities::chats::{Chat, GetMatchChatPairs, MatchChatPair, NewChat, match_pair_key};
use crate::entities::matches::{
    GetMatchById, GetMatchScouts, MatchRecord, MatchScoutRecord, SearchMatches,
};
use crate::entities::members::{ChatMember, GetArchivedMatchIds};
use crate::entities::messages::{InsertMessage, Message};
use crate::entities::{ChatType, MatchState, UserRole};

const SCOUTS_MODULE: &str = "matches";
const SCOUTS_FUNC: &str = "scouts";
const SCOUTS_KWARG: &str = "match_id";

/// Cache entry holding the roster of one match.
pub fn match_scouts_key(match_id: MatchId) -> CacheKey {
    CacheKey::new(SCOUTS_MODULE, SCOUTS_FUNC).kwarg(SCOUTS_KWARG, match_id)
}

/// Whether a missing match should be fetched from the provider.
///
/// Bookmakers and supervisors index by default; nobody else may ask for it.
pub fn resolve_try_index(role: Role, requested: Option<bool>) -> ControllerResult<bool> {
    let allowed = matches!(role, Role::Bookmaker | Role::Supervisor);
    match requested {
        Some(true) if !allowed => Err(ControllerError::Forbidden("indexing is not allowed")),
        Some(explicit) => Ok(explicit),
        None => Ok(allowed),
    }
}

/// State as seen by `role`: a scout whose chats of the match have been
/// archived sees `Archived`.
pub fn project_state(state: SdkMatchState, role: Role, archived: bool) -> SdkMatchState {
    if role == Role::Scout && archived {
        SdkMatchState::Archived
    } else {
        state
    }
}

/// Chat options of a match for `actor`.
///
/// A scout only sees their own entry and never starts a chat; a bookmaker
/// sees every scout together with the chat they already have with them.
pub fn chat_options(
    actor: &Actor,
    match_id: MatchId,
    is_active: bool,
    scouts: &[MatchScout],
    pairs: &[MatchChatPair],
) -> ChatOptionsResponse {
    let options = match actor.role {
        Role::Scout => scouts
            .iter()
            .filter(|s| s.user_id == actor.user_id)
            .map(|s| ScoutChatOption {
                scout: s.clone(),
                existing_chat_id: None,
                can_start_chat: false,
            })
            .collect(),
        Role::Bookmaker => scouts
            .iter()
            .map(|s| {
                let existing_chat_id = pairs
                    .iter()
                    .find(|p| p.scout_user_id == s.user_id && p.bookmaker_user_id == actor.user_id)
                    .map(|p| p.chat_id);
                ScoutChatOption {
                    scout: s.clone(),
                    existing_chat_id,
                    can_start_chat: is_active && existing_chat_id.is_none(),
                }
            })
            .collect(),
        Role::Supervisor => Vec::new(),
    };
    ChatOptionsResponse { match_id, options }
}

fn group_scouts(match_ids: &[MatchId], rows: Vec<MatchScoutRecord>) -> HashMap<MatchId, Vec<MatchScout>> {
    let mut grouped: HashMap<MatchId, Vec<MatchScout>> =
        match_ids.iter().map(|id| (*id, Vec::new())).collect();
    for row in rows {
        grouped.entry(row.match_id).or_default().push(row.into());
    }
    grouped
}

impl Messenger {
    async fn match_record(&self, match_id: MatchId) -> ControllerResult<MatchRecord> {
        self.db
            .process(GetMatchById { match_id })
            .await?
            .ok_or(ControllerError::NotFound("match"))
    }

    /// Rosters of several matches, served from the cache where possible.
    pub async fn match_scouts(
        &self,
        match_ids: &[MatchId],
    ) -> ControllerResult<HashMap<MatchId, Vec<MatchScout>>> {
        let db = self.db.clone();
        self.cache
            .cached_multi_func(
                &CacheKey::new(SCOUTS_MODULE, SCOUTS_FUNC),
                SCOUTS_KWARG,
                match_ids,
                move |missing: Vec<MatchId>| async move {
                    let rows = db
                        .process(GetMatchScouts {
                            match_ids: missing.clone(),
                        })
                        .await?;
                    Ok::<_, ControllerError>(group_scouts(&missing, rows))
                },
            )
            .await
    }

    async fn match_responses(
        &self,
        actor: &Actor,
        records: Vec<MatchRecord>,
    ) -> ControllerResult<Vec<MatchResponse>> {
        let ids: Vec<MatchId> = records.iter().map(|r| r.sportlevel_id).collect();
        let mut scouts = self.match_scouts(&ids).await?;
        let archived: HashSet<MatchId> = if actor.role == Role::Scout {
            self.db
                .process(GetArchivedMatchIds {
                    user_id: actor.user_id,
                    match_ids: ids.clone(),
                })
                .await?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };
        let unread = self.counters.by_match_many(actor.user_id, &ids).await?;
        let settings = self.sync_settings.snapshot();

        Ok(records
            .into_iter()
            .map(|record| {
                let id = record.sportlevel_id;
                let state = SdkMatchState::from(record.state);
                MatchResponse {
                    sportlevel_id: id,
                    state: project_state(state, actor.role, archived.contains(&id)),
                    is_active: settings.is_active(state),
                    fields: record.fields(),
                    scouts: scouts.remove(&id).unwrap_or_default(),
                    unread_count: unread.get(&id).copied().unwrap_or(0),
                }
            })
            .collect())
    }

    /// One match. With `try_index`, a match unknown to the database is
    /// fetched from the provider and stored first.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, match_id = match_id))]
    pub async fn get_match(
        &self,
        actor: &Actor,
        match_id: MatchId,
        try_index: Option<bool>,
    ) -> ControllerResult<MatchResponse> {
        let try_index = resolve_try_index(actor.role, try_index)?;
        let record = match self.db.process(GetMatchById { match_id }).await? {
            Some(record) => record,
            None if try_index => {
                if self.sync.index_match(match_id).await?.is_none() {
                    return Err(ControllerError::NotFound(
                        "match not found in source and in DB",
                    ));
                }
                self.match_record(match_id).await?
            }
            None => return Err(ControllerError::NotFound("match")),
        };
        if actor.role == Role::Scout
            && !MatchScoutRecord::is_scout_of(&self.db.pool, match_id, actor.user_id).await?
        {
            return Err(ControllerError::NotFound("match"));
        }
        self.match_responses(actor, vec![record])
            .await?
            .pop()
            .ok_or(ControllerError::Internal("match projection is empty".into()))
    }

    /// A page of matches; scouts only see matches they are on the roster of.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id))]
    pub async fn get_matches(
        &self,
        actor: &Actor,
        query: &MatchesQuery,
    ) -> ControllerResult<Vec<MatchResponse>> {
        let active_states = self
            .sync_settings
            .snapshot()
            .active_state_list()
            .into_iter()
            .filter_map(|s| MatchState::try_from(s).ok())
            .collect();
        let records = self
            .db
            .process(SearchMatches {
                is_active: query.is_active,
                active_states,
                search: query.search.clone().filter(|s| !s.is_empty()),
                scout_user_id: (actor.role == Role::Scout).then_some(actor.user_id),
                limit: query.limit.clamp(1, 200),
                offset: query.offset.max(0),
            })
            .await?;
        self.match_responses(actor, records).await
    }

    /// A bookmaker opens a chat with one scout of an active match.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, match_id = match_id, scout_user_id = scout_user_id))]
    pub async fn start_chat(
        &self,
        actor: &Actor,
        match_id: MatchId,
        scout_user_id: UserId,
    ) -> ControllerResult<CreateChatResponse> {
        if actor.role != Role::Bookmaker {
            return Err(ControllerError::Forbidden("only bookmakers may start match chats"));
        }
        let record = self.match_record(match_id).await?;
        if !self.sync_settings.snapshot().is_active(record.state.into()) {
            return Err(ControllerError::Unprocessable("match is not active"));
        }
        if !MatchScoutRecord::is_scout_of(&self.db.pool, match_id, scout_user_id).await? {
            return Err(ControllerError::Unprocessable("scout is not linked to the match"));
        }
        let bookmaker = self.known_user(actor.user_id).await?;

        let pair_key = match_pair_key(match_id, actor.user_id, scout_user_id);
        let mut tx = self.db.pool.begin().await?;
        if Chat::find_by_pair_key_tx(&mut tx, &pair_key).await?.is_some() {
            return Err(ControllerError::Conflict("chat already exists"));
        }
        let chat_id = Chat::insert_tx(
            &mut tx,
            &NewChat {
                chat_type: ChatType::Match,
                match_id: Some(match_id),
                pair_key: Some(pair_key),
            },
        )
        .await?
        .ok_or(ControllerError::Conflict("chat already exists"))?;
        ChatMember::insert_tx(&mut tx, &primary_member(chat_id, bookmaker.id, bookmaker.role))
            .await?;
        ChatMember::insert_tx(&mut tx, &primary_member(chat_id, scout_user_id, UserRole::Scout))
            .await?;
        let message = Message::insert_tx(
            &mut tx,
            &InsertMessage {
                chat_id,
                sender_id: None,
                content: MessageContent::ChatCreated {
                    created_by: Some(actor.user_id),
                },
                reply_to: None,
            },
        )
        .await?;
        ChatMember::set_first_available_tx(&mut tx, chat_id, scout_user_id, message.id).await?;
        tx.commit().await?;

        for user_id in [actor.user_id, scout_user_id] {
            self.counters.init_chat(user_id, chat_id, 0).await?;
        }
        self.announce_message(&message, Some(actor.user_id), false)
            .await;
        self.announce(ServiceUpdate::now(UpdateKind::ChatCreated {
            chat_id,
            chat_type: SdkChatType::Match,
            created_by_user_id: Some(actor.user_id),
            match_id: Some(match_id),
        }))
        .await;
        info!(chat_id, "match chat started");
        Ok(CreateChatResponse {
            chat_id,
            is_new: true,
        })
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, match_id = match_id))]
    pub async fn get_chat_options(
        &self,
        actor: &Actor,
        match_id: MatchId,
    ) -> ControllerResult<ChatOptionsResponse> {
        if actor.role == Role::Supervisor {
            return Err(ControllerError::Forbidden("supervisors do not start match chats"));
        }
        let record = self.match_record(match_id).await?;
        let is_active = self.sync_settings.snapshot().is_active(record.state.into());
        let scouts = self
            .match_scouts(&[match_id])
            .await?
            .remove(&match_id)
            .unwrap_or_default();
        let pairs = self.db.process(GetMatchChatPairs { match_id }).await?;
        Ok(chat_options(actor, match_id, is_active, &scouts, &pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scout(user_id: UserId, number: i32) -> MatchScout {
        MatchScout {
            user_id,
            scout_number: number,
            name: format!("scout {number}"),
            is_main_scout: number == 1,
        }
    }

    fn pair(chat_id: i64, scout_user_id: UserId, bookmaker_user_id: UserId) -> MatchChatPair {
        MatchChatPair {
            chat_id,
            scout_user_id,
            bookmaker_user_id,
        }
    }

    #[test]
    fn test_try_index_defaults_by_role() {
        assert!(resolve_try_index(Role::Bookmaker, None).unwrap());
        assert!(resolve_try_index(Role::Supervisor, None).unwrap());
        assert!(!resolve_try_index(Role::Scout, None).unwrap());
        assert!(!resolve_try_index(Role::Bookmaker, Some(false)).unwrap());
        assert!(!resolve_try_index(Role::Scout, Some(false)).unwrap());
    }

    #[test]
    fn test_scout_cannot_request_indexing() {
        let err = resolve_try_index(Role::Scout, Some(true)).unwrap_err();
        assert!(matches!(err, ControllerError::Forbidden(_)));
    }

    #[test]
    fn test_archived_projection_only_for_scouts() {
        assert_eq!(
            project_state(SdkMatchState::Finished, Role::Scout, true),
            SdkMatchState::Archived
        );
        assert_eq!(
            project_state(SdkMatchState::Finished, Role::Bookmaker, true),
            SdkMatchState::Finished
        );
        assert_eq!(
            project_state(SdkMatchState::Live, Role::Scout, false),
            SdkMatchState::Live
        );
    }

    #[test]
    fn test_bookmaker_sees_every_scout() {
        let actor = Actor::new(10, Role::Bookmaker);
        let scouts = [scout(20, 1), scout(21, 2)];
        let pairs = [pair(5, 20, 10), pair(6, 21, 11)];

        let response = chat_options(&actor, 100, true, &scouts, &pairs);

        assert_eq!(response.match_id, 100);
        assert_eq!(response.options.len(), 2);
        assert_eq!(response.options[0].existing_chat_id, Some(5));
        assert!(!response.options[0].can_start_chat);
        // chat 6 belongs to another bookmaker
        assert_eq!(response.options[1].existing_chat_id, None);
        assert!(response.options[1].can_start_chat);
    }

    #[test]
    fn test_inactive_match_offers_no_new_chats() {
        let actor = Actor::new(10, Role::Bookmaker);
        let response = chat_options(&actor, 100, false, &[scout(20, 1)], &[]);
        assert!(!response.options[0].can_start_chat);
    }

    #[test]
    fn test_scout_sees_only_itself() {
        let actor = Actor::new(21, Role::Scout);
        let scouts = [scout(20, 1), scout(21, 2)];

        let response = chat_options(&actor, 100, true, &scouts, &[]);

        assert_eq!(response.options.len(), 1);
        assert_eq!(response.options[0].scout.user_id, 21);
        assert!(!response.options[0].can_start_chat);
    }

    #[test]
    fn test_roster_grouping_keeps_empty_matches() {
        let rows = vec![MatchScoutRecord {
            match_id: 1,
            user_id: 20,
            scout_number: 1,
            is_main_scout: true,
            name: "a".into(),
        }];
        let grouped = group_scouts(&[1, 2], rows);
        assert_eq!(grouped[&1].len(), 1);
        assert!(grouped[&2].is_empty());
    }

    #[test]
    fn test_scouts_key_matches_batched_layout() {
        let batched = CacheKey::new(SCOUTS_MODULE, SCOUTS_FUNC).kwarg(SCOUTS_KWARG, 7);
        assert_eq!(match_scouts_key(7).render(), batched.render());
    }
}
