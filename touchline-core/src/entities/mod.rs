pub mod chats;
pub mod members;
pub mod messages;
pub mod matches;
pub mod tickets;
pub mod users;

use touchline_sdk::objects::{
    ChatType as SdkChatType, MatchState as SdkMatchState, Role as SdkRole,
    TicketCloseReason as SdkTicketCloseReason, TicketStatus as SdkTicketStatus,
};

/// Convert a `TIMESTAMP` column (stored in UTC) into unix seconds.
pub fn unix_seconds(at: time::PrimitiveDateTime) -> i64 {
    at.assume_utc().unix_timestamp()
}

/// Current UTC time as stored in `TIMESTAMP` columns.
pub fn utc_now() -> time::PrimitiveDateTime {
    let now = time::OffsetDateTime::now_utc();
    time::PrimitiveDateTime::new(now.date(), now.time())
}

/// User role for database operations.
///
/// This is the sqlx::Type version. For API/DTO use, see `touchline_sdk::objects::Role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "user_role")]
pub enum UserRole {
    Bookmaker,
    Scout,
    Supervisor,
}

impl From<UserRole> for SdkRole {
    fn from(value: UserRole) -> Self {
        match value {
            UserRole::Bookmaker => SdkRole::Bookmaker,
            UserRole::Scout => SdkRole::Scout,
            UserRole::Supervisor => SdkRole::Supervisor,
        }
    }
}

impl From<SdkRole> for UserRole {
    fn from(value: SdkRole) -> Self {
        match value {
            SdkRole::Bookmaker => UserRole::Bookmaker,
            SdkRole::Scout => UserRole::Scout,
            SdkRole::Supervisor => UserRole::Supervisor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "chat_type")]
pub enum ChatType {
    Personal,
    Match,
    Ticket,
}

impl From<ChatType> for SdkChatType {
    fn from(value: ChatType) -> Self {
        match value {
            ChatType::Personal => SdkChatType::Personal,
            ChatType::Match => SdkChatType::Match,
            ChatType::Ticket => SdkChatType::Ticket,
        }
    }
}

impl From<SdkChatType> for ChatType {
    fn from(value: SdkChatType) -> Self {
        match value {
            SdkChatType::Personal => ChatType::Personal,
            SdkChatType::Match => ChatType::Match,
            SdkChatType::Ticket => ChatType::Ticket,
        }
    }
}

/// Stored match state. `Archived` only exists as a per-viewer projection
/// and has no database counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "match_state")]
pub enum MatchState {
    NotStarted,
    Live,
    Interrupted,
    Finished,
    Cancelled,
}

impl From<MatchState> for SdkMatchState {
    fn from(value: MatchState) -> Self {
        match value {
            MatchState::NotStarted => SdkMatchState::NotStarted,
            MatchState::Live => SdkMatchState::Live,
            MatchState::Interrupted => SdkMatchState::Interrupted,
            MatchState::Finished => SdkMatchState::Finished,
            MatchState::Cancelled => SdkMatchState::Cancelled,
        }
    }
}

impl TryFrom<SdkMatchState> for MatchState {
    type Error = SdkMatchState;

    fn try_from(value: SdkMatchState) -> Result<Self, Self::Error> {
        match value {
            SdkMatchState::NotStarted => Ok(MatchState::NotStarted),
            SdkMatchState::Live => Ok(MatchState::Live),
            SdkMatchState::Interrupted => Ok(MatchState::Interrupted),
            SdkMatchState::Finished => Ok(MatchState::Finished),
            SdkMatchState::Cancelled => Ok(MatchState::Cancelled),
            SdkMatchState::Archived => Err(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "ticket_status")]
pub enum TicketStatus {
    New,
    InProgress,
    Solved,
    Confirmed,
}

impl From<TicketStatus> for SdkTicketStatus {
    fn from(value: TicketStatus) -> Self {
        match value {
            TicketStatus::New => SdkTicketStatus::New,
            TicketStatus::InProgress => SdkTicketStatus::InProgress,
            TicketStatus::Solved => SdkTicketStatus::Solved,
            TicketStatus::Confirmed => SdkTicketStatus::Confirmed,
        }
    }
}

impl From<SdkTicketStatus> for TicketStatus {
    fn from(value: SdkTicketStatus) -> Self {
        match value {
            SdkTicketStatus::New => TicketStatus::New,
            SdkTicketStatus::InProgress => TicketStatus::InProgress,
            SdkTicketStatus::Solved => TicketStatus::Solved,
            SdkTicketStatus::Confirmed => TicketStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "ticket_close_reason")]
pub enum TicketCloseReason {
    Resolved,
    Duplicate,
    Invalid,
    Other,
}

impl From<TicketCloseReason> for SdkTicketCloseReason {
    fn from(value: TicketCloseReason) -> Self {
        match value {
            TicketCloseReason::Resolved => SdkTicketCloseReason::Resolved,
            TicketCloseReason::Duplicate => SdkTicketCloseReason::Duplicate,
            TicketCloseReason::Invalid => SdkTicketCloseReason::Invalid,
            TicketCloseReason::Other => SdkTicketCloseReason::Other,
        }
    }
}

impl From<SdkTicketCloseReason> for TicketCloseReason {
    fn from(value: SdkTicketCloseReason) -> Self {
        match value {
            SdkTicketCloseReason::Resolved => TicketCloseReason::Resolved,
            SdkTicketCloseReason::Duplicate => TicketCloseReason::Duplicate,
            SdkTicketCloseReason::Invalid => TicketCloseReason::Invalid,
            SdkTicketCloseReason::Other => TicketCloseReason::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archived_has_no_stored_form() {
        assert_eq!(
            MatchState::try_from(SdkMatchState::Archived),
            Err(SdkMatchState::Archived)
        );
        assert_eq!(
            MatchState::try_from(SdkMatchState::Live),
            Ok(MatchState::Live)
        );
    }

    #[test]
    fn test_unix_seconds_treats_column_as_utc() {
        let at = time::macros::datetime!(2024-06-10 06:13:20);
        assert_eq!(unix_seconds(at), 1_718_000_000);
    }
}
