//! Relays chat events from the bus to the sockets of chat members.

use async_trait::async_trait;
use std::sync::Arc;
use touchline_sdk::objects::proto::{
    ChatMessage, DeliveryStatusChangedUpdate, MessageReceivedUpdate, PbDeliveryStatus,
    ServerUpdate, UserIsTypingUpdate, UserStatusChangedUpdate, server_update::Update,
};
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{ChatId, MatchId, PresenceStatus, UserId};
use tracing::debug;

use super::ConnectionRegistry;
use crate::bus::{HandleError, MessageHandler};
use crate::processors::service_updates::ChatLookup;

/// Who a socket update is meant for.
#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    /// Readers of a chat, optionally without the user who caused it.
    Chat {
        chat_id: ChatId,
        except: Option<UserId>,
    },
    Everyone,
}

/// Socket update for a bus event, if sockets care about it.
///
/// `match_id` is the match of the chat, when known.
pub fn socket_update(
    kind: &UpdateKind,
    match_id: Option<MatchId>,
) -> Option<(Audience, ServerUpdate)> {
    let routed = match kind {
        UpdateKind::MessageSent {
            message_id,
            sender_id,
            chat_id,
            content_raw,
            msg_created_at,
            ..
        } => (
            Audience::Chat {
                chat_id: *chat_id,
                except: None,
            },
            Update::MessageReceived(MessageReceivedUpdate {
                message: Some(ChatMessage {
                    id: *message_id,
                    chat_id: *chat_id,
                    sender_id: *sender_id,
                    sent_at: *msg_created_at,
                    content_json: content_raw.clone(),
                    state: PbDeliveryStatus::Sent as i32,
                    match_id,
                }),
            }),
        ),
        UpdateKind::DeliveryStatusChanged {
            message_id,
            chat_id,
            user_id,
            status,
        } => (
            Audience::Chat {
                chat_id: *chat_id,
                except: Some(*user_id),
            },
            Update::DeliveryStatusChanged(DeliveryStatusChangedUpdate {
                chat_id: *chat_id,
                message_id: *message_id,
                user_id: *user_id,
                status: PbDeliveryStatus::from(*status) as i32,
            }),
        ),
        UpdateKind::UserIsTyping {
            chat_id,
            user_id,
            is_typing,
        } => (
            Audience::Chat {
                chat_id: *chat_id,
                except: Some(*user_id),
            },
            Update::UserIsTyping(UserIsTypingUpdate {
                chat_id: *chat_id,
                user_id: *user_id,
                is_typing: *is_typing,
            }),
        ),
        UpdateKind::PresenceStatusChanged { user_id, status } => (
            Audience::Everyone,
            Update::UserStatusChanged(UserStatusChangedUpdate {
                user_id: *user_id,
                online: *status == PresenceStatus::Online,
            }),
        ),
        _ => return None,
    };
    Some((routed.0, routed.1.into()))
}

fn chat_of(kind: &UpdateKind) -> Option<ChatId> {
    match kind {
        UpdateKind::MessageSent { chat_id, .. }
        | UpdateKind::DeliveryStatusChanged { chat_id, .. }
        | UpdateKind::UserIsTyping { chat_id, .. } => Some(*chat_id),
        _ => None,
    }
}

/// Bus consumer feeding the [`ConnectionRegistry`].
pub struct GatewayFanout {
    registry: ConnectionRegistry,
    chats: Arc<dyn ChatLookup>,
}

impl GatewayFanout {
    pub fn new(registry: ConnectionRegistry, chats: Arc<dyn ChatLookup>) -> Self {
        Self { registry, chats }
    }
}

#[async_trait]
impl MessageHandler for GatewayFanout {
    type Message = ServiceUpdate;

    async fn handle(&self, update: ServiceUpdate) -> Result<(), HandleError> {
        if self.registry.is_empty() {
            return Ok(());
        }
        let chat = match chat_of(&update.kind) {
            Some(chat_id) => match self.chats.chat_members(chat_id).await {
                Ok(Some(found)) => Some(found),
                Ok(None) => return Err(HandleError::Drop(format!("chat {chat_id} not found"))),
                Err(e) => return Err(HandleError::Failed(e.to_string())),
            },
            None => None,
        };
        let match_id = chat.as_ref().and_then(|(match_id, _)| *match_id);
        let Some((audience, socket)) = socket_update(&update.kind, match_id) else {
            return Ok(());
        };

        let skip = update.cid.as_deref();
        let served = match audience {
            Audience::Everyone => self.registry.broadcast(&socket).await,
            Audience::Chat { except, .. } => {
                let mut served = 0;
                let readers = chat
                    .iter()
                    .flat_map(|(_, members)| members)
                    .filter(|m| m.can_read && Some(m.user_id) != except);
                for member in readers {
                    served += self.registry.deliver(member.user_id, &socket, skip).await;
                }
                served
            }
        };
        debug!(update_type = %update.update_type(), served, "Fanned out update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::UserRole;
    use crate::entities::members::ChatMember;
    use crate::streaming::Outbound;
    use std::collections::HashMap;
    use touchline_sdk::objects::DeliveryStatus;

    struct FakeChats(HashMap<ChatId, (Option<MatchId>, Vec<ChatMember>)>);

    #[async_trait]
    impl ChatLookup for FakeChats {
        async fn chat_members(
            &self,
            chat_id: ChatId,
        ) -> Result<Option<(Option<MatchId>, Vec<ChatMember>)>, sqlx::Error> {
            Ok(self.0.get(&chat_id).cloned())
        }
    }

    fn member(user_id: UserId, can_read: bool) -> ChatMember {
        ChatMember {
            chat_id: 1,
            user_id,
            role: UserRole::Bookmaker,
            can_read,
            can_write: true,
            is_primary_member: true,
            is_archive_member: false,
            first_available_message_id: None,
            last_available_message_id: None,
            last_read_message_id: None,
            last_received_message_id: None,
        }
    }

    fn fanout(registry: &ConnectionRegistry) -> GatewayFanout {
        let chats = FakeChats(HashMap::from([(
            1,
            (Some(100), vec![member(10, true), member(20, true), member(30, false)]),
        )]));
        GatewayFanout::new(registry.clone(), Arc::new(chats))
    }

    fn message_sent() -> UpdateKind {
        UpdateKind::MessageSent {
            initiator_id: Some(10),
            message_id: 5,
            sender_id: Some(10),
            chat_id: 1,
            content_raw: r#"{"kind":"text","text":"hi"}"#.into(),
            msg_created_at: 1_700_000_000,
            do_not_increment_counter: false,
        }
    }

    #[test]
    fn test_message_sent_becomes_message_received() {
        let (audience, update) = socket_update(&message_sent(), Some(100)).unwrap();
        assert_eq!(
            audience,
            Audience::Chat {
                chat_id: 1,
                except: None
            }
        );
        let Some(Update::MessageReceived(received)) = update.update else {
            panic!("unexpected update {update:?}");
        };
        let message = received.message.unwrap();
        assert_eq!(message.id, 5);
        assert_eq!(message.match_id, Some(100));
    }

    #[test]
    fn test_match_events_stay_off_sockets() {
        let kind = UpdateKind::MatchDataChanged {
            sportlevel_id: 1,
            fields: touchline_sdk::objects::matches::MatchFields {
                sport: "football".into(),
                tournament: "cup".into(),
                home_team: "a".into(),
                away_team: "b".into(),
                starts_at: 0,
            },
        };
        assert!(socket_update(&kind, None).is_none());
    }

    #[tokio::test]
    async fn test_message_reaches_readers_but_not_origin_socket() {
        let registry = ConnectionRegistry::new();
        let (origin, mut rx_origin) = registry.register(10);
        let (_phone, mut rx_phone) = registry.register(10);
        let (_peer, mut rx_peer) = registry.register(20);
        let (_muted, mut rx_muted) = registry.register(30);

        let update = ServiceUpdate::now(message_sent()).with_connection(origin.to_string());
        fanout(&registry).handle(update).await.unwrap();

        assert!(rx_origin.try_recv().is_err());
        assert!(matches!(rx_phone.try_recv(), Ok(Outbound::Update(_))));
        assert!(matches!(rx_peer.try_recv(), Ok(Outbound::Update(_))));
        assert!(rx_muted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_receipt_skips_reader() {
        let registry = ConnectionRegistry::new();
        let (_reader, mut rx_reader) = registry.register(20);
        let (_author, mut rx_author) = registry.register(10);

        let update = ServiceUpdate::now(UpdateKind::DeliveryStatusChanged {
            message_id: 5,
            chat_id: 1,
            user_id: 20,
            status: DeliveryStatus::Read,
        });
        fanout(&registry).handle(update).await.unwrap();

        assert!(rx_reader.try_recv().is_err());
        let Ok(Outbound::Update(update)) = rx_author.try_recv() else {
            panic!("author got nothing");
        };
        assert!(matches!(update.update, Some(Update::DeliveryStatusChanged(_))));
    }

    #[tokio::test]
    async fn test_unknown_chat_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (_c, _rx) = registry.register(10);
        let update = ServiceUpdate::now(UpdateKind::UserIsTyping {
            chat_id: 99,
            user_id: 10,
            is_typing: true,
        });
        let err = fanout(&registry).handle(update).await.unwrap_err();
        assert!(matches!(err, HandleError::Drop(_)));
    }
}
