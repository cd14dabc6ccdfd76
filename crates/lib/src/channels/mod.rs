//! Outbound channels (Kommo, Kommo Chats API, Wazzup).
//!
//! Channel trait and registry so the relay can look up the platform an inbound
//! message came from and send the reply back through it.

mod chats;
mod inbound;
mod kommo;
mod registry;
mod wazzup;

pub use chats::{ChatUser, KommoChatsClient, SendChatMessage};
pub use inbound::{generate_message_id, CrmLinkage, InboundMessage, MessageKind, OutboundMessage};
pub use kommo::{ChatSession, KommoChannel, Persona};
pub use registry::{ChannelHandle, ChannelRegistry};
pub use wazzup::WazzupChannel;
