//! Session Module - Room Session State Machine
//!
//! Lebenszyklus einer Raum-Sitzung und die Liste der sichtbaren Teilnehmer.

mod room;
mod state;

pub use room::RoomSession;
pub use state::{
    AppScene, EnterRoomParams, ParticipantUpdate, RemoteParticipant, RoomState, MAX_USER_ID_LEN,
};
