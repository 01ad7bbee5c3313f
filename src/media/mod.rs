//! Media orchestration for one two-party video chat.
//!
//! ```text
//!                 ┌─► outgoing: capture ─► tee ─┬─► encode ─► RTP ─► udp:5004 / udp:5005
//!  peer ip ───────┤                             └─► local preview
//!                 └─► incoming: udp:5004 / udp:5005 ─► RTP ─► decode ─► render
//! ```
//!
//! Exactly one incoming session lives for the whole process; the outgoing
//! session is built for the first peer that announces its address.

pub mod orchestrator;
pub mod types;
