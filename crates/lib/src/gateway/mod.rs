//! Gateway: HTTP + WebSocket front end.
//!
//! Single port serves `/ws/{client_id}` (chat transport) and the side channel:
//! `GET /get_channel_id` (alias `/clients`) and `POST /send_message`.

mod protocol;
mod server;

pub use protocol::{
    error_frame, DirectSendRequest, DirectSendResponse, Health, CLOSE_DUPLICATE_CLIENT, CLOSE_DUPLICATE_REASON,
    CLOSE_GOING_AWAY, CLOSE_SHUTDOWN_REASON,
};
pub use server::{app, build_audio_processor, run_gateway, serve, GatewayState};
