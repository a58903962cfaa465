//! HTTP route handlers.
//!
//! Pairing is the only stateful HTTP surface; everything else on the hub
//! flows over the WebSocket. No authentication — security rests on the
//! unguessable pair code and TLS at the edge.

pub mod health;
pub mod pair;
