//! Server transactions (RFC 3261 §17.2, RFC 6026 §8.5-8.7)

mod invite;
mod non_invite;

pub use invite::InviteServerTransaction;
pub use non_invite::NonInviteServerTransaction;
