//! Client transactions (RFC 3261 §17.1, RFC 6026 §8.4)

mod invite;
mod non_invite;

pub use invite::InviteClientTransaction;
pub use non_invite::NonInviteClientTransaction;
