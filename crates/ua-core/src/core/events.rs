//! Events delivered to the application

use sipua_message::{Request, Response};

use crate::dialog::{DialogId, SubscriberKey, SubscriptionState};
use crate::user_agent::{UacId, UasId};

/// Everything the core reports to the application
///
/// Client events carry the [`UacId`] returned when the request was sent;
/// server events carry a [`UasId`] to answer with.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAgentEvent {
    /// 100 Trying
    Trying { uac: UacId, response: Response },

    /// 101-199; `dialog` is the early dialog the response created or updated
    Progress {
        uac: UacId,
        dialog: Option<DialogId>,
        response: Response,
    },

    /// 2xx; an INVITE 2xx must be acknowledged with `ack(dialog)`
    Accepted {
        uac: UacId,
        dialog: Option<DialogId>,
        response: Response,
    },

    /// 3xx
    Redirected { uac: UacId, response: Response },

    /// 4xx-6xx, including the 408 and 503 synthesized for timeouts and
    /// transport failures
    Rejected { uac: UacId, response: Response },

    /// A request the application has to answer
    IncomingRequest {
        uas: UasId,
        dialog: Option<DialogId>,
        request: Request,
    },

    /// The INVITE behind `uas` was cancelled and answered 487
    Cancelled { uas: UasId, request: Request },

    /// The server transaction failed (no ACK, transport error)
    ServerFailure { uas: UasId, reason: String },

    /// The ACK for a 2xx we sent arrived
    AckReceived { dialog: DialogId, ack: Request },

    /// The ACK for a 2xx we sent never arrived
    AckTimeout { dialog: DialogId },

    DialogTerminated { dialog: DialogId, reason: String },

    /// A NOTIFY for one of our subscriptions, already answered 200
    Notify { dialog: DialogId, request: Request },

    SubscriptionStateChanged {
        dialog: DialogId,
        state: SubscriptionState,
        expires: Option<u32>,
    },

    /// A subscription ended; `dialog` is unset when it ended before any
    /// NOTIFY created one
    SubscriptionTerminated {
        key: SubscriberKey,
        dialog: Option<DialogId>,
        reason: String,
    },
}
