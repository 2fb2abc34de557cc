//! State Translator
//!
//! Maps each raw engine call state onto the small application-facing set of
//! lifecycle state, direction and address rule. The match is exhaustive, so a
//! new raw state cannot be added without deciding its row here.

use crate::engine::RawCallState;
use crate::registry::{CallDirection, CallState};

/// How the from/to addresses of a call are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRule {
    /// from = remote party, to = local identity
    RemoteToLocal,
    /// from = local identity, to = remote party
    LocalToRemote,
    /// keep whatever the call already has
    Unchanged,
}

/// Result of translating one raw state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// New lifecycle state, `None` when the raw state causes no transition
    pub state: Option<CallState>,
    /// New direction, `None` to keep the stored one
    pub direction: Option<CallDirection>,
    pub address: AddressRule,
    /// Stop recording if the call has a record file
    pub stops_recording: bool,
}

impl Translation {
    const NO_OP: Translation = Translation {
        state: None,
        direction: None,
        address: AddressRule::Unchanged,
        stops_recording: false,
    };

    const fn loading(direction: CallDirection, address: AddressRule) -> Self {
        Translation {
            state: Some(CallState::Loading),
            direction: Some(direction),
            address,
            stops_recording: false,
        }
    }

    const fn state(state: CallState) -> Self {
        Translation {
            state: Some(state),
            ..Self::NO_OP
        }
    }
}

/// Translate a raw engine state
pub const fn translate(raw: RawCallState) -> Translation {
    use RawCallState::*;

    match raw {
        IncomingReceived | IncomingEarlyMedia => {
            Translation::loading(CallDirection::Incoming, AddressRule::RemoteToLocal)
        }
        OutgoingInit | OutgoingProgress | OutgoingRinging | OutgoingEarlyMedia => {
            Translation::loading(CallDirection::Outgoing, AddressRule::LocalToRemote)
        }
        Connected | StreamsRunning | PausedByRemote | UpdatedByRemote => {
            Translation::state(CallState::Active)
        }
        Error => Translation::state(CallState::Error),
        Released | End => Translation {
            stops_recording: true,
            ..Translation::state(CallState::Completed)
        },
        Idle | Pausing | Paused | Resuming | Referred | Updating => Translation::NO_OP,
    }
}
