//! Control message routing.
//!
//! A pure table from [`ControlCode`] to the component that handles it. The
//! sentinel bytes never reach this point: they do not decode to a
//! `ControlCode`, so header validation already rejected them.

use warpline_proto::ControlCode;

/// Agent-migration notification carried by an `ABM_*` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEvent {
    /// Agent state changed
    Update,
    /// Agent arrived
    Visiting,
    /// Agent left
    Leaving,
}

/// One step of the rendezvous protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendezvousStep {
    /// Requester to owner: lend me a page
    Start,
    /// Owner to requester: accepted, owner blocked
    Ack,
    /// Owner to requester: released (completed or busy)
    Unblock,
    /// Owner to requester: the lend was undone
    Rollback,
    /// Requester to owner: send the page
    GetPage,
    /// Owner to requester: page chunk
    GetPageAck,
    /// Requester to owner: modified page chunk
    WriteBack,
}

/// Where a control message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Topology collaborator
    Topology,
    /// Agent-migration collaborator
    Agent(AgentEvent),
    /// Rendezvous engine
    Rendezvous(RendezvousStep),
}

/// Route a control code.
pub const fn route(code: ControlCode) -> Route {
    match code {
        ControlCode::TopologyUpdate => Route::Topology,
        ControlCode::AbmUpdate => Route::Agent(AgentEvent::Update),
        ControlCode::AbmVisiting => Route::Agent(AgentEvent::Visiting),
        ControlCode::AbmLeaving => Route::Agent(AgentEvent::Leaving),
        ControlCode::RendezvousStart => Route::Rendezvous(RendezvousStep::Start),
        ControlCode::RendezvousAck => Route::Rendezvous(RendezvousStep::Ack),
        ControlCode::RendezvousUnblock => Route::Rendezvous(RendezvousStep::Unblock),
        ControlCode::RendezvousRollback => Route::Rendezvous(RendezvousStep::Rollback),
        ControlCode::GetPage => Route::Rendezvous(RendezvousStep::GetPage),
        ControlCode::GetPageAck => Route::Rendezvous(RendezvousStep::GetPageAck),
        ControlCode::PageWriteBack => Route::Rendezvous(RendezvousStep::WriteBack),
    }
}

#[cfg(test)]
mod tests {
    use warpline_proto::{MAX_VALUE_CONTROL, MIN_VALUE_CONTROL, RESERVED_CONTROL};

    use super::*;

    #[test]
    fn rendezvous_codes_sit_between_the_sentinels() {
        for code in ControlCode::ALL {
            let byte = code.to_u8();
            let in_range = byte > MIN_VALUE_CONTROL && byte < MAX_VALUE_CONTROL;
            assert_eq!(matches!(route(code), Route::Rendezvous(_)), in_range, "{code:?}");
        }
    }

    #[test]
    fn sentinels_never_route() {
        for byte in [RESERVED_CONTROL, MIN_VALUE_CONTROL, MAX_VALUE_CONTROL, 0xff] {
            assert!(ControlCode::from_u8(byte).is_none());
        }
    }
}
