//! The DICOM upper layer protocol state machine.
//!
//! This module implements the 13 protocol states and 19 events
//! of the upper layer protocol (PS3.8, section 9.2),
//! as a pure transition table:
//! feeding an event to a [`Machine`] yields the ordered list of
//! named [`Action`]s that the association driver must execute
//! before the next event is processed.
//! The machine holds no reference to sockets or timers,
//! so the same table drives both the requestor and the acceptor side.

use snafu::Snafu;

/// One of the 13 states of the upper layer protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Idle, no transport connection
    Sta1,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ
    Sta2,
    /// Awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// Awaiting transport connection opening to complete
    Sta4,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ
    Sta5,
    /// Association established, ready for data transfer
    Sta6,
    /// Awaiting A-RELEASE-RP
    Sta7,
    /// Awaiting local A-RELEASE response primitive
    Sta8,
    /// Release collision: awaiting local A-RELEASE response
    Sta9,
    /// Release collision: awaiting A-RELEASE-RP
    Sta10,
    /// Release collision: awaiting A-RELEASE-RP (response sent)
    Sta11,
    /// Release collision: awaiting local A-RELEASE response (confirmed)
    Sta12,
    /// Awaiting transport connection close
    Sta13,
}

/// The role this application entity took when the association
/// was initiated. Resolves the release collision fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Requestor,
    Acceptor,
}

/// One of the 19 events recognized by the protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Evt1: local A-ASSOCIATE request primitive
    AAssociateRequest,
    /// Evt2: transport connection confirmation
    TransportConnectConfirm,
    /// Evt3: A-ASSOCIATE-AC PDU received
    AAssociateAcReceived,
    /// Evt4: A-ASSOCIATE-RJ PDU received
    AAssociateRjReceived,
    /// Evt5: transport connection indication
    TransportConnectIndication,
    /// Evt6: A-ASSOCIATE-RQ PDU received
    AAssociateRqReceived,
    /// Evt7: local A-ASSOCIATE response primitive (accept)
    AAssociateResponseAccept,
    /// Evt8: local A-ASSOCIATE response primitive (reject)
    AAssociateResponseReject,
    /// Evt9: local P-DATA request primitive
    PDataRequest,
    /// Evt10: P-DATA-TF PDU received
    PDataReceived,
    /// Evt11: local A-RELEASE request primitive
    AReleaseRequest,
    /// Evt12: A-RELEASE-RQ PDU received
    AReleaseRqReceived,
    /// Evt13: A-RELEASE-RP PDU received
    AReleaseRpReceived,
    /// Evt14: local A-RELEASE response primitive
    AReleaseResponse,
    /// Evt15: local A-ABORT request primitive
    AAbortRequest,
    /// Evt16: A-ABORT PDU received
    AAbortReceived,
    /// Evt17: transport connection closed indication
    TransportClosed,
    /// Evt18: ARTIM timer expired
    ArtimExpired,
    /// Evt19: unrecognized or invalid PDU received
    InvalidPdu,
}

/// A named side effect that the driver must execute
/// after a state transition, in the order given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// AE-1: issue a TRANSPORT CONNECT request to the network
    Ae1IssueTransportConnect,
    /// AE-2: send the A-ASSOCIATE-RQ PDU
    Ae2SendAssociateRq,
    /// AE-3: issue an A-ASSOCIATE confirmation (accept) primitive
    Ae3ConfirmAccept,
    /// AE-4: issue an A-ASSOCIATE confirmation (reject) primitive and close transport
    Ae4ConfirmRejectAndClose,
    /// AE-5: issue a transport connection response and start ARTIM
    Ae5AcceptTransportStartArtim,
    /// AE-6: stop ARTIM and issue an A-ASSOCIATE indication primitive
    Ae6StopArtimIndicateAssociate,
    /// AE-7: send the A-ASSOCIATE-AC PDU
    Ae7SendAssociateAc,
    /// AE-8: send the A-ASSOCIATE-RJ PDU and start ARTIM
    Ae8SendAssociateRjStartArtim,
    /// DT-1: send the P-DATA-TF PDU
    Dt1SendPData,
    /// DT-2: issue a P-DATA indication primitive
    Dt2IndicatePData,
    /// AR-1: send the A-RELEASE-RQ PDU
    Ar1SendReleaseRq,
    /// AR-2: issue an A-RELEASE indication primitive
    Ar2IndicateRelease,
    /// AR-3: issue an A-RELEASE confirmation primitive and close transport
    Ar3ConfirmReleaseAndClose,
    /// AR-4: send the A-RELEASE-RP PDU and start ARTIM
    Ar4SendReleaseRpStartArtim,
    /// AR-5: stop ARTIM
    Ar5StopArtim,
    /// AR-6: issue a P-DATA indication primitive (during release)
    Ar6IndicatePData,
    /// AR-7: send the P-DATA-TF PDU (during release)
    Ar7SendPData,
    /// AR-8: issue an A-RELEASE indication primitive (release collision)
    Ar8IndicateReleaseCollision,
    /// AR-9: send the A-RELEASE-RP PDU (release collision)
    Ar9SendReleaseRp,
    /// AR-10: issue an A-RELEASE confirmation primitive (release collision)
    Ar10ConfirmReleaseCollision,
    /// AA-1: send an A-ABORT PDU (service-user source) and start or restart ARTIM
    Aa1SendAbortStartArtim,
    /// AA-2: stop ARTIM if running and close transport
    Aa2StopArtimAndClose,
    /// AA-3: issue an A-ABORT or A-P-ABORT indication primitive and close transport
    Aa3IndicateAbortAndClose,
    /// AA-4: issue an A-P-ABORT indication primitive
    Aa4IndicateProviderAbort,
    /// AA-5: stop ARTIM
    Aa5StopArtim,
    /// AA-6: ignore the PDU
    Aa6Ignore,
    /// AA-7: send an A-ABORT PDU
    Aa7SendAbort,
    /// AA-8: send an A-ABORT PDU (service-provider source),
    /// issue an A-P-ABORT indication and start ARTIM
    Aa8SendAbortIndicateStartArtim,
}

#[derive(Debug, Snafu)]
#[snafu(display("No transition defined for {:?} in {:?}", event, state))]
pub struct InvalidTransition {
    pub state: State,
    pub event: Event,
}

pub type Result<T, E = InvalidTransition> = std::result::Result<T, E>;

/// Compute the transition for the given mode, state and event.
///
/// Returns the next state and the actions to execute.
/// Combinations outside the documented domain yield an error,
/// which the driver is expected to convert into an
/// [`InvalidPdu`](Event::InvalidPdu) event (for wire-triggered events)
/// or to reject locally (for misuse of the service primitives).
pub fn transition(mode: Mode, state: State, event: Event) -> Result<(State, &'static [Action])> {
    use Action::*;
    use Event::*;
    use State::*;

    let (next, actions): (State, &'static [Action]) = match (state, event) {
        // association establishment, requestor side
        (Sta1, AAssociateRequest) => (Sta4, &[Ae1IssueTransportConnect]),
        (Sta4, TransportConnectConfirm) => (Sta5, &[Ae2SendAssociateRq]),
        (Sta5, AAssociateAcReceived) => (Sta6, &[Ae3ConfirmAccept]),
        (Sta5, AAssociateRjReceived) => (Sta1, &[Ae4ConfirmRejectAndClose]),

        // association establishment, acceptor side
        (Sta1, TransportConnectIndication) => (Sta2, &[Ae5AcceptTransportStartArtim]),
        (Sta2, AAssociateRqReceived) => (Sta3, &[Ae6StopArtimIndicateAssociate]),
        (Sta3, AAssociateResponseAccept) => (Sta6, &[Ae7SendAssociateAc]),
        (Sta3, AAssociateResponseReject) => (Sta13, &[Ae8SendAssociateRjStartArtim]),

        // association PDUs outside their expected states
        (Sta2, AAssociateAcReceived)
        | (Sta2, AAssociateRjReceived)
        | (Sta2, PDataReceived)
        | (Sta2, AReleaseRqReceived)
        | (Sta2, AReleaseRpReceived) => (Sta13, &[Aa1SendAbortStartArtim]),
        (Sta3, AAssociateAcReceived)
        | (Sta3, AAssociateRjReceived)
        | (Sta3, AAssociateRqReceived)
        | (Sta3, PDataReceived)
        | (Sta3, AReleaseRqReceived)
        | (Sta3, AReleaseRpReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta5, AAssociateRqReceived)
        | (Sta5, PDataReceived)
        | (Sta5, AReleaseRqReceived)
        | (Sta5, AReleaseRpReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta6, AAssociateAcReceived)
        | (Sta6, AAssociateRjReceived)
        | (Sta6, AAssociateRqReceived)
        | (Sta6, AReleaseRpReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta7, AAssociateAcReceived)
        | (Sta7, AAssociateRjReceived)
        | (Sta7, AAssociateRqReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta8, AAssociateAcReceived)
        | (Sta8, AAssociateRjReceived)
        | (Sta8, AAssociateRqReceived)
        | (Sta8, PDataReceived)
        | (Sta8, AReleaseRqReceived)
        | (Sta8, AReleaseRpReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta9, AAssociateAcReceived)
        | (Sta9, AAssociateRjReceived)
        | (Sta9, AAssociateRqReceived)
        | (Sta9, PDataReceived)
        | (Sta9, AReleaseRqReceived)
        | (Sta9, AReleaseRpReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta10, AAssociateAcReceived)
        | (Sta10, AAssociateRjReceived)
        | (Sta10, AAssociateRqReceived)
        | (Sta10, PDataReceived)
        | (Sta10, AReleaseRqReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta11, AAssociateAcReceived)
        | (Sta11, AAssociateRjReceived)
        | (Sta11, AAssociateRqReceived)
        | (Sta11, PDataReceived)
        | (Sta11, AReleaseRqReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta12, AAssociateAcReceived)
        | (Sta12, AAssociateRjReceived)
        | (Sta12, AAssociateRqReceived)
        | (Sta12, PDataReceived)
        | (Sta12, AReleaseRqReceived)
        | (Sta12, AReleaseRpReceived) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta13, AAssociateAcReceived)
        | (Sta13, AAssociateRjReceived)
        | (Sta13, PDataReceived)
        | (Sta13, AReleaseRqReceived)
        | (Sta13, AReleaseRpReceived) => (Sta13, &[Aa6Ignore]),
        (Sta13, AAssociateRqReceived) => (Sta13, &[Aa7SendAbort]),

        // data transfer
        (Sta6, PDataRequest) => (Sta6, &[Dt1SendPData]),
        (Sta6, PDataReceived) => (Sta6, &[Dt2IndicatePData]),
        (Sta8, PDataRequest) => (Sta8, &[Ar7SendPData]),
        (Sta7, PDataReceived) => (Sta7, &[Ar6IndicatePData]),

        // orderly release
        (Sta6, AReleaseRequest) => (Sta7, &[Ar1SendReleaseRq]),
        (Sta6, AReleaseRqReceived) => (Sta8, &[Ar2IndicateRelease]),
        (Sta7, AReleaseRpReceived) => (Sta1, &[Ar3ConfirmReleaseAndClose]),
        (Sta8, AReleaseResponse) => (Sta13, &[Ar4SendReleaseRpStartArtim]),

        // release collision
        (Sta7, AReleaseRqReceived) => match mode {
            Mode::Acceptor => (Sta9, &[Ar8IndicateReleaseCollision]),
            Mode::Requestor => (Sta10, &[Ar8IndicateReleaseCollision]),
        },
        (Sta9, AReleaseResponse) => (Sta11, &[Ar9SendReleaseRp]),
        (Sta11, AReleaseRpReceived) => (Sta1, &[Ar3ConfirmReleaseAndClose]),
        (Sta10, AReleaseRpReceived) => (Sta12, &[Ar10ConfirmReleaseCollision]),
        (Sta12, AReleaseResponse) => (Sta13, &[Ar4SendReleaseRpStartArtim]),

        // local abort
        (Sta3, AAbortRequest) => (Sta13, &[Aa1SendAbortStartArtim]),
        (Sta4, AAbortRequest) => (Sta1, &[Aa2StopArtimAndClose]),
        (Sta5, AAbortRequest)
        | (Sta6, AAbortRequest)
        | (Sta7, AAbortRequest)
        | (Sta8, AAbortRequest)
        | (Sta9, AAbortRequest)
        | (Sta10, AAbortRequest)
        | (Sta11, AAbortRequest)
        | (Sta12, AAbortRequest) => (Sta13, &[Aa1SendAbortStartArtim]),

        // peer abort: the association is dropped without acknowledgement
        (Sta2, AAbortReceived) => (Sta1, &[Aa2StopArtimAndClose]),
        (Sta3, AAbortReceived)
        | (Sta5, AAbortReceived)
        | (Sta6, AAbortReceived)
        | (Sta7, AAbortReceived)
        | (Sta8, AAbortReceived)
        | (Sta9, AAbortReceived)
        | (Sta10, AAbortReceived)
        | (Sta11, AAbortReceived)
        | (Sta12, AAbortReceived) => (Sta1, &[Aa3IndicateAbortAndClose]),
        (Sta13, AAbortReceived) => (Sta1, &[Aa2StopArtimAndClose]),

        // transport failure
        (Sta2, TransportClosed) => (Sta1, &[Aa5StopArtim]),
        (Sta3, TransportClosed)
        | (Sta4, TransportClosed)
        | (Sta5, TransportClosed)
        | (Sta6, TransportClosed)
        | (Sta7, TransportClosed)
        | (Sta8, TransportClosed)
        | (Sta9, TransportClosed)
        | (Sta10, TransportClosed)
        | (Sta11, TransportClosed)
        | (Sta12, TransportClosed) => (Sta1, &[Aa4IndicateProviderAbort]),
        (Sta13, TransportClosed) => (Sta1, &[Ar5StopArtim]),

        // ARTIM expiry closes the connection without an abort PDU
        (Sta2, ArtimExpired) | (Sta13, ArtimExpired) => (Sta1, &[Aa2StopArtimAndClose]),

        // malformed or unrecognized PDUs
        (Sta2, InvalidPdu) => (Sta13, &[Aa1SendAbortStartArtim]),
        (Sta3, InvalidPdu)
        | (Sta5, InvalidPdu)
        | (Sta6, InvalidPdu)
        | (Sta7, InvalidPdu)
        | (Sta8, InvalidPdu)
        | (Sta9, InvalidPdu)
        | (Sta10, InvalidPdu)
        | (Sta11, InvalidPdu)
        | (Sta12, InvalidPdu) => (Sta13, &[Aa8SendAbortIndicateStartArtim]),
        (Sta13, InvalidPdu) => (Sta13, &[Aa7SendAbort]),

        (state, event) => return InvalidTransitionSnafu { state, event }.fail(),
    };

    Ok((next, actions))
}

/// A running instance of the protocol machine:
/// the current state plus the association mode.
#[derive(Debug, Clone, Copy)]
pub struct Machine {
    mode: Mode,
    state: State,
}

impl Machine {
    /// Create a machine in the idle state.
    pub fn new(mode: Mode) -> Self {
        Machine {
            mode,
            state: State::Sta1,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the machine is in the data transfer state.
    pub fn is_established(&self) -> bool {
        self.state == State::Sta6
    }

    /// Whether the machine has returned to (or never left) idle.
    pub fn is_idle(&self) -> bool {
        self.state == State::Sta1
    }

    /// Advance the machine with the given event,
    /// returning the actions the driver must now execute.
    pub fn step(&mut self, event: Event) -> Result<&'static [Action]> {
        let (next, actions) = transition(self.mode, self.state, event)?;
        self.state = next;
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Action::*;
    use Event::*;
    use State::*;

    fn drive(mode: Mode, events: &[Event]) -> Machine {
        let mut machine = Machine::new(mode);
        for &event in events {
            machine.step(event).unwrap();
        }
        machine
    }

    #[test]
    fn requestor_establishment_and_release() {
        let mut machine = Machine::new(Mode::Requestor);
        assert_eq!(
            machine.step(AAssociateRequest).unwrap(),
            &[Ae1IssueTransportConnect]
        );
        assert_eq!(machine.state(), Sta4);
        machine.step(TransportConnectConfirm).unwrap();
        assert_eq!(machine.state(), Sta5);
        machine.step(AAssociateAcReceived).unwrap();
        assert!(machine.is_established());

        machine.step(AReleaseRequest).unwrap();
        assert_eq!(machine.state(), Sta7);
        assert_eq!(
            machine.step(AReleaseRpReceived).unwrap(),
            &[Ar3ConfirmReleaseAndClose]
        );
        assert!(machine.is_idle());
    }

    #[test]
    fn requestor_rejected() {
        let mut machine = drive(
            Mode::Requestor,
            &[AAssociateRequest, TransportConnectConfirm],
        );
        assert_eq!(
            machine.step(AAssociateRjReceived).unwrap(),
            &[Ae4ConfirmRejectAndClose]
        );
        assert!(machine.is_idle());
    }

    #[test]
    fn acceptor_establishment() {
        let mut machine = Machine::new(Mode::Acceptor);
        assert_eq!(
            machine.step(TransportConnectIndication).unwrap(),
            &[Ae5AcceptTransportStartArtim]
        );
        machine.step(AAssociateRqReceived).unwrap();
        assert_eq!(machine.state(), Sta3);
        machine.step(AAssociateResponseAccept).unwrap();
        assert!(machine.is_established());
    }

    #[test]
    fn acceptor_rejecting_goes_through_sta13() {
        let mut machine = drive(
            Mode::Acceptor,
            &[TransportConnectIndication, AAssociateRqReceived],
        );
        assert_eq!(
            machine.step(AAssociateResponseReject).unwrap(),
            &[Ae8SendAssociateRjStartArtim]
        );
        assert_eq!(machine.state(), Sta13);
        machine.step(TransportClosed).unwrap();
        assert!(machine.is_idle());
    }

    #[test]
    fn release_collision_requestor_path() {
        // the requestor-role peer waits for the peer response first
        let mut machine = drive(
            Mode::Requestor,
            &[
                AAssociateRequest,
                TransportConnectConfirm,
                AAssociateAcReceived,
                AReleaseRequest,
            ],
        );
        assert_eq!(
            machine.step(AReleaseRqReceived).unwrap(),
            &[Ar8IndicateReleaseCollision]
        );
        assert_eq!(machine.state(), Sta10);
        machine.step(AReleaseRpReceived).unwrap();
        assert_eq!(machine.state(), Sta12);
        machine.step(AReleaseResponse).unwrap();
        assert_eq!(machine.state(), Sta13);
        machine.step(TransportClosed).unwrap();
        assert!(machine.is_idle());
    }

    #[test]
    fn release_collision_acceptor_path() {
        // the acceptor-role peer responds first, then waits
        let mut machine = drive(
            Mode::Acceptor,
            &[
                TransportConnectIndication,
                AAssociateRqReceived,
                AAssociateResponseAccept,
                AReleaseRequest,
            ],
        );
        machine.step(AReleaseRqReceived).unwrap();
        assert_eq!(machine.state(), Sta9);
        assert_eq!(machine.step(AReleaseResponse).unwrap(), &[Ar9SendReleaseRp]);
        assert_eq!(machine.state(), Sta11);
        machine.step(AReleaseRpReceived).unwrap();
        assert!(machine.is_idle());
    }

    #[test]
    fn peer_abort_drops_without_acknowledgement() {
        for state_events in [
            &[AAssociateRequest, TransportConnectConfirm][..],
            &[
                AAssociateRequest,
                TransportConnectConfirm,
                AAssociateAcReceived,
            ][..],
            &[
                AAssociateRequest,
                TransportConnectConfirm,
                AAssociateAcReceived,
                AReleaseRequest,
            ][..],
        ] {
            let mut machine = drive(Mode::Requestor, state_events);
            let actions = machine.step(AAbortReceived).unwrap();
            assert_eq!(actions, &[Aa3IndicateAbortAndClose]);
            assert!(machine.is_idle());
        }
    }

    #[test]
    fn artim_expiry_closes_without_abort_pdu() {
        let mut machine = drive(Mode::Acceptor, &[TransportConnectIndication]);
        assert_eq!(machine.step(ArtimExpired).unwrap(), &[Aa2StopArtimAndClose]);
        assert!(machine.is_idle());

        let mut machine = drive(
            Mode::Acceptor,
            &[
                TransportConnectIndication,
                AAssociateRqReceived,
                AAssociateResponseReject,
            ],
        );
        assert_eq!(machine.state(), Sta13);
        assert_eq!(machine.step(ArtimExpired).unwrap(), &[Aa2StopArtimAndClose]);
        assert!(machine.is_idle());
    }

    #[test]
    fn invalid_pdu_aborts_established_association() {
        let mut machine = drive(
            Mode::Requestor,
            &[
                AAssociateRequest,
                TransportConnectConfirm,
                AAssociateAcReceived,
            ],
        );
        assert_eq!(
            machine.step(InvalidPdu).unwrap(),
            &[Aa8SendAbortIndicateStartArtim]
        );
        assert_eq!(machine.state(), Sta13);
    }

    #[test]
    fn undocumented_combinations_are_errors() {
        assert!(transition(Mode::Requestor, Sta1, PDataRequest).is_err());
        assert!(transition(Mode::Requestor, Sta1, InvalidPdu).is_err());
        assert!(transition(Mode::Acceptor, Sta4, AAssociateRqReceived).is_err());
        assert!(transition(Mode::Requestor, Sta5, PDataRequest).is_err());
    }

    #[test]
    fn pdata_flows_in_sta6_and_during_release() {
        let mut machine = drive(
            Mode::Requestor,
            &[
                AAssociateRequest,
                TransportConnectConfirm,
                AAssociateAcReceived,
            ],
        );
        assert_eq!(machine.step(PDataRequest).unwrap(), &[Dt1SendPData]);
        assert_eq!(machine.step(PDataReceived).unwrap(), &[Dt2IndicatePData]);

        // data may still arrive while we wait for the release response
        machine.step(AReleaseRequest).unwrap();
        assert_eq!(machine.step(PDataReceived).unwrap(), &[Ar6IndicatePData]);
        assert_eq!(machine.state(), Sta7);
    }
}
