//! DICOM associations.
//!
//! This module contains the association driver shared by the
//! [requestor](requestor) and [acceptor](acceptor) sides:
//! a cooperative reactor which owns the socket and the protocol
//! machine, decodes PDUs into machine events, executes the resulting
//! actions, maintains the ARTIM / DIMSE / network timers, and feeds
//! completed DIMSE messages into the per-association message queue
//! that the service APIs consume.

use std::collections::VecDeque;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use snafu::{ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::config::{AeConfig, NetworkTimeoutResponse};
use crate::dimse::codec::Reassembler;
use crate::dimse::DimseMessage;
use crate::events::{EventRegistry, Notification};
use crate::machine::{Action, Event, Machine, Mode, State};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, PDataValue,
    Pdu, UserVariableItem,
};
use crate::presentation::ContextTable;

pub mod acceptor;
pub mod requestor;

pub use acceptor::{AcceptorAssociation, AcceptorOptions};
pub use requestor::{RequestorAssociation, RequestorOptions};

/// How long a single reactor iteration waits on the socket
/// before re-checking timers.
const POLL_QUANTUM: Duration = Duration::from_millis(50);

/// Read timeout applied while a PDU is being received,
/// when no network timeout is configured.
const STALLED_PDU_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax,

    /// could not connect to peer
    Connect { source: std::io::Error },

    /// could not configure the socket
    SocketOption { source: std::io::Error },

    /// invalid local configuration
    #[snafu(display("Invalid local configuration"))]
    Configuration {
        #[snafu(source(from(crate::config::Error, Box::from)))]
        source: Box<crate::config::Error>,
    },

    #[snafu(display("Outgoing data set is missing element {}", name))]
    MissingRequiredElement { name: &'static str },

    /// failed to encode PDU message
    SendPdu {
        #[snafu(source(from(crate::pdu::writer::Error, Box::from)))]
        source: Box<crate::pdu::writer::Error>,
    },

    /// failed to send PDU message on the wire
    WireSend { source: std::io::Error },

    /// failed to receive PDU message
    ReceivePdu {
        #[snafu(source(from(crate::pdu::reader::Error, Box::from)))]
        source: Box<crate::pdu::reader::Error>,
    },

    #[snafu(display(
        "PDU is too large to be sent to peer: length {}, maximum is {}",
        length,
        maximum
    ))]
    SendTooLongPdu { length: usize, maximum: u32 },

    #[snafu(display("unexpected PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu { pdu: Box<Pdu> },

    /// the association is not established
    NotEstablished,

    /// the association was rejected by the peer
    #[snafu(display("association rejected by the peer ({:?})", association_rj))]
    Rejected { association_rj: AssociationRJ },

    /// the association was aborted
    Aborted,

    #[snafu(display("timed out waiting for {}", operation))]
    Timeout { operation: &'static str },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts,

    #[snafu(display("no suitable presentation context"))]
    Presentation {
        #[snafu(source(from(crate::presentation::Error, Box::from)))]
        source: Box<crate::presentation::Error>,
    },

    /// DIMSE layer failure
    Dimse {
        #[snafu(source(from(crate::dimse::Error, Box::from)))]
        source: Box<crate::dimse::Error>,
    },

    /// message fragmentation failure
    Fragment {
        #[snafu(source(from(crate::dimse::codec::Error, Box::from)))]
        source: Box<crate::dimse::codec::Error>,
    },

    #[snafu(display(
        "data set in transfer syntax {} cannot be sent over any accepted context of {}",
        transfer_syntax,
        sop_class_uid
    ))]
    NoCompatibleContext {
        sop_class_uid: String,
        transfer_syntax: String,
    },

    #[snafu(display(
        "cannot re-encode data set from transfer syntax {} to {}",
        from,
        to
    ))]
    UnsupportedConversion { from: String, to: String },

    #[snafu(display("a context ID or a query model is required"))]
    MissingCancelTarget,

    #[snafu(display("query model does not define a {} service", operation))]
    UnsupportedQueryModel { operation: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why an association ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminus {
    /// orderly release completed
    Released,
    /// the association was aborted, by either side
    Aborted,
    /// the peer rejected the association request
    Rejected(AssociationRJ),
}

/// The association driver: socket, protocol machine and queues.
///
/// Both association kinds wrap one of these. All waiting happens
/// through [`pump`](Link::pump): one reactor iteration which reads at
/// most one PDU and fires due timers. API calls that need a DIMSE
/// message block on [`wait_message`](Link::wait_message), which keeps
/// pumping the reactor while the caller waits; this is the reactor
/// checkpoint that lets sub-operations arrive while a response is
/// pending.
pub(crate) struct Link {
    socket: TcpStream,
    machine: Machine,
    reassembler: Reassembler,
    inbox: VecDeque<DimseMessage>,
    /// the negotiated presentation contexts; empty before establishment
    pub table: ContextTable,
    /// the maximum PDU body length the peer can receive
    pub peer_max_pdu_length: u32,
    /// the maximum PDU body length we admit on receive
    read_limit: u32,
    strict: bool,
    pub config: AeConfig,
    pub registry: EventRegistry,
    pub peer_ae_title: String,
    pub peer_user_variables: Vec<UserVariableItem>,
    terminus: Option<Terminus>,
    artim_deadline: Option<Instant>,
    last_activity: Instant,
    /// PDU staged for the next send-type action
    outgoing: Option<Pdu>,
    /// PDU being processed by the current receive-type action
    incoming: Option<Pdu>,
    /// reason used when an abort PDU is emitted by a provider action
    provider_abort_reason: AbortRQServiceProviderReason,
    /// whether the next abort PDU carries the service-user source
    user_abort: bool,
    /// the peer has asked for release and awaits our response
    pub peer_release_requested: bool,
    /// the association acceptance PDU, captured at establishment
    pub established_ac: Option<crate::pdu::AssociationAC>,
    /// the association request PDU, captured on indication
    pub association_rq: Option<crate::pdu::AssociationRQ>,
    closed: bool,
    write_buffer: Vec<u8>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("state", &self.machine.state())
            .field("mode", &self.machine.mode())
            .field("terminus", &self.terminus)
            .field("peer_ae_title", &self.peer_ae_title)
            .finish()
    }
}

impl Link {
    pub fn new(socket: TcpStream, mode: Mode, config: AeConfig, registry: EventRegistry) -> Self {
        let read_limit = config.effective_read_limit();
        Link {
            socket,
            machine: Machine::new(mode),
            reassembler: Reassembler::new(),
            inbox: VecDeque::new(),
            table: ContextTable::default(),
            peer_max_pdu_length: crate::pdu::DEFAULT_MAX_PDU,
            read_limit,
            strict: true,
            config,
            registry,
            peer_ae_title: String::new(),
            peer_user_variables: Vec::new(),
            terminus: None,
            artim_deadline: None,
            last_activity: Instant::now(),
            outgoing: None,
            incoming: None,
            provider_abort_reason: AbortRQServiceProviderReason::UnexpectedPdu,
            user_abort: false,
            peer_release_requested: false,
            established_ac: None,
            association_rq: None,
            closed: false,
            write_buffer: Vec::new(),
        }
    }

    pub fn strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn mode(&self) -> Mode {
        self.machine.mode()
    }

    pub fn terminus(&self) -> Option<&Terminus> {
        self.terminus.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.terminus.is_none() && self.machine.is_established()
    }

    pub fn is_released(&self) -> bool {
        matches!(self.terminus, Some(Terminus::Released))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.terminus, Some(Terminus::Aborted))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.terminus, Some(Terminus::Rejected(_)))
    }

    pub fn rejection(&self) -> Option<&AssociationRJ> {
        match &self.terminus {
            Some(Terminus::Rejected(rj)) => Some(rj),
            _ => None,
        }
    }

    pub fn notify(&mut self, event: Notification<'_>) {
        self.registry.notify(&event);
    }

    /// Advance the machine with a locally originated event,
    /// staging `outgoing` for any send action it triggers.
    pub fn step_local(&mut self, event: Event, outgoing: Option<Pdu>) -> Result<()> {
        self.outgoing = outgoing;
        match self.machine.step(event) {
            Ok(actions) => self.execute(actions),
            Err(e) => {
                debug!("Refusing local primitive: {}", e);
                self.outgoing = None;
                Ok(())
            }
        }
    }

    fn execute(&mut self, actions: &'static [Action]) -> Result<()> {
        for &action in actions {
            self.execute_one(action)?;
        }
        Ok(())
    }

    fn execute_one(&mut self, action: Action) -> Result<()> {
        use Action::*;
        match action {
            Ae1IssueTransportConnect => {
                // the connection is opened by the requestor
                // before Evt2 is delivered
            }
            Ae2SendAssociateRq | Ae7SendAssociateAc | Dt1SendPData | Ar7SendPData
            | Ar1SendReleaseRq | Ar9SendReleaseRp => {
                let pdu = self.outgoing.take().expect("send action without staged PDU");
                self.send_raw(&pdu)?;
            }
            Ae8SendAssociateRjStartArtim | Ar4SendReleaseRpStartArtim => {
                let pdu = self.outgoing.take().expect("send action without staged PDU");
                self.send_raw(&pdu)?;
                self.arm_artim();
            }
            Ae3ConfirmAccept => {
                if let Some(Pdu::AssociationAC(ac)) = self.incoming.take() {
                    self.established_ac = Some(ac);
                }
            }
            Ae4ConfirmRejectAndClose => {
                if let Some(Pdu::AssociationRJ(rj)) = self.incoming.take() {
                    self.set_terminus(Terminus::Rejected(rj));
                }
                self.close();
            }
            Ae5AcceptTransportStartArtim => {
                self.arm_artim();
            }
            Ae6StopArtimIndicateAssociate => {
                self.artim_deadline = None;
                if let Some(Pdu::AssociationRQ(rq)) = self.incoming.take() {
                    self.association_rq = Some(rq);
                }
            }
            Dt2IndicatePData | Ar6IndicatePData => {
                if let Some(Pdu::PData { data }) = self.incoming.take() {
                    self.indicate_pdata(data)?;
                }
            }
            Ar2IndicateRelease | Ar8IndicateReleaseCollision => {
                self.peer_release_requested = true;
            }
            Ar3ConfirmReleaseAndClose => {
                self.set_terminus(Terminus::Released);
                self.close();
            }
            Ar5StopArtim | Aa5StopArtim => {
                self.artim_deadline = None;
            }
            Ar10ConfirmReleaseCollision => {
                // the release confirmation of a collision; the local
                // release response still follows (Evt14)
            }
            Aa1SendAbortStartArtim => {
                let source = if self.user_abort {
                    AbortRQSource::ServiceUser
                } else {
                    AbortRQSource::ServiceProvider(self.provider_abort_reason)
                };
                self.send_raw(&Pdu::AbortRQ { source })?;
                self.arm_artim();
            }
            Aa2StopArtimAndClose => {
                self.artim_deadline = None;
                self.close();
            }
            Aa3IndicateAbortAndClose => {
                self.set_terminus(Terminus::Aborted);
                self.close();
            }
            Aa4IndicateProviderAbort => {
                self.set_terminus(Terminus::Aborted);
                self.close();
            }
            Aa6Ignore => {}
            Aa7SendAbort => {
                let source = AbortRQSource::ServiceProvider(self.provider_abort_reason);
                self.send_raw(&Pdu::AbortRQ { source })?;
            }
            Aa8SendAbortIndicateStartArtim => {
                let source = AbortRQSource::ServiceProvider(self.provider_abort_reason);
                self.send_raw(&Pdu::AbortRQ { source })?;
                self.set_terminus(Terminus::Aborted);
                self.arm_artim();
            }
        }
        Ok(())
    }

    fn arm_artim(&mut self) {
        self.artim_deadline = self
            .config
            .acse_timeout
            .map(|timeout| Instant::now() + timeout);
    }

    fn set_terminus(&mut self, terminus: Terminus) {
        // the first terminal outcome wins;
        // abort after release (and vice versa) stays a no-op
        if self.terminus.is_none() {
            match &terminus {
                Terminus::Released => self.notify(Notification::AssociationReleased),
                Terminus::Aborted => self.notify(Notification::AssociationAborted),
                Terminus::Rejected(_) => self.notify(Notification::AssociationRejected),
            }
            self.terminus = Some(terminus);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.socket.shutdown(Shutdown::Both);
            self.closed = true;
            self.notify(Notification::ConnectionClosed);
        }
    }

    /// Write a PDU to the wire.
    pub fn send_raw(&mut self, pdu: &Pdu) -> Result<()> {
        if let Pdu::PData { data } = pdu {
            let length: usize = data
                .iter()
                .map(|pdv| pdv.data.len() + crate::dimse::codec::PDV_HEADER_LENGTH as usize)
                .sum();
            if self.peer_max_pdu_length != u32::MAX
                && length > self.peer_max_pdu_length as usize
            {
                return SendTooLongPduSnafu {
                    length,
                    maximum: self.peer_max_pdu_length,
                }
                .fail();
            }
        }
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(SendPduSnafu)?;
        self.socket
            .write_all(&self.write_buffer)
            .context(WireSendSnafu)?;
        self.last_activity = Instant::now();
        self.notify(Notification::PduSent {
            description: pdu.short_description(),
        });
        Ok(())
    }

    /// Map a received PDU to its protocol machine event.
    fn pdu_event(pdu: &Pdu) -> Event {
        match pdu {
            Pdu::AssociationAC(_) => Event::AAssociateAcReceived,
            Pdu::AssociationRJ(_) => Event::AAssociateRjReceived,
            Pdu::AssociationRQ(_) => Event::AAssociateRqReceived,
            Pdu::PData { .. } => Event::PDataReceived,
            Pdu::ReleaseRQ => Event::AReleaseRqReceived,
            Pdu::ReleaseRP => Event::AReleaseRpReceived,
            Pdu::AbortRQ { .. } => Event::AAbortReceived,
            Pdu::Unknown { .. } => Event::InvalidPdu,
        }
    }

    /// Feed one received PDU through the machine.
    pub fn process_pdu(&mut self, pdu: Pdu) -> Result<()> {
        self.last_activity = Instant::now();
        self.notify(Notification::PduReceived {
            description: pdu.short_description(),
        });

        let event = Self::pdu_event(&pdu);
        self.provider_abort_reason = match &pdu {
            Pdu::Unknown { pdu_type, .. } => {
                warn!("Received unrecognized PDU type {:#04x}", pdu_type);
                AbortRQServiceProviderReason::UnrecognizedPdu
            }
            _ => AbortRQServiceProviderReason::UnexpectedPdu,
        };
        self.user_abort = false;
        self.incoming = Some(pdu);

        let result = match self.machine.step(event) {
            Ok(actions) => self.execute(actions),
            Err(e) => {
                warn!("{}; treating as invalid PDU", e);
                self.raise_invalid_pdu(AbortRQServiceProviderReason::UnexpectedPdu)
            }
        };
        self.incoming = None;
        result
    }

    /// Raise Evt19 after a malformed or out-of-place PDU.
    fn raise_invalid_pdu(&mut self, reason: AbortRQServiceProviderReason) -> Result<()> {
        match self.machine.state() {
            // decode failures while idle or already winding down
            // do not produce another abort
            State::Sta1 | State::Sta13 => Ok(()),
            _ => {
                self.provider_abort_reason = reason;
                self.user_abort = false;
                match self.machine.step(Event::InvalidPdu) {
                    Ok(actions) => self.execute(actions),
                    Err(_) => {
                        self.set_terminus(Terminus::Aborted);
                        self.close();
                        Ok(())
                    }
                }
            }
        }
    }

    /// Deliver P-DATA values to the reassembler,
    /// aborting on traffic over unaccepted contexts.
    fn indicate_pdata(&mut self, values: Vec<PDataValue>) -> Result<()> {
        for pdv in values {
            if !self.table.is_accepted(pdv.presentation_context_id) {
                warn!(
                    "Received DIMSE message with invalid or rejected context ID ({})",
                    pdv.presentation_context_id
                );
                return self.abort_with_provider_reason(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                );
            }
            match self.reassembler.push(pdv) {
                Ok(Some(message)) => {
                    self.notify(Notification::DimseReceived {
                        context_id: message.context_id,
                    });
                    self.inbox.push_back(message);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not reassemble DIMSE message: {}", e);
                    return self.abort_with_provider_reason(
                        AbortRQServiceProviderReason::InvalidPduParameter,
                    );
                }
            }
        }
        Ok(())
    }

    fn abort_with_provider_reason(
        &mut self,
        reason: AbortRQServiceProviderReason,
    ) -> Result<()> {
        self.user_abort = false;
        self.provider_abort_reason = reason;
        self.do_abort()
    }

    /// Abort the association from the local side. Idempotent;
    /// a no-op after release, rejection or a previous abort.
    pub fn local_abort(&mut self) -> Result<()> {
        if self.terminus.is_some() {
            return Ok(());
        }
        self.user_abort = true;
        self.do_abort()
    }

    fn do_abort(&mut self) -> Result<()> {
        if self.terminus.is_some() {
            self.close();
            return Ok(());
        }
        if let Ok(actions) = self.machine.step(Event::AAbortRequest) {
            // failures to send the abort PDU are irrelevant at this point
            let _ = self.execute(actions);
        }
        self.set_terminus(Terminus::Aborted);
        self.close();
        // a closed transport brings the machine back to idle
        if self.machine.state() != State::Sta1 {
            let _ = self.machine.step(Event::TransportClosed);
        }
        self.artim_deadline = None;
        self.reassembler.clear();
        Ok(())
    }

    /// Whether the socket has a PDU (or EOF) waiting.
    fn poll_readable(&mut self, quantum: Duration) -> std::io::Result<Option<bool>> {
        self.socket.set_read_timeout(Some(quantum))?;
        let mut probe = [0u8; 1];
        match self.socket.peek(&mut probe) {
            // EOF: the peer closed the connection
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(true)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(Some(false))
            }
            Err(e) => Err(e),
        }
    }

    /// One reactor iteration: fire due timers
    /// and read at most one PDU from the wire.
    pub fn pump(&mut self, quantum: Duration) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        // ARTIM
        if let Some(deadline) = self.artim_deadline {
            if Instant::now() >= deadline {
                self.artim_deadline = None;
                if matches!(self.machine.state(), State::Sta2 | State::Sta13) {
                    debug!("ARTIM timer expired in {:?}", self.machine.state());
                    if let Ok(actions) = self.machine.step(Event::ArtimExpired) {
                        self.execute(actions)?;
                    }
                    return Ok(());
                }
            }
        }

        // idle wire timeout on an established association
        if self.machine.is_established() {
            if let Some(network_timeout) = self.config.network_timeout {
                if self.last_activity.elapsed() >= network_timeout {
                    match self.config.network_timeout_response {
                        NetworkTimeoutResponse::Abort => {
                            warn!("Network timeout expired, aborting association");
                            return self.local_abort();
                        }
                        NetworkTimeoutResponse::Release => {
                            debug!("Network timeout expired, requesting release");
                            self.step_local(Event::AReleaseRequest, Some(Pdu::ReleaseRQ))?;
                            self.last_activity = Instant::now();
                            return Ok(());
                        }
                    }
                }
            }
        }

        match self.poll_readable(quantum).context(SocketOptionSnafu)? {
            Some(true) => {
                // commit to reading a whole PDU
                let read_timeout = self.config.network_timeout.unwrap_or(STALLED_PDU_TIMEOUT);
                self.socket
                    .set_read_timeout(Some(read_timeout))
                    .context(SocketOptionSnafu)?;
                match read_pdu(&mut self.socket, self.read_limit, self.strict) {
                    Ok(pdu) => self.process_pdu(pdu),
                    Err(crate::pdu::reader::Error::NoPduAvailable { .. }) => {
                        self.transport_closed()
                    }
                    Err(e) => {
                        warn!("Could not read PDU: {}", e);
                        self.raise_invalid_pdu(
                            AbortRQServiceProviderReason::UnrecognizedPduParameter,
                        )
                    }
                }
            }
            Some(false) => Ok(()),
            None => self.transport_closed(),
        }
    }

    fn transport_closed(&mut self) -> Result<()> {
        trace!("Transport connection closed by peer");
        match self.machine.step(Event::TransportClosed) {
            Ok(actions) => {
                let result = self.execute(actions);
                self.close();
                result
            }
            Err(_) => {
                self.close();
                Ok(())
            }
        }
    }

    /// Block until a DIMSE message arrives,
    /// the association terminates, or the wait times out.
    ///
    /// A timeout aborts the association, after which the caller
    /// observes `None` and a terminal state of aborted.
    pub fn wait_message(&mut self, timeout: Option<Duration>) -> Result<Option<DimseMessage>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            if self.terminus.is_some() || self.closed {
                return Ok(None);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    warn!("DIMSE timeout expired, aborting association");
                    self.local_abort()?;
                    return Ok(None);
                }
                let remaining = deadline - now;
                self.pump(remaining.min(POLL_QUANTUM))?;
            } else {
                self.pump(POLL_QUANTUM)?;
            }
        }
    }

    /// Put a message back at the front of the queue.
    pub fn unget_message(&mut self, message: DimseMessage) {
        self.inbox.push_front(message);
    }

    /// Run one reactor iteration and pop a completed message, if any.
    ///
    /// Unlike [`wait_message`](Self::wait_message), an empty result
    /// carries no timeout semantics; idle time is only bounded by
    /// the network timeout inside the reactor.
    pub fn poll_message(&mut self, quantum: Duration) -> Result<Option<DimseMessage>> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(message));
        }
        if self.terminus.is_some() || self.closed {
            return Ok(None);
        }
        self.pump(quantum)?;
        Ok(self.inbox.pop_front())
    }

    /// Check for a C-CANCEL of the given operation,
    /// consuming it from the queue when found.
    pub fn take_cancel(&mut self, message_id: u16) -> Result<bool> {
        // a brief poll so that a cancel sent mid-operation is seen
        self.pump(Duration::from_millis(1))?;
        let position = self.inbox.iter().position(|m| {
            matches!(
                m.command_field(),
                Ok(crate::dimse::CommandField::CCancelRq)
            ) && m
                .message_id_being_responded_to()
                .map(|id| id == message_id)
                .unwrap_or(true)
        });
        if let Some(position) = position {
            self.inbox.remove(position);
            return Ok(true);
        }
        Ok(false)
    }

    /// Send a DIMSE message over the given context.
    pub fn send_message(
        &mut self,
        context_id: u8,
        command: &[u8],
        data: Option<&[u8]>,
    ) -> Result<()> {
        if !self.is_established() {
            return NotEstablishedSnafu.fail();
        }
        let pdus = crate::dimse::codec::fragment_message(
            context_id,
            command,
            data,
            self.peer_max_pdu_length,
        )
        .context(FragmentSnafu)?;
        for pdu in pdus {
            self.step_local(Event::PDataRequest, Some(pdu))?;
        }
        self.notify(Notification::DimseSent { context_id });
        Ok(())
    }

    /// Perform or complete an orderly release.
    ///
    /// Valid in the established state; also answers a release
    /// initiated by the peer. A no-op in terminal states.
    pub fn local_release(&mut self) -> Result<()> {
        if self.terminus.is_some() {
            return Ok(());
        }

        if self.peer_release_requested && self.machine.state() == State::Sta8 {
            return self.respond_release();
        }

        if self.machine.state() != State::Sta6 {
            return Ok(());
        }

        self.step_local(Event::AReleaseRequest, Some(Pdu::ReleaseRQ))?;

        let deadline = self.config.acse_timeout.map(|t| Instant::now() + t);
        loop {
            match self.machine.state() {
                // Ar3 fired: release confirmed
                State::Sta1 => {
                    self.set_terminus(Terminus::Released);
                    self.close();
                    return Ok(());
                }
                // release collision, our turn to respond
                State::Sta9 | State::Sta12 => {
                    return self.respond_release();
                }
                _ => {}
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("Timed out waiting for A-RELEASE-RP, aborting");
                    self.local_abort()?;
                    return TimeoutSnafu {
                        operation: "A-RELEASE-RP",
                    }
                    .fail();
                }
            }
            self.pump(POLL_QUANTUM)?;
        }
    }

    /// Answer an incoming C-STORE request through
    /// the registered intervention handler.
    ///
    /// This serves both the acceptor's storage service and the
    /// requestor acting as storage SCP for C-GET or same-association
    /// C-MOVE sub-operations. The status mapping: a context that was
    /// not accepted in the SCP role yields 0x0122; a missing or
    /// failing handler yields 0xC211; a handler producing something
    /// other than a status yields 0xC002; a status data set without a
    /// *Status* element yields 0xC001; a data set that cannot be
    /// decoded yields 0xC210.
    pub fn respond_store(&mut self, message: &DimseMessage) -> Result<()> {
        use crate::dimse::commands::{CStoreRsp, Command};
        use crate::events::{HandlerOutcome, InterventionKind, ServiceRequest};

        let context = self.table.get(message.context_id).cloned();
        let message_id = message.message_id().unwrap_or(0);
        let sop_class = message.affected_sop_class_uid();
        let sop_instance = message.affected_sop_instance_uid();

        let status = match context {
            Some(pc) if pc.scp => {
                if self.registry.has_intervention(InterventionKind::CStore) {
                    match message.decode_data(&pc.transfer_syntax) {
                        Err(e) => {
                            warn!("Could not decode C-STORE data set: {}", e);
                            0xC210
                        }
                        Ok(dataset) => {
                            let request = ServiceRequest {
                                kind: InterventionKind::CStore,
                                context_id: pc.id,
                                abstract_syntax: &pc.abstract_syntax,
                                command: &message.command,
                                dataset: dataset.as_ref(),
                            };
                            let handler = self
                                .registry
                                .intervention(InterventionKind::CStore)
                                .expect("checked above");
                            match handler.handle(request) {
                                Err(e) => {
                                    warn!("C-STORE handler failed: {}", e);
                                    0xC211
                                }
                                Ok(HandlerOutcome::Status(status)) => status,
                                Ok(HandlerOutcome::StatusDataset(ds)) => ds
                                    .get(dicom_dictionary_std::tags::STATUS)
                                    .and_then(|el| el.to_int::<u16>().ok())
                                    .unwrap_or(0xC001),
                                Ok(HandlerOutcome::Dataset(status, _)) => status,
                                Ok(_) => 0xC002,
                            }
                        }
                    }
                } else {
                    warn!("No C-STORE handler registered");
                    0xC211
                }
            }
            // SOP class not supported in this role
            _ => 0x0122,
        };

        let rsp = CStoreRsp::builder()
            .message_id_being_responded_to(message_id)
            .maybe_affected_sop_class_uid(sop_class.as_deref())
            .maybe_affected_sop_instance_uid(sop_instance.as_deref())
            .status(status)
            .build();
        let command = rsp.encode(false).context(DimseSnafu)?;
        self.send_message(message.context_id, &command, None)
    }

    /// Answer a peer-initiated release and wait for the close.
    fn respond_release(&mut self) -> Result<()> {
        self.step_local(Event::AReleaseResponse, Some(Pdu::ReleaseRP))?;

        // Sta9 sends without arming ARTIM and waits for the peer reply;
        // Sta8/Sta12 move to Sta13 and wait for the transport to close
        let deadline = self.config.acse_timeout.map(|t| Instant::now() + t);
        while self.machine.state() != State::Sta1 && !self.closed {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            self.pump(POLL_QUANTUM)?;
            if self.terminus.is_some() {
                break;
            }
        }
        self.set_terminus(Terminus::Released);
        self.close();
        Ok(())
    }
}
