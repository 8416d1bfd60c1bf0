//! Association acceptor.
//!
//! [`AcceptorOptions`] evaluates an incoming association request on
//! an accepted TCP stream; the resulting [`AcceptorAssociation`]
//! serves DIMSE requests through the registered intervention
//! handlers, including the store sub-operations of C-GET and the
//! sub-association of C-MOVE. Listening and accepting connections is
//! the embedding application's business; this module starts where
//! `TcpListener::accept` ends.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::acse::{evaluate_association_rq, negotiated_max_pdu};
use crate::config::{AeConfig, NetworkTimeoutResponse};
use crate::dimse::commands::{
    CEchoRsp, CFindRsp, CGetRsp, CMoveRsp, CStoreRq, Command, NActionRsp, NCreateRsp, NDeleteRsp,
    NEventReportRsp, NGetRsp, NSetRsp, SubOperationCounts,
};
use crate::dimse::{
    encode_dataset, is_terminal, status_type, CommandField, DimseMessage, Priority, StatusType,
};
use crate::events::{
    EventRegistry, HandlerOutcome, InterventionHandler, InterventionKind, NegotiationHandler,
    NegotiationKind, Notification, NotificationHandler, NotificationKind, ServiceRequest,
    SubOperations,
};
use crate::machine::{Event, Mode, State};
use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJSource, Pdu, UserVariableItem,
};
use crate::presentation::{PresentationContext, ServiceClassRole};

use super::requestor::RequestorOptions;
use super::{
    ConfigurationSnafu, DimseSnafu, Error, Link, MissingAbstractSyntaxSnafu, RejectedSnafu,
    Result, Terminus, TimeoutSnafu,
};

/// A shared cap on the number of simultaneously served associations.
///
/// Clone one limit per listener and pass a clone to the options of
/// every association; when the cap is reached, further association
/// requests are rejected with "local limit exceeded".
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    active: Arc<AtomicUsize>,
    capacity: usize,
}

impl ConcurrencyLimit {
    pub fn new(capacity: usize) -> Self {
        ConcurrencyLimit {
            active: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    fn try_acquire(&self) -> Option<Permit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Permit {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
struct Permit {
    active: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A builder for accepting an association on an incoming connection.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_association::association::AcceptorOptions;
/// # use dicom_association::events::{HandlerOutcome, ServiceRequest};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("0.0.0.0:11112")?;
/// loop {
///     let (stream, _peer) = listener.accept()?;
///     std::thread::spawn(move || {
///         let mut association = AcceptorOptions::new()
///             .ae_title("ECHO-SCP")
///             .with_abstract_syntax("1.2.840.10008.1.1")
///             .establish(stream)?;
///         association.serve()
///     });
/// }
/// # }
/// ```
pub struct AcceptorOptions {
    config: AeConfig,
    abstract_syntaxes: Vec<String>,
    transfer_syntaxes: Vec<String>,
    registry: EventRegistry,
    limit: Option<ConcurrencyLimit>,
    strict: bool,
}

impl std::fmt::Debug for AcceptorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorOptions")
            .field("config", &self.config)
            .field("abstract_syntaxes", &self.abstract_syntaxes)
            .field("transfer_syntaxes", &self.transfer_syntaxes)
            .finish()
    }
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        let mut config = AeConfig::default();
        config.ae_title = "THIS-SCP".to_string();
        AcceptorOptions {
            config,
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: Vec::new(),
            registry: EventRegistry::new(),
            limit: None,
            strict: true,
        }
    }
}

impl AcceptorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the AE title of this node. The default is `THIS-SCP`.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.config.ae_title = ae_title.into();
        self
    }

    /// Replace the whole configuration surface.
    pub fn config(mut self, config: AeConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept this abstract syntax.
    pub fn with_abstract_syntax(mut self, abstract_syntax: impl Into<String>) -> Self {
        self.abstract_syntaxes.push(abstract_syntax.into());
        self
    }

    /// Restrict the accepted transfer syntaxes. By default,
    /// any transfer syntax supported by the registry is eligible.
    pub fn with_transfer_syntax(mut self, transfer_syntax: impl Into<String>) -> Self {
        self.transfer_syntaxes.push(transfer_syntax.into());
        self
    }

    /// Accept any abstract syntax, treating unknown SOP classes
    /// as storage services.
    pub fn unrestricted_storage_service(mut self, enabled: bool) -> Self {
        self.config.unrestricted_storage_service = enabled;
        self
    }

    /// Reject requests whose called AE title does not match ours.
    pub fn require_called_aet(mut self, required: bool) -> Self {
        self.config.require_called_aet = required;
        self
    }

    /// Only admit requests from these calling AE titles.
    pub fn require_calling_aet<I, T>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.config.require_calling_aet = titles.into_iter().map(Into::into).collect();
        self
    }

    /// Override the maximum incoming PDU body length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.config.maximum_pdu_size = value;
        self
    }

    /// Set the association request/reply timer interval.
    pub fn acse_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.config.acse_timeout = timeout;
        self
    }

    /// Set how long to wait for DIMSE responses (e.g. sub-operations).
    pub fn dimse_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.config.dimse_timeout = timeout;
        self
    }

    /// Set the idle wire timeout of the established association.
    pub fn network_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.config.network_timeout = timeout;
        self
    }

    /// Set the action taken when the network timeout expires.
    pub fn network_timeout_response(mut self, response: NetworkTimeoutResponse) -> Self {
        self.config.network_timeout_response = response;
        self
    }

    /// Set the concurrency cap recorded in the configuration.
    ///
    /// The cap is enforced through a [`ConcurrencyLimit`] shared
    /// between the options of all connections of one listener;
    /// see [`limit`](Self::limit).
    pub fn maximum_associations(mut self, maximum: usize) -> Self {
        self.config.maximum_associations = maximum;
        self
    }

    /// Attach a shared concurrency limit, typically created with
    /// the `maximum_associations` configuration value.
    pub fn limit(mut self, limit: ConcurrencyLimit) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Override strict mode: whether received PDUs must not
    /// surpass our maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Replace the event handler registry.
    pub fn events(mut self, registry: EventRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a notification handler.
    pub fn subscribe<H>(mut self, kind: NotificationKind, handler: H) -> Self
    where
        H: NotificationHandler + 'static,
    {
        self.registry.subscribe(kind, handler);
        self
    }

    /// Bind an intervention handler.
    pub fn bind<H>(mut self, kind: InterventionKind, handler: H) -> Self
    where
        H: InterventionHandler + 'static,
    {
        self.registry.bind(kind, handler);
        self
    }

    /// Bind a negotiation hook.
    pub fn bind_negotiation<H>(mut self, kind: NegotiationKind, handler: H) -> Self
    where
        H: NegotiationHandler + 'static,
    {
        self.registry.bind_negotiation(kind, handler);
        self
    }

    /// Bind the C-ECHO intervention handler.
    pub fn on_c_echo<H: InterventionHandler + 'static>(self, handler: H) -> Self {
        self.bind(InterventionKind::CEcho, handler)
    }

    /// Bind the C-STORE intervention handler.
    pub fn on_c_store<H: InterventionHandler + 'static>(self, handler: H) -> Self {
        self.bind(InterventionKind::CStore, handler)
    }

    /// Bind the C-FIND intervention handler.
    pub fn on_c_find<H: InterventionHandler + 'static>(self, handler: H) -> Self {
        self.bind(InterventionKind::CFind, handler)
    }

    /// Bind the C-GET intervention handler.
    pub fn on_c_get<H: InterventionHandler + 'static>(self, handler: H) -> Self {
        self.bind(InterventionKind::CGet, handler)
    }

    /// Bind the C-MOVE intervention handler.
    pub fn on_c_move<H: InterventionHandler + 'static>(self, handler: H) -> Self {
        self.bind(InterventionKind::CMove, handler)
    }

    /// Negotiate an association on the given accepted stream.
    pub fn establish(self, socket: TcpStream) -> Result<AcceptorAssociation> {
        let AcceptorOptions {
            config,
            abstract_syntaxes,
            transfer_syntaxes,
            registry,
            limit,
            strict,
        } = self;

        config.validate().context(ConfigurationSnafu)?;
        ensure!(
            !abstract_syntaxes.is_empty() || config.unrestricted_storage_service,
            MissingAbstractSyntaxSnafu
        );

        let acse_timeout = config.acse_timeout;
        let mut link = Link::new(socket, Mode::Acceptor, config, registry);
        link.strict(strict);
        link.notify(Notification::ConnectionOpen);
        link.step_local(Event::TransportConnectIndication, None)?;

        // await the association request; the ARTIM timer armed on
        // entry to Sta2 bounds this wait
        let deadline = acse_timeout.map(|t| Instant::now() + t);
        loop {
            if link.association_rq.is_some() || link.terminus().is_some() {
                break;
            }
            if link.state() == State::Sta1 {
                // ARTIM expiry or peer disconnect brought us down
                return Err(Error::Aborted);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return TimeoutSnafu {
                        operation: "A-ASSOCIATE-RQ",
                    }
                    .fail();
                }
            }
            link.pump(super::POLL_QUANTUM)?;
        }

        if let Some(terminus) = link.terminus().cloned() {
            return match terminus {
                Terminus::Rejected(association_rj) => RejectedSnafu { association_rj }.fail(),
                _ => Err(Error::Aborted),
            };
        }
        let rq = link.association_rq.take().expect("checked above");

        link.notify(Notification::AssociationRequested {
            calling_ae_title: &rq.calling_ae_title,
            called_ae_title: &rq.called_ae_title,
        });

        // the concurrency cap applies once the request is on the table
        let permit = match &limit {
            None => None,
            Some(limit) => match limit.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    debug!("Too many simultaneous associations, rejecting");
                    let association_rj = AssociationRJ {
                        result: AssociationRJResult::Transient,
                        source: AssociationRJSource::ServiceProviderPresentation(
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
                        ),
                    };
                    return Self::reject(link, association_rj);
                }
            },
        };

        match evaluate_association_rq(
            &link.config,
            &abstract_syntaxes,
            &transfer_syntaxes,
            &mut link.registry,
            rq,
        ) {
            Ok(negotiated) => {
                link.peer_max_pdu_length = negotiated_max_pdu(
                    negotiated.peer_max_pdu_length,
                    link.config.maximum_pdu_size,
                );
                link.table = negotiated.table;
                link.peer_ae_title = negotiated.peer_ae_title;
                link.peer_user_variables = negotiated.peer_user_variables;

                link.step_local(
                    Event::AAssociateResponseAccept,
                    Some(Pdu::AssociationAC(negotiated.ac)),
                )?;

                link.notify(Notification::AssociationAccepted);
                let peer_ae_title = link.peer_ae_title.clone();
                link.notify(Notification::AssociationEstablished {
                    peer_ae_title: &peer_ae_title,
                });

                Ok(AcceptorAssociation {
                    link,
                    _permit: permit,
                })
            }
            Err(association_rj) => Self::reject(link, association_rj),
        }
    }

    /// Send a rejection and wind the connection down.
    fn reject(mut link: Link, association_rj: AssociationRJ) -> Result<AcceptorAssociation> {
        link.notify(Notification::AssociationRejected);
        link.step_local(
            Event::AAssociateResponseReject,
            Some(Pdu::AssociationRJ(association_rj)),
        )?;
        // wait for the requestor to close, bounded by ARTIM
        while link.state() == State::Sta13 {
            link.pump(super::POLL_QUANTUM)?;
        }
        RejectedSnafu { association_rj }.fail()
    }
}

/// An established association, acceptor side.
pub struct AcceptorAssociation {
    link: Link,
    _permit: Option<Permit>,
}

impl std::fmt::Debug for AcceptorAssociation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorAssociation")
            .field("link", &self.link)
            .finish()
    }
}

impl AcceptorAssociation {
    /// The negotiated presentation contexts, including rejected ones.
    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        self.link.table.contexts()
    }

    /// The AE title of the requestor.
    pub fn peer_ae_title(&self) -> &str {
        &self.link.peer_ae_title
    }

    /// The user information items received from the requestor.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.link.peer_user_variables
    }

    /// The maximum PDU body length for outgoing PDUs.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.link.peer_max_pdu_length
    }

    pub fn is_established(&self) -> bool {
        self.link.is_established()
    }

    pub fn is_released(&self) -> bool {
        self.link.is_released()
    }

    pub fn is_aborted(&self) -> bool {
        self.link.is_aborted()
    }

    /// The current upper layer protocol state.
    pub fn state(&self) -> State {
        self.link.state()
    }

    /// Abort the association immediately. Idempotent.
    pub fn abort(&mut self) -> Result<()> {
        self.link.local_abort()
    }

    /// Release the association from this side.
    pub fn release(&mut self) -> Result<()> {
        self.link.local_release()
    }

    /// Wait for the next incoming DIMSE request.
    ///
    /// Returns `None` when the association terminates, including a
    /// release performed here in response to the peer. Idle time is
    /// bounded by the configured network timeout, if any.
    pub fn receive_message(&mut self) -> Result<Option<DimseMessage>> {
        loop {
            if self.link.peer_release_requested {
                self.link.local_release()?;
                return Ok(None);
            }
            if self.link.terminus().is_some() {
                return Ok(None);
            }
            // poll in small steps so that a pending release is honored
            if let Some(message) = self.link.poll_message(super::POLL_QUANTUM)? {
                return Ok(Some(message));
            }
        }
    }

    /// Serve DIMSE requests until the association ends.
    ///
    /// Requests are dispatched to the intervention handlers of the
    /// event registry. Returns once the association is released or
    /// aborted.
    pub fn serve(&mut self) -> Result<()> {
        while let Some(message) = self.receive_message()? {
            self.dispatch(message)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, message: DimseMessage) -> Result<()> {
        match message.command_field() {
            Ok(CommandField::CEchoRq) => self.handle_echo(&message),
            Ok(CommandField::CStoreRq) => self.link.respond_store(&message),
            Ok(CommandField::CFindRq) => self.handle_find(&message),
            Ok(CommandField::CGetRq) => self.handle_get(&message),
            Ok(CommandField::CMoveRq) => self.handle_move(&message),
            Ok(CommandField::CCancelRq) => {
                debug!("Ignoring C-CANCEL with no operation in progress");
                Ok(())
            }
            Ok(
                field @ (CommandField::NActionRq
                | CommandField::NCreateRq
                | CommandField::NDeleteRq
                | CommandField::NEventReportRq
                | CommandField::NGetRq
                | CommandField::NSetRq),
            ) => self.handle_n_service(field, &message),
            Ok(other) => {
                warn!("Discarding unexpected {:?} message", other);
                Ok(())
            }
            Err(e) => {
                warn!("Discarding DIMSE message without a valid command field: {}", e);
                Ok(())
            }
        }
    }

    fn context_of(&self, message: &DimseMessage) -> PresentationContext {
        self.link
            .table
            .get(message.context_id)
            .cloned()
            .expect("messages are only queued for accepted contexts")
    }

    fn handle_echo(&mut self, message: &DimseMessage) -> Result<()> {
        let context = self.context_of(message);
        let message_id = message.message_id().unwrap_or(0);
        let sop_class = message.affected_sop_class_uid();

        // verification succeeds unless a handler says otherwise
        let status = if self.link.registry.has_intervention(InterventionKind::CEcho) {
            let request = ServiceRequest {
                kind: InterventionKind::CEcho,
                context_id: context.id,
                abstract_syntax: &context.abstract_syntax,
                command: &message.command,
                dataset: None,
            };
            let handler = self
                .link
                .registry
                .intervention(InterventionKind::CEcho)
                .expect("checked above");
            match handler.handle(request) {
                Ok(HandlerOutcome::Status(status)) => status,
                Ok(HandlerOutcome::StatusDataset(ds)) => ds
                    .get(tags::STATUS)
                    .and_then(|el| el.to_int::<u16>().ok())
                    .unwrap_or(0x0000),
                Ok(_) => 0x0000,
                Err(e) => {
                    warn!("C-ECHO handler failed: {}", e);
                    0x0000
                }
            }
        } else {
            0x0000
        };

        let rsp = CEchoRsp::builder()
            .message_id_being_responded_to(message_id)
            .maybe_affected_sop_class_uid(sop_class.as_deref())
            .status(status)
            .build()
            .encode(false)
            .context(DimseSnafu)?;
        self.link.send_message(message.context_id, &rsp, None)
    }

    fn send_find_rsp(
        &mut self,
        context: &PresentationContext,
        message_id: u16,
        status: u16,
        identifier: Option<&InMemDicomObject>,
    ) -> Result<()> {
        let rsp = CFindRsp::builder()
            .message_id_being_responded_to(message_id)
            .affected_sop_class_uid(&context.abstract_syntax)
            .status(status)
            .build()
            .encode(identifier.is_some())
            .context(DimseSnafu)?;
        let data = identifier
            .map(|identifier| encode_dataset(identifier, &context.transfer_syntax))
            .transpose()
            .context(DimseSnafu)?;
        self.link
            .send_message(context.id, &rsp, data.as_deref())
    }

    fn handle_find(&mut self, message: &DimseMessage) -> Result<()> {
        let context = self.context_of(message);
        let message_id = message.message_id().unwrap_or(0);

        let identifier = match message.decode_data(&context.transfer_syntax) {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!("Could not decode C-FIND identifier: {}", e);
                return self.send_find_rsp(&context, message_id, 0xC310, None);
            }
        };

        let outcome = self.run_intervention(InterventionKind::CFind, &context, message, identifier);
        match outcome {
            Some(HandlerOutcome::Responses(responses)) => {
                for (status, identifier) in responses {
                    if self.link.take_cancel(message_id)? {
                        debug!("C-FIND cancelled by the peer");
                        return self.send_find_rsp(&context, message_id, 0xFE00, None);
                    }
                    self.send_find_rsp(&context, message_id, status, identifier.as_ref())?;
                    if is_terminal(status) {
                        return Ok(());
                    }
                    if !self.link.is_established() {
                        return Ok(());
                    }
                }
                // the handler ran dry without a terminal status
                self.send_find_rsp(&context, message_id, 0x0000, None)
            }
            Some(HandlerOutcome::Status(status)) => {
                self.send_find_rsp(&context, message_id, status, None)
            }
            Some(HandlerOutcome::StatusDataset(ds)) => {
                let status = ds
                    .get(tags::STATUS)
                    .and_then(|el| el.to_int::<u16>().ok())
                    .unwrap_or(0xC001);
                self.send_find_rsp(&context, message_id, status, None)
            }
            Some(HandlerOutcome::Dataset(status, identifier)) => {
                self.send_find_rsp(&context, message_id, status, Some(&identifier))?;
                if is_terminal(status) {
                    Ok(())
                } else {
                    self.send_find_rsp(&context, message_id, 0x0000, None)
                }
            }
            Some(HandlerOutcome::SubOperations(_)) => {
                warn!("C-FIND handler produced sub-operations");
                self.send_find_rsp(&context, message_id, 0xC311, None)
            }
            None => self.send_find_rsp(&context, message_id, 0xC311, None),
        }
    }

    fn run_intervention(
        &mut self,
        kind: InterventionKind,
        context: &PresentationContext,
        message: &DimseMessage,
        dataset: Option<InMemDicomObject>,
    ) -> Option<HandlerOutcome> {
        if !self.link.registry.has_intervention(kind) {
            warn!("No {:?} handler registered", kind);
            return None;
        }
        let request = ServiceRequest {
            kind,
            context_id: context.id,
            abstract_syntax: &context.abstract_syntax,
            command: &message.command,
            dataset: dataset.as_ref(),
        };
        let handler = self
            .link
            .registry
            .intervention(kind)
            .expect("checked above");
        match handler.handle(request) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("{:?} handler failed: {}", kind, e);
                None
            }
        }
    }

    fn send_retrieve_rsp(
        &mut self,
        is_move: bool,
        context: &PresentationContext,
        message_id: u16,
        status: u16,
        counts: SubOperationCounts,
        dataset: Option<&InMemDicomObject>,
    ) -> Result<()> {
        let rsp = if is_move {
            CMoveRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&context.abstract_syntax)
                .status(status)
                .sub_operations(counts)
                .build()
                .encode(dataset.is_some())
                .context(DimseSnafu)?
        } else {
            CGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&context.abstract_syntax)
                .status(status)
                .sub_operations(counts)
                .build()
                .encode(dataset.is_some())
                .context(DimseSnafu)?
        };
        let data = dataset
            .map(|dataset| encode_dataset(dataset, &context.transfer_syntax))
            .transpose()
            .context(DimseSnafu)?;
        self.link
            .send_message(context.id, &rsp, data.as_deref())
    }

    fn handle_get(&mut self, message: &DimseMessage) -> Result<()> {
        let context = self.context_of(message);
        let message_id = message.message_id().unwrap_or(0);

        let identifier = match message.decode_data(&context.transfer_syntax) {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!("Could not decode C-GET identifier: {}", e);
                return self.send_retrieve_rsp(
                    false,
                    &context,
                    message_id,
                    0xC410,
                    SubOperationCounts::default(),
                    None,
                );
            }
        };

        match self.run_intervention(InterventionKind::CGet, &context, message, identifier) {
            Some(HandlerOutcome::SubOperations(sub)) => {
                self.run_get_sub_operations(&context, message_id, sub)
            }
            Some(HandlerOutcome::Status(status)) => self.send_retrieve_rsp(
                false,
                &context,
                message_id,
                status,
                SubOperationCounts::default(),
                None,
            ),
            Some(_) => {
                warn!("C-GET handler produced an unexpected outcome");
                self.send_retrieve_rsp(
                    false,
                    &context,
                    message_id,
                    0xC411,
                    SubOperationCounts::default(),
                    None,
                )
            }
            None => self.send_retrieve_rsp(
                false,
                &context,
                message_id,
                0xC411,
                SubOperationCounts::default(),
                None,
            ),
        }
    }

    /// Perform C-GET sub-operations: the data sets are stored
    /// back over this same association, with this node acting
    /// as the storage SCU.
    fn run_get_sub_operations(
        &mut self,
        context: &PresentationContext,
        message_id: u16,
        sub: SubOperations,
    ) -> Result<()> {
        let mut counts = SubOperationCounts {
            remaining: sub.remaining,
            ..SubOperationCounts::default()
        };
        let mut failed_uids: Vec<String> = Vec::new();
        let mut cancelled = false;

        for item in sub.datasets {
            if self.link.take_cancel(message_id)? {
                debug!("C-GET cancelled by the peer");
                cancelled = true;
                break;
            }
            match item {
                Err(e) => {
                    warn!("C-GET handler could not produce a data set: {}", e);
                    counts.failed += 1;
                }
                Ok(dataset) => {
                    let instance_uid = dataset
                        .get(tags::SOP_INSTANCE_UID)
                        .and_then(|el| el.to_str().ok())
                        .map(|s| s.trim_end_matches('\0').trim().to_string());
                    match self.store_back(&dataset)? {
                        None => {
                            // the association is gone; nothing to report to
                            return Ok(());
                        }
                        Some(status) => match status_type(status) {
                            StatusType::Success => counts.completed += 1,
                            StatusType::Warning => counts.warning += 1,
                            _ => {
                                counts.failed += 1;
                                failed_uids.extend(instance_uid);
                            }
                        },
                    }
                }
            }
            counts.remaining = counts.remaining.map(|r| r.saturating_sub(1));
            if counts.remaining.map_or(true, |r| r > 0) {
                self.send_retrieve_rsp(false, context, message_id, 0xFF00, counts, None)?;
            }
            if !self.link.is_established() {
                return Ok(());
            }
        }

        self.finish_retrieve(false, context, message_id, counts, failed_uids, cancelled)
    }

    /// Send a C-STORE sub-operation back to the requestor.
    fn store_back(&mut self, dataset: &InMemDicomObject) -> Result<Option<u16>> {
        let sop_class_uid = match dataset
            .get(tags::SOP_CLASS_UID)
            .and_then(|el| el.to_str().ok())
        {
            Some(uid) => uid.trim_end_matches('\0').trim().to_string(),
            None => {
                warn!("Sub-operation data set carries no SOPClassUID");
                return Ok(Some(0xC000));
            }
        };
        let sop_instance_uid = dataset
            .get(tags::SOP_INSTANCE_UID)
            .and_then(|el| el.to_str().ok())
            .map(|s| s.trim_end_matches('\0').trim().to_string())
            .unwrap_or_default();

        let sub_context = match self.link.table.select_context(
            &sop_class_uid,
            "",
            ServiceClassRole::Scu,
            None,
            true,
        ) {
            Ok(pc) => pc.clone(),
            Err(_) => {
                debug!(
                    "No context accepted for storing {} in the reverse role",
                    sop_class_uid
                );
                return Ok(Some(0x0122));
            }
        };

        let data = encode_dataset(dataset, &sub_context.transfer_syntax).context(DimseSnafu)?;
        // sub-operations get their own message ID space
        let sub_message_id = 0x8000;
        let command = CStoreRq::builder()
            .message_id(sub_message_id)
            .affected_sop_class_uid(&sop_class_uid)
            .affected_sop_instance_uid(&sop_instance_uid)
            .priority(Priority::Medium)
            .build()
            .encode(true)
            .context(DimseSnafu)?;
        self.link
            .send_message(sub_context.id, &command, Some(&data))?;

        // await the peer's store response, keeping cancels queued
        let mut stashed: Vec<DimseMessage> = Vec::new();
        let status = loop {
            let timeout = self.link.config.dimse_timeout;
            match self.link.wait_message(timeout)? {
                None => break None,
                Some(message) => match message.command_field() {
                    Ok(CommandField::CStoreRsp)
                        if message.message_id_being_responded_to().ok()
                            == Some(sub_message_id) =>
                    {
                        break Some(message.status().unwrap_or(0xC000));
                    }
                    Ok(CommandField::CCancelRq) => stashed.push(message),
                    _ => {
                        warn!("Discarding unexpected message during sub-operation");
                    }
                },
            }
        };
        for message in stashed.into_iter().rev() {
            self.link.unget_message(message);
        }
        Ok(status)
    }

    fn finish_retrieve(
        &mut self,
        is_move: bool,
        context: &PresentationContext,
        message_id: u16,
        mut counts: SubOperationCounts,
        failed_uids: Vec<String>,
        cancelled: bool,
    ) -> Result<()> {
        counts.remaining = Some(counts.remaining.unwrap_or(0));
        let status = if cancelled {
            0xFE00
        } else if counts.failed > 0 {
            // sub-operations completed, one or more failures
            0xB000
        } else {
            0x0000
        };
        let failed_list = if failed_uids.is_empty() {
            None
        } else {
            Some(InMemDicomObject::from_element_iter([DataElement::new(
                tags::FAILED_SOP_INSTANCE_UID_LIST,
                VR::UI,
                PrimitiveValue::Strs(failed_uids.into_iter().collect()),
            )]))
        };
        self.send_retrieve_rsp(
            is_move,
            context,
            message_id,
            status,
            counts,
            failed_list.as_ref(),
        )
    }

    fn handle_move(&mut self, message: &DimseMessage) -> Result<()> {
        let context = self.context_of(message);
        let message_id = message.message_id().unwrap_or(0);

        let identifier = match message.decode_data(&context.transfer_syntax) {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!("Could not decode C-MOVE identifier: {}", e);
                return self.send_retrieve_rsp(
                    true,
                    &context,
                    message_id,
                    0xC510,
                    SubOperationCounts::default(),
                    None,
                );
            }
        };

        match self.run_intervention(InterventionKind::CMove, &context, message, identifier) {
            Some(HandlerOutcome::SubOperations(sub)) => {
                self.run_move_sub_operations(&context, message_id, sub)
            }
            Some(HandlerOutcome::Status(status)) => self.send_retrieve_rsp(
                true,
                &context,
                message_id,
                status,
                SubOperationCounts::default(),
                None,
            ),
            Some(_) => {
                warn!("C-MOVE handler produced an unexpected outcome");
                self.send_retrieve_rsp(
                    true,
                    &context,
                    message_id,
                    0xC511,
                    SubOperationCounts::default(),
                    None,
                )
            }
            None => self.send_retrieve_rsp(
                true,
                &context,
                message_id,
                0xC511,
                SubOperationCounts::default(),
                None,
            ),
        }
    }

    /// Perform C-MOVE sub-operations over a separate association
    /// to the move destination.
    fn run_move_sub_operations(
        &mut self,
        context: &PresentationContext,
        message_id: u16,
        sub: SubOperations,
    ) -> Result<()> {
        let destination = match sub.destination {
            Some(destination) => destination,
            None => {
                debug!("Move destination unknown");
                return self.send_retrieve_rsp(
                    true,
                    context,
                    message_id,
                    0xA801,
                    SubOperationCounts::default(),
                    None,
                );
            }
        };

        // the sub-association proposes one context
        // per distinct SOP class about to be stored
        let datasets: Vec<_> = sub.datasets.collect();
        let mut sop_classes: Vec<String> = Vec::new();
        for dataset in datasets.iter().flatten() {
            if let Some(uid) = dataset
                .get(tags::SOP_CLASS_UID)
                .and_then(|el| el.to_str().ok())
            {
                let uid = uid.trim_end_matches('\0').trim().to_string();
                if !sop_classes.contains(&uid) {
                    sop_classes.push(uid);
                }
            }
        }

        let mut options = RequestorOptions::new()
            .calling_ae_title(self.link.config.ae_title.clone())
            .called_ae_title(destination.ae_title.clone())
            .acse_timeout(self.link.config.acse_timeout)
            .dimse_timeout(self.link.config.dimse_timeout)
            .connection_timeout(self.link.config.connection_timeout);
        for sop_class in &sop_classes {
            options = options.with_abstract_syntax(sop_class.clone());
        }

        let mut sub_association = match options
            .establish((destination.host.as_str(), destination.port))
        {
            Ok(association) => association,
            Err(e) => {
                warn!(
                    "Could not open the sub-association to {}@{}:{}: {}",
                    destination.ae_title, destination.host, destination.port, e
                );
                return self.send_retrieve_rsp(
                    true,
                    context,
                    message_id,
                    0xA801,
                    SubOperationCounts::default(),
                    None,
                );
            }
        };

        let mut counts = SubOperationCounts {
            remaining: sub.remaining.or(Some(datasets.len() as u16)),
            ..SubOperationCounts::default()
        };
        let mut failed_uids: Vec<String> = Vec::new();
        let mut cancelled = false;
        let move_originator = self.link.peer_ae_title.clone();

        for item in datasets {
            if self.link.take_cancel(message_id)? {
                debug!("C-MOVE cancelled by the peer");
                cancelled = true;
                break;
            }
            match item {
                Err(e) => {
                    warn!("C-MOVE handler could not produce a data set: {}", e);
                    counts.failed += 1;
                }
                Ok(dataset) => {
                    let instance_uid = dataset
                        .get(tags::SOP_INSTANCE_UID)
                        .and_then(|el| el.to_str().ok())
                        .map(|s| s.trim_end_matches('\0').trim().to_string());
                    let status = sub_association.send_c_store_object(
                        &dataset,
                        Priority::Medium,
                        Some((&move_originator, message_id)),
                    );
                    match status {
                        Ok(Some(status)) => match status_type(status) {
                            StatusType::Success => counts.completed += 1,
                            StatusType::Warning => counts.warning += 1,
                            _ => {
                                counts.failed += 1;
                                failed_uids.extend(instance_uid);
                            }
                        },
                        Ok(None) | Err(_) => {
                            counts.failed += 1;
                            failed_uids.extend(instance_uid);
                        }
                    }
                }
            }
            counts.remaining = counts.remaining.map(|r| r.saturating_sub(1));
            if counts.remaining.map_or(true, |r| r > 0) {
                self.send_retrieve_rsp(true, context, message_id, 0xFF00, counts, None)?;
            }
            if !self.link.is_established() {
                return Ok(());
            }
        }

        let _ = sub_association.release();
        self.finish_retrieve(true, context, message_id, counts, failed_uids, cancelled)
    }

    fn handle_n_service(&mut self, field: CommandField, message: &DimseMessage) -> Result<()> {
        let context = self.context_of(message);
        let message_id = message.message_id().unwrap_or(0);
        let sop_class = message
            .affected_sop_class_uid()
            .or_else(|| message.requested_sop_class_uid());
        let sop_instance = message
            .affected_sop_instance_uid()
            .or_else(|| message.requested_sop_instance_uid());

        let kind = match field {
            CommandField::NActionRq => InterventionKind::NAction,
            CommandField::NCreateRq => InterventionKind::NCreate,
            CommandField::NDeleteRq => InterventionKind::NDelete,
            CommandField::NEventReportRq => InterventionKind::NEventReport,
            CommandField::NGetRq => InterventionKind::NGet,
            CommandField::NSetRq => InterventionKind::NSet,
            _ => unreachable!("dispatch only routes N-service requests"),
        };

        let dataset = match message.decode_data(&context.transfer_syntax) {
            Ok(dataset) => dataset,
            Err(e) => {
                warn!("Could not decode {:?} data set: {}", kind, e);
                None
            }
        };

        // processing failure unless the handler provides a status
        let (status, response_dataset) =
            match self.run_intervention(kind, &context, message, dataset) {
                Some(HandlerOutcome::Status(status)) => (status, None),
                Some(HandlerOutcome::StatusDataset(ds)) => (
                    ds.get(tags::STATUS)
                        .and_then(|el| el.to_int::<u16>().ok())
                        .unwrap_or(0x0110),
                    None,
                ),
                Some(HandlerOutcome::Dataset(status, ds)) => (status, Some(ds)),
                Some(_) => {
                    warn!("{:?} handler produced an unexpected outcome", kind);
                    (0x0110, None)
                }
                None => (0x0110, None),
            };

        let with_data = response_dataset.is_some();
        let sop_class = sop_class.as_deref();
        let sop_instance = sop_instance.as_deref();
        let rsp = match field {
            CommandField::NActionRq => NActionRsp::builder()
                .message_id_being_responded_to(message_id)
                .maybe_affected_sop_class_uid(sop_class)
                .maybe_affected_sop_instance_uid(sop_instance)
                .status(status)
                .build()
                .encode(with_data),
            CommandField::NCreateRq => NCreateRsp::builder()
                .message_id_being_responded_to(message_id)
                .maybe_affected_sop_class_uid(sop_class)
                .maybe_affected_sop_instance_uid(sop_instance)
                .status(status)
                .build()
                .encode(with_data),
            CommandField::NDeleteRq => NDeleteRsp::builder()
                .message_id_being_responded_to(message_id)
                .maybe_affected_sop_class_uid(sop_class)
                .maybe_affected_sop_instance_uid(sop_instance)
                .status(status)
                .build()
                .encode(with_data),
            CommandField::NEventReportRq => NEventReportRsp::builder()
                .message_id_being_responded_to(message_id)
                .maybe_affected_sop_class_uid(sop_class)
                .maybe_affected_sop_instance_uid(sop_instance)
                .status(status)
                .build()
                .encode(with_data),
            CommandField::NGetRq => NGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .maybe_affected_sop_class_uid(sop_class)
                .maybe_affected_sop_instance_uid(sop_instance)
                .status(status)
                .build()
                .encode(with_data),
            CommandField::NSetRq => NSetRsp::builder()
                .message_id_being_responded_to(message_id)
                .maybe_affected_sop_class_uid(sop_class)
                .maybe_affected_sop_instance_uid(sop_instance)
                .status(status)
                .build()
                .encode(with_data),
            _ => unreachable!("dispatch only routes N-service requests"),
        }
        .context(DimseSnafu)?;

        let data = response_dataset
            .map(|ds| encode_dataset(&ds, &context.transfer_syntax))
            .transpose()
            .context(DimseSnafu)?;
        self.link
            .send_message(context.id, &rsp, data.as_deref())
    }
}

impl Drop for AcceptorAssociation {
    fn drop(&mut self) {
        if self.link.is_established() {
            let _ = self.link.local_abort();
        }
    }
}
