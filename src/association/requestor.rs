//! Association requestor.
//!
//! [`RequestorOptions`] negotiates an association with a peer
//! application entity; the resulting [`RequestorAssociation`] carries
//! the DIMSE service API: C-ECHO, C-STORE, the query/retrieve
//! services with their streaming responses, C-CANCEL,
//! and the normalized N-* operations.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use dicom_core::Tag;
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::acse::negotiated_max_pdu;
use crate::address::FullAeAddr;
use crate::config::{AeConfig, NetworkTimeoutResponse};
use crate::dimse::commands::{
    CCancelRq, CEchoRq, CFindRq, CGetRq, CMoveRq, CStoreRq, Command, NActionRq, NCreateRq,
    NDeleteRq, NEventReportRq, NGetRq, NSetRq,
};
use crate::dimse::{encode_dataset, is_terminal, CommandField, DimseMessage, Priority};
use crate::events::{EventRegistry, InterventionHandler, InterventionKind, Notification};
use crate::machine::{Event, Mode, State};
use crate::pdu::{
    Pdu, PresentationContextProposed, RoleSelection, UserIdentity, UserVariableItem,
    AssociationRQ, DEFAULT_MAX_PDU,
};
use crate::presentation::{ContextTable, PresentationContext, ServiceClassRole};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::{
    ConfigurationSnafu, ConnectSnafu, DimseSnafu, Error, Link, MissingAbstractSyntaxSnafu,
    MissingRequiredElementSnafu, NoAcceptedPresentationContextsSnafu, NoCompatibleContextSnafu,
    NotEstablishedSnafu, PresentationSnafu, RejectedSnafu, Result, Terminus, TimeoutSnafu,
    UnexpectedPduSnafu, UnsupportedConversionSnafu, UnsupportedQueryModelSnafu,
};

/// Explicit VR Little Endian
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
/// Implicit VR Little Endian
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The information model of a query/retrieve operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryModel {
    /// Patient Root Query/Retrieve
    PatientRoot,
    /// Study Root Query/Retrieve
    StudyRoot,
    /// Modality Worklist (C-FIND only)
    ModalityWorklist,
}

impl QueryModel {
    /// The SOP class of the C-FIND service of this model.
    pub fn find_sop_class(self) -> &'static str {
        match self {
            QueryModel::PatientRoot => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            QueryModel::StudyRoot => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            QueryModel::ModalityWorklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
        }
    }

    /// The SOP class of the C-GET service of this model.
    pub fn get_sop_class(self) -> Result<&'static str> {
        match self {
            QueryModel::PatientRoot => Ok(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
            QueryModel::StudyRoot => Ok(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
            QueryModel::ModalityWorklist => {
                UnsupportedQueryModelSnafu { operation: "C-GET" }.fail()
            }
        }
    }

    /// The SOP class of the C-MOVE service of this model.
    pub fn move_sop_class(self) -> Result<&'static str> {
        match self {
            QueryModel::PatientRoot => {
                Ok(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
            }
            QueryModel::StudyRoot => Ok(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
            QueryModel::ModalityWorklist => {
                UnsupportedQueryModelSnafu { operation: "C-MOVE" }.fail()
            }
        }
    }
}

/// A builder for negotiating an association as the requestor.
///
/// # Example
///
/// ```no_run
/// # use dicom_association::association::RequestorOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = RequestorOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish_with("MAIN-PACS@10.0.12.8:104")?;
/// let status = association.send_c_echo()?;
/// association.release()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RequestorOptions {
    config: AeConfig,
    called_ae_title: String,
    presentation_contexts: Vec<(String, Vec<String>)>,
    role_selections: Vec<RoleSelection>,
    user_identity: Option<UserIdentity>,
    registry: EventRegistry,
    strict: bool,
}

impl Default for RequestorOptions {
    fn default() -> Self {
        let mut config = AeConfig::default();
        config.ae_title = "THIS-SCU".to_string();
        RequestorOptions {
            config,
            called_ae_title: "ANY-SCP".to_string(),
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            user_identity: None,
            registry: EventRegistry::new(),
            strict: true,
        }
    }
}

impl RequestorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the calling AE title. The default is `THIS-SCU`.
    pub fn calling_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.config.ae_title = ae_title.into();
        self
    }

    /// Set the called AE title. The default is `ANY-SCP`.
    pub fn called_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.called_ae_title = ae_title.into();
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and candidate transfer syntaxes.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax: impl Into<String>,
        transfer_syntaxes: Vec<T>,
    ) -> Self
    where
        T: Into<String>,
    {
        self.presentation_contexts.push((
            abstract_syntax.into(),
            transfer_syntaxes.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and the default transfer syntaxes
    /// (Explicit and Implicit VR Little Endian).
    pub fn with_abstract_syntax(self, abstract_syntax: impl Into<String>) -> Self {
        self.with_presentation_context(
            abstract_syntax,
            vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
        )
    }

    /// Propose SCP/SCU role selection for the given SOP class.
    pub fn with_role_selection(
        mut self,
        sop_class_uid: impl Into<String>,
        scu: bool,
        scp: bool,
    ) -> Self {
        self.role_selections.push(RoleSelection {
            sop_class_uid: sop_class_uid.into(),
            scu_role: scu,
            scp_role: scp,
        });
        self
    }

    /// Attach user identity negotiation to the request.
    pub fn user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    /// Override the maximum incoming PDU body length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.config.maximum_pdu_size = value;
        self
    }

    /// Set the association request/reply timer interval.
    pub fn acse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.acse_timeout = timeout;
        self
    }

    /// Set how long to wait for DIMSE responses.
    pub fn dimse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dimse_timeout = timeout;
        self
    }

    /// Set the idle wire timeout of the established association.
    pub fn network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.network_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the action taken when the network timeout expires.
    pub fn network_timeout_response(mut self, response: NetworkTimeoutResponse) -> Self {
        self.config.network_timeout_response = response;
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

    /// Bind the C-STORE intervention handler,
    /// used to serve sub-operations of C-GET
    /// and same-association C-MOVE.
    pub fn on_c_store<H>(mut self, handler: H) -> Self
    where
        H: InterventionHandler + 'static,
    {
        self.registry.bind(InterventionKind::CStore, handler);
        self
    }

    /// Request the association from the node at a `AET@host:port` address.
    /// The AE title part overrides the called AE title.
    pub fn establish_with(self, ae_address: &str) -> Result<RequestorAssociation> {
        match ae_address.parse::<FullAeAddr>() {
            Ok(addr) => self
                .called_ae_title(addr.ae_title().to_string())
                .establish(addr),
            Err(_) => self.establish(ae_address),
        }
    }

    /// Request the association from the node at the given address.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<RequestorAssociation> {
        let RequestorOptions {
            config,
            called_ae_title,
            presentation_contexts,
            role_selections,
            user_identity,
            registry,
            strict,
        } = self;

        config.validate().context(ConfigurationSnafu)?;
        ensure!(!presentation_contexts.is_empty(), MissingAbstractSyntaxSnafu);

        // odd context identifiers, in proposal order
        let proposed: Vec<PresentationContextProposed> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax,
                transfer_syntaxes,
            })
            .collect();

        let socket = connect(address, config.connection_timeout)?;

        let calling_ae_title = config.ae_title.clone();
        let acse_timeout = config.acse_timeout;
        let mut link = Link::new(socket, Mode::Requestor, config, registry);
        link.strict(strict);
        link.notify(Notification::ConnectionOpen);

        let mut user_variables = vec![
            UserVariableItem::MaxLength(link.config.maximum_pdu_size),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        for role in &role_selections {
            user_variables.push(UserVariableItem::RoleSelection(role.clone()));
        }
        if let Some(identity) = user_identity {
            user_variables.push(UserVariableItem::UserIdentity(identity));
        }

        let rq = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: calling_ae_title.clone(),
            called_ae_title: called_ae_title.clone(),
            application_context_name: crate::acse::DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables,
        });

        link.notify(Notification::AssociationRequested {
            calling_ae_title: &calling_ae_title,
            called_ae_title: &called_ae_title,
        });

        // Evt1 opens the transport (already connected), Evt2 sends the request
        link.step_local(Event::AAssociateRequest, None)?;
        link.step_local(Event::TransportConnectConfirm, Some(rq))?;

        // await A-ASSOCIATE-AC or -RJ
        let deadline = acse_timeout.map(|t| std::time::Instant::now() + t);
        loop {
            if link.established_ac.is_some() || link.terminus().is_some() {
                break;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    warn!("Timed out waiting for the association response, aborting");
                    link.local_abort()?;
                    return TimeoutSnafu {
                        operation: "A-ASSOCIATE-AC",
                    }
                    .fail();
                }
            }
            link.pump(super::POLL_QUANTUM)?;
        }

        match link.terminus().cloned() {
            Some(Terminus::Rejected(association_rj)) => {
                return RejectedSnafu { association_rj }.fail();
            }
            Some(Terminus::Aborted) => {
                return Err(Error::Aborted);
            }
            Some(Terminus::Released) => {
                // cannot happen before establishment; treat as protocol error
                return UnexpectedPduSnafu {
                    pdu: Box::new(Pdu::ReleaseRP),
                }
                .fail();
            }
            None => {}
        }

        let ac = link.established_ac.take().expect("checked above");

        let accepted_roles: Vec<RoleSelection> = ac
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role.clone()),
                _ => None,
            })
            .collect();
        let peer_declared = ac
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);
        link.peer_max_pdu_length = negotiated_max_pdu(peer_declared, link.config.maximum_pdu_size);
        link.table = ContextTable::from_requestor_negotiation(
            &proposed,
            &ac.presentation_contexts,
            &role_selections,
            &accepted_roles,
        );
        link.peer_ae_title = called_ae_title;
        link.peer_user_variables = ac.user_variables;

        if link.table.accepted().next().is_none() {
            debug!("No presentation contexts accepted, aborting");
            link.local_abort()?;
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        link.notify(Notification::AssociationAccepted);
        let peer_ae_title = link.peer_ae_title.clone();
        link.notify(Notification::AssociationEstablished {
            peer_ae_title: &peer_ae_title,
        });

        Ok(RequestorAssociation {
            link,
            next_message_id: 0,
        })
    }
}

fn connect<A: ToSocketAddrs>(address: A, timeout: Option<Duration>) -> Result<TcpStream> {
    match timeout {
        None => TcpStream::connect(address).context(ConnectSnafu),
        Some(timeout) => {
            let addrs: Vec<_> = address
                .to_socket_addrs()
                .context(ConnectSnafu)?
                .collect();
            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, timeout) {
                    Ok(socket) => return Ok(socket),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(Error::Connect {
                source: last_err.unwrap_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "address resolved to no socket addresses",
                    )
                }),
            })
        }
    }
}

/// An established association, requestor side.
///
/// Dropping the value releases the association gracefully
/// if it is still established.
#[derive(Debug)]
pub struct RequestorAssociation {
    link: Link,
    next_message_id: u16,
}

impl RequestorAssociation {
    /// The negotiated presentation contexts, including rejected ones.
    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        self.link.table.contexts()
    }

    /// The AE title of the peer.
    pub fn peer_ae_title(&self) -> &str {
        &self.link.peer_ae_title
    }

    /// The maximum PDU body length for outgoing PDUs.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.link.peer_max_pdu_length
    }

    /// The user information items received from the peer.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.link.peer_user_variables
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

    /// Release the association gracefully.
    /// A no-op outside the established state and after an abort.
    pub fn release(&mut self) -> Result<()> {
        self.link.local_release()
    }

    /// Abort the association immediately. Idempotent;
    /// a no-op after a completed release.
    pub fn abort(&mut self) -> Result<()> {
        self.link.local_abort()
    }

    /// Send a PDU directly, bypassing the DIMSE layer.
    pub fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.link.send_raw(pdu)
    }

    /// Wait for the next incoming DIMSE message.
    ///
    /// Returns `None` when the association terminates
    /// or the DIMSE timeout expires (which aborts it).
    pub fn receive_message(&mut self) -> Result<Option<DimseMessage>> {
        let timeout = self.link.config.dimse_timeout;
        self.link.wait_message(timeout)
    }

    fn next_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    fn select_context(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
        role: ServiceClassRole,
        context_id: Option<u8>,
        allow_conversion: bool,
    ) -> Result<PresentationContext> {
        self.link
            .table
            .select_context(
                abstract_syntax,
                transfer_syntax,
                role,
                context_id,
                allow_conversion,
            )
            .map(Clone::clone)
            .context(PresentationSnafu)
    }

    /// Wait for the response of the given kind and message ID,
    /// serving C-STORE sub-operations that arrive in between.
    ///
    /// `None` means the association reached a terminal state
    /// while waiting; the caller observes an empty response.
    fn wait_response(
        &mut self,
        rsp_field: CommandField,
        message_id: u16,
    ) -> Result<Option<DimseMessage>> {
        loop {
            let timeout = self.link.config.dimse_timeout;
            let message = match self.link.wait_message(timeout)? {
                Some(message) => message,
                None => return Ok(None),
            };
            match message.command_field() {
                Ok(CommandField::CStoreRq) => {
                    self.link.respond_store(&message)?;
                }
                Ok(field) if field == rsp_field => {
                    match message.message_id_being_responded_to() {
                        Ok(id) if id == message_id => return Ok(Some(message)),
                        _ => {
                            warn!("Discarding response to an unknown message ID");
                        }
                    }
                }
                Ok(other) => {
                    warn!("Discarding unexpected {:?} message", other);
                }
                Err(e) => {
                    warn!("Discarding DIMSE message without a valid command field: {}", e);
                }
            }
        }
    }

    /// Send a C-ECHO request and wait for its response.
    ///
    /// Returns the response status data set. If the association
    /// aborts while waiting (including on a DIMSE timeout),
    /// the returned data set is empty and [`is_aborted`][Self::is_aborted]
    /// is true afterwards.
    pub fn send_c_echo(&mut self) -> Result<InMemDicomObject> {
        ensure!(self.link.is_established(), NotEstablishedSnafu);
        let context =
            self.select_context(uids::VERIFICATION, "", ServiceClassRole::Scu, None, false)?;

        let message_id = self.next_message_id();
        let command = CEchoRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(uids::VERIFICATION)
            .build()
            .encode(false)
            .context(DimseSnafu)?;
        self.link.send_message(context.id, &command, None)?;

        match self.wait_response(CommandField::CEchoRsp, message_id)? {
            Some(message) => Ok(message.command),
            None => Ok(InMemDicomObject::new_empty()),
        }
    }

    /// Send a C-STORE request for the given file object.
    ///
    /// The data set must carry *SOPClassUID* and *SOPInstanceUID*,
    /// and the file meta group must name its transfer syntax.
    /// If no accepted presentation context matches the data set's
    /// encoding, the data set is re-encoded on the fly when both
    /// transfer syntaxes are codec free; otherwise the call fails
    /// without touching the wire.
    pub fn send_c_store(
        &mut self,
        object: &FileDicomObject<InMemDicomObject>,
        priority: Priority,
    ) -> Result<InMemDicomObject> {
        ensure!(self.link.is_established(), NotEstablishedSnafu);

        let file_ts = object
            .meta()
            .transfer_syntax
            .trim_end_matches('\0')
            .to_string();
        ensure!(
            !file_ts.is_empty(),
            MissingRequiredElementSnafu {
                name: "TransferSyntaxUID",
            }
        );
        let sop_class_uid = element_uid(object, tags::SOP_CLASS_UID)
            .context(MissingRequiredElementSnafu {
                name: "SOPClassUID",
            })?;
        let sop_instance_uid = element_uid(object, tags::SOP_INSTANCE_UID).context(
            MissingRequiredElementSnafu {
                name: "SOPInstanceUID",
            },
        )?;

        let context = self
            .link
            .table
            .select_context(&sop_class_uid, &file_ts, ServiceClassRole::Scu, None, true)
            .map(Clone::clone)
            .map_err(|_| Error::NoCompatibleContext {
                sop_class_uid: sop_class_uid.clone(),
                transfer_syntax: file_ts.clone(),
            })?;

        let data = if context.transfer_syntax == file_ts {
            let ts = TransferSyntaxRegistry.get(&file_ts).with_context(|| {
                NoCompatibleContextSnafu {
                    sop_class_uid: sop_class_uid.clone(),
                    transfer_syntax: file_ts.clone(),
                }
            })?;
            let mut buffer = Vec::new();
            object
                .write_dataset_with_ts(&mut buffer, ts)
                .map_err(Box::from)
                .map_err(|source| crate::dimse::Error::EncodeData { source })
                .context(DimseSnafu)?;
            buffer
        } else {
            // the accepted context disagrees with the file encoding;
            // re-encode only between codec-free transfer syntaxes
            let source_ts = TransferSyntaxRegistry.get(&file_ts);
            let target_ts = TransferSyntaxRegistry.get(&context.transfer_syntax);
            let convertible = matches!(
                (source_ts, target_ts),
                (Some(source), Some(target)) if source.is_codec_free() && target.is_codec_free()
            );
            ensure!(
                convertible,
                UnsupportedConversionSnafu {
                    from: file_ts.clone(),
                    to: context.transfer_syntax.clone(),
                }
            );
            debug!(
                "Re-encoding data set from {} to {}",
                file_ts, context.transfer_syntax
            );
            encode_dataset(object, &context.transfer_syntax).context(DimseSnafu)?
        };

        let message_id = self.next_message_id();
        let command = CStoreRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(&sop_class_uid)
            .affected_sop_instance_uid(&sop_instance_uid)
            .priority(priority)
            .build()
            .encode(true)
            .context(DimseSnafu)?;
        self.link.send_message(context.id, &command, Some(&data))?;

        match self.wait_response(CommandField::CStoreRsp, message_id)? {
            Some(message) => Ok(message.command),
            None => Ok(InMemDicomObject::new_empty()),
        }
    }

    /// Send a C-STORE request for a bare data set,
    /// e.g. a retrieve sub-operation.
    ///
    /// The data set must carry *SOPClassUID* and *SOPInstanceUID*
    /// and is encoded with the transfer syntax of the selected
    /// context. Returns the response status,
    /// or `None` if the association terminated while waiting.
    pub fn send_c_store_object(
        &mut self,
        dataset: &InMemDicomObject,
        priority: Priority,
        move_originator: Option<(&str, u16)>,
    ) -> Result<Option<u16>> {
        ensure!(self.link.is_established(), NotEstablishedSnafu);
        let sop_class_uid = element_uid(dataset, tags::SOP_CLASS_UID).context(
            MissingRequiredElementSnafu {
                name: "SOPClassUID",
            },
        )?;
        let sop_instance_uid = element_uid(dataset, tags::SOP_INSTANCE_UID).context(
            MissingRequiredElementSnafu {
                name: "SOPInstanceUID",
            },
        )?;
        let context = self.select_context(&sop_class_uid, "", ServiceClassRole::Scu, None, true)?;
        let data = encode_dataset(dataset, &context.transfer_syntax).context(DimseSnafu)?;

        let message_id = self.next_message_id();
        let command = CStoreRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(&sop_class_uid)
            .affected_sop_instance_uid(&sop_instance_uid)
            .priority(priority)
            .maybe_move_originator_ae_title(move_originator.map(|(title, _)| title))
            .maybe_move_originator_message_id(move_originator.map(|(_, id)| id))
            .build()
            .encode(true)
            .context(DimseSnafu)?;
        self.link.send_message(context.id, &command, Some(&data))?;

        match self.wait_response(CommandField::CStoreRsp, message_id)? {
            Some(message) => Ok(Some(message.status().context(DimseSnafu)?)),
            None => Ok(None),
        }
    }

    /// Issue a C-FIND request and stream its responses.
    ///
    /// The stream yields `(status, identifier)` pairs and ends after
    /// the first non-pending status, or when the association aborts.
    pub fn send_c_find(
        &mut self,
        identifier: &InMemDicomObject,
        query_model: QueryModel,
    ) -> Result<ResponseStream<'_>> {
        let sop_class = query_model.find_sop_class();
        self.start_query(sop_class, identifier, CommandField::CFindRsp, |message_id| {
            CFindRq::builder()
                .message_id(message_id)
                .affected_sop_class_uid(sop_class)
                .build()
                .encode(true)
        })
    }

    /// Issue a C-GET request and stream its responses.
    ///
    /// Store sub-operations arriving over this association are
    /// dispatched to the registered C-STORE intervention handler
    /// while the stream is being consumed.
    pub fn send_c_get(
        &mut self,
        identifier: &InMemDicomObject,
        query_model: QueryModel,
    ) -> Result<ResponseStream<'_>> {
        let sop_class = query_model.get_sop_class()?;
        self.start_query(sop_class, identifier, CommandField::CGetRsp, |message_id| {
            CGetRq::builder()
                .message_id(message_id)
                .affected_sop_class_uid(sop_class)
                .build()
                .encode(true)
        })
    }

    /// Issue a C-MOVE request towards the given destination AE title
    /// and stream its responses.
    pub fn send_c_move(
        &mut self,
        destination_ae_title: &str,
        identifier: &InMemDicomObject,
        query_model: QueryModel,
    ) -> Result<ResponseStream<'_>> {
        let sop_class = query_model.move_sop_class()?;
        self.start_query(sop_class, identifier, CommandField::CMoveRsp, |message_id| {
            CMoveRq::builder()
                .message_id(message_id)
                .affected_sop_class_uid(sop_class)
                .move_destination(destination_ae_title)
                .build()
                .encode(true)
        })
    }

    fn start_query<F>(
        &mut self,
        sop_class: &str,
        identifier: &InMemDicomObject,
        rsp_field: CommandField,
        build: F,
    ) -> Result<ResponseStream<'_>>
    where
        F: FnOnce(u16) -> crate::dimse::Result<Vec<u8>>,
    {
        ensure!(self.link.is_established(), NotEstablishedSnafu);
        let context = self.select_context(sop_class, "", ServiceClassRole::Scu, None, true)?;

        let message_id = self.next_message_id();
        let command = build(message_id).context(DimseSnafu)?;
        let data = encode_dataset(identifier, &context.transfer_syntax).context(DimseSnafu)?;
        self.link
            .send_message(context.id, &command, Some(&data))?;

        Ok(ResponseStream {
            association: self,
            context_id: context.id,
            transfer_syntax: context.transfer_syntax,
            message_id,
            rsp_field,
            done: false,
        })
    }

    /// Issue a C-CANCEL request for a pending operation.
    ///
    /// The presentation context is either given explicitly
    /// or resolved from the query model of the original request.
    pub fn send_c_cancel(
        &mut self,
        message_id: u16,
        context_id: Option<u8>,
        query_model: Option<QueryModel>,
    ) -> Result<()> {
        ensure!(self.link.is_established(), NotEstablishedSnafu);
        let context = match (context_id, query_model) {
            (Some(id), _) => self
                .link
                .table
                .get(id)
                .cloned()
                .ok_or(Error::MissingCancelTarget)?,
            (None, Some(model)) => self.select_context(
                model.find_sop_class(),
                "",
                ServiceClassRole::Scu,
                None,
                true,
            )?,
            (None, None) => return Err(Error::MissingCancelTarget),
        };

        let command = CCancelRq::builder()
            .message_id_being_responded_to(message_id)
            .build()
            .encode(false)
            .context(DimseSnafu)?;
        self.link.send_message(context.id, &command, None)
    }

    /// Send an N-ACTION request.
    pub fn n_action(
        &mut self,
        requested_sop_class_uid: &str,
        requested_sop_instance_uid: &str,
        action_type_id: u16,
        action_information: Option<&InMemDicomObject>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        let command = NActionRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(requested_sop_class_uid)
            .requested_sop_instance_uid(requested_sop_instance_uid)
            .action_type_id(action_type_id)
            .build()
            .encode(action_information.is_some())
            .context(DimseSnafu)?;
        self.n_request(
            requested_sop_class_uid,
            ServiceClassRole::Scu,
            command,
            action_information,
            CommandField::NActionRsp,
            message_id,
        )
    }

    /// Send an N-GET request.
    pub fn n_get(
        &mut self,
        requested_sop_class_uid: &str,
        requested_sop_instance_uid: &str,
        attribute_identifier_list: Vec<Tag>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        let command = NGetRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(requested_sop_class_uid)
            .requested_sop_instance_uid(requested_sop_instance_uid)
            .attribute_identifier_list(attribute_identifier_list)
            .build()
            .encode(false)
            .context(DimseSnafu)?;
        self.n_request(
            requested_sop_class_uid,
            ServiceClassRole::Scu,
            command,
            None,
            CommandField::NGetRsp,
            message_id,
        )
    }

    /// Send an N-SET request.
    pub fn n_set(
        &mut self,
        requested_sop_class_uid: &str,
        requested_sop_instance_uid: &str,
        modification_list: &InMemDicomObject,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        let command = NSetRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(requested_sop_class_uid)
            .requested_sop_instance_uid(requested_sop_instance_uid)
            .build()
            .encode(true)
            .context(DimseSnafu)?;
        self.n_request(
            requested_sop_class_uid,
            ServiceClassRole::Scu,
            command,
            Some(modification_list),
            CommandField::NSetRsp,
            message_id,
        )
    }

    /// Send an N-CREATE request.
    pub fn n_create(
        &mut self,
        affected_sop_class_uid: &str,
        affected_sop_instance_uid: Option<&str>,
        attribute_list: Option<&InMemDicomObject>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        let command = NCreateRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(affected_sop_class_uid)
            .maybe_affected_sop_instance_uid(affected_sop_instance_uid)
            .build()
            .encode(attribute_list.is_some())
            .context(DimseSnafu)?;
        self.n_request(
            affected_sop_class_uid,
            ServiceClassRole::Scu,
            command,
            attribute_list,
            CommandField::NCreateRsp,
            message_id,
        )
    }

    /// Send an N-DELETE request.
    pub fn n_delete(
        &mut self,
        requested_sop_class_uid: &str,
        requested_sop_instance_uid: &str,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        let command = NDeleteRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(requested_sop_class_uid)
            .requested_sop_instance_uid(requested_sop_instance_uid)
            .build()
            .encode(false)
            .context(DimseSnafu)?;
        self.n_request(
            requested_sop_class_uid,
            ServiceClassRole::Scu,
            command,
            None,
            CommandField::NDeleteRsp,
            message_id,
        )
    }

    /// Send an N-EVENT-REPORT request.
    ///
    /// Event reports flow from the provider to the user,
    /// so the presentation context must concede the SCP role
    /// to this node.
    pub fn n_event_report(
        &mut self,
        affected_sop_class_uid: &str,
        affected_sop_instance_uid: &str,
        event_type_id: u16,
        event_information: Option<&InMemDicomObject>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        let command = NEventReportRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(affected_sop_class_uid)
            .affected_sop_instance_uid(affected_sop_instance_uid)
            .event_type_id(event_type_id)
            .build()
            .encode(event_information.is_some())
            .context(DimseSnafu)?;
        self.n_request(
            affected_sop_class_uid,
            ServiceClassRole::Scp,
            command,
            event_information,
            CommandField::NEventReportRsp,
            message_id,
        )
    }

    fn n_request(
        &mut self,
        sop_class_uid: &str,
        role: ServiceClassRole,
        command: Vec<u8>,
        dataset: Option<&InMemDicomObject>,
        rsp_field: CommandField,
        message_id: u16,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        ensure!(self.link.is_established(), NotEstablishedSnafu);
        let context = self.select_context(sop_class_uid, "", role, None, true)?;

        let data = dataset
            .map(|ds| encode_dataset(ds, &context.transfer_syntax))
            .transpose()
            .context(DimseSnafu)?;
        self.link
            .send_message(context.id, &command, data.as_deref())?;

        match self.wait_response(rsp_field, message_id)? {
            Some(message) => {
                let status = message.status().context(DimseSnafu)?;
                let dataset = message
                    .decode_data(&context.transfer_syntax)
                    .context(DimseSnafu)?;
                Ok((status, dataset))
            }
            None => Err(Error::Aborted),
        }
    }
}

impl Drop for RequestorAssociation {
    fn drop(&mut self) {
        if self.link.is_established() {
            let _ = self.link.local_release();
        }
    }
}

fn element_uid(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object.get(tag).and_then(|el| {
        el.to_str()
            .ok()
            .map(|s| s.trim_end_matches('\0').trim().to_string())
    })
}

/// A streaming view over the responses of a C-FIND, C-GET
/// or C-MOVE operation.
///
/// The stream is lazy: each `next` call drives the association
/// reactor until the next response arrives. It can be consumed only
/// once, and it is exhausted after the first non-pending status.
/// If the association aborts while waiting (including on a DIMSE
/// timeout), the stream simply ends; inspect the association's
/// terminal state to tell the cases apart.
#[must_use = "response streams are lazy and do nothing unless consumed"]
pub struct ResponseStream<'a> {
    association: &'a mut RequestorAssociation,
    context_id: u8,
    transfer_syntax: String,
    message_id: u16,
    rsp_field: CommandField,
    done: bool,
}

impl ResponseStream<'_> {
    /// The message ID of the originating request,
    /// as needed for a C-CANCEL.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Ask the peer to cancel the pending operation.
    ///
    /// The stream stays consumable: keep iterating until the
    /// terminal response, normally `0xFE00`, arrives.
    pub fn cancel(&mut self) -> Result<()> {
        self.association
            .send_c_cancel(self.message_id, Some(self.context_id), None)
    }
}

impl Iterator for ResponseStream<'_> {
    type Item = Result<(u16, Option<InMemDicomObject>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let message = match self
            .association
            .wait_response(self.rsp_field, self.message_id)
        {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let status = match message.status().context(DimseSnafu) {
            Ok(status) => status,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if is_terminal(status) {
            self.done = true;
        }
        let identifier = match message
            .decode_data(&self.transfer_syntax)
            .context(DimseSnafu)
        {
            Ok(identifier) => identifier,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        Some(Ok((status, identifier)))
    }
}
