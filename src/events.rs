//! Event handler registry.
//!
//! Two families of events are distinguished.
//! *Notification* events merely inform the application of protocol
//! activity; any number of handlers may be registered for each kind and
//! all of them run in registration order, with failures logged and
//! swallowed. *Intervention* events produce the response of a DIMSE
//! service or a negotiation decision; exactly one handler may be bound
//! per kind, and a failing handler maps to the protocol-defined failure
//! status of the service in question.

use std::collections::HashMap;

use dicom_object::InMemDicomObject;
use tracing::warn;

use crate::pdu::UserVariableItem;

/// A boxed error from a user-provided handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The kinds of notification events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    AssociationRequested,
    AssociationAccepted,
    AssociationRejected,
    AssociationEstablished,
    AssociationReleased,
    AssociationAborted,
    PduSent,
    PduReceived,
    DimseSent,
    DimseReceived,
    ConnectionOpen,
    ConnectionClosed,
}

/// A notification event with its payload.
#[derive(Debug, Clone)]
pub enum Notification<'a> {
    AssociationRequested {
        calling_ae_title: &'a str,
        called_ae_title: &'a str,
    },
    AssociationAccepted,
    AssociationRejected,
    AssociationEstablished {
        peer_ae_title: &'a str,
    },
    AssociationReleased,
    AssociationAborted,
    PduSent {
        description: &'static str,
    },
    PduReceived {
        description: &'static str,
    },
    DimseSent {
        context_id: u8,
    },
    DimseReceived {
        context_id: u8,
    },
    ConnectionOpen,
    ConnectionClosed,
}

impl Notification<'_> {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::AssociationRequested { .. } => NotificationKind::AssociationRequested,
            Notification::AssociationAccepted => NotificationKind::AssociationAccepted,
            Notification::AssociationRejected => NotificationKind::AssociationRejected,
            Notification::AssociationEstablished { .. } => NotificationKind::AssociationEstablished,
            Notification::AssociationReleased => NotificationKind::AssociationReleased,
            Notification::AssociationAborted => NotificationKind::AssociationAborted,
            Notification::PduSent { .. } => NotificationKind::PduSent,
            Notification::PduReceived { .. } => NotificationKind::PduReceived,
            Notification::DimseSent { .. } => NotificationKind::DimseSent,
            Notification::DimseReceived { .. } => NotificationKind::DimseReceived,
            Notification::ConnectionOpen => NotificationKind::ConnectionOpen,
            Notification::ConnectionClosed => NotificationKind::ConnectionClosed,
        }
    }
}

/// The kinds of intervention events bound to DIMSE services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterventionKind {
    CEcho,
    CStore,
    CFind,
    CGet,
    CMove,
    NAction,
    NCreate,
    NDelete,
    NEventReport,
    NGet,
    NSet,
}

/// The kinds of negotiation hooks,
/// run while the acceptor evaluates an association request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationKind {
    UserIdentity,
    SopClassExtended,
    SopClassCommonExtended,
    RoleSelection,
}

/// A handler for notification events.
pub trait NotificationHandler: Send {
    fn handle(&mut self, event: &Notification<'_>) -> Result<(), HandlerError>;
}

impl<F> NotificationHandler for F
where
    F: FnMut(&Notification<'_>) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, event: &Notification<'_>) -> Result<(), HandlerError> {
        (self)(event)
    }
}

/// A DIMSE service request, as handed to an intervention handler.
pub struct ServiceRequest<'a> {
    pub kind: InterventionKind,
    /// the presentation context the request arrived on
    pub context_id: u8,
    /// the abstract syntax of that context
    pub abstract_syntax: &'a str,
    /// the decoded command set
    pub command: &'a InMemDicomObject,
    /// the decoded data set, if the message carried one
    pub dataset: Option<&'a InMemDicomObject>,
}

/// The destination of C-MOVE sub-operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveDestination {
    pub host: String,
    pub port: u16,
    pub ae_title: String,
}

/// Sub-operation data produced by a C-GET or C-MOVE handler.
pub struct SubOperations {
    /// where to store the data sets;
    /// `None` for C-GET (stores flow back over the same association)
    /// or for an unresolvable C-MOVE destination
    pub destination: Option<MoveDestination>,
    /// the number of sub-operations about to be performed, when known
    pub remaining: Option<u16>,
    /// the data sets to be stored, in order
    pub datasets: Box<dyn Iterator<Item = Result<InMemDicomObject, HandlerError>> + Send>,
}

/// What an intervention handler produces.
pub enum HandlerOutcome {
    /// a bare status code
    Status(u16),
    /// a status data set; the *Status* element within provides the
    /// status code, and the remaining elements enrich the response
    /// command set
    StatusDataset(InMemDicomObject),
    /// a status code with a response data set
    Dataset(u16, InMemDicomObject),
    /// a stream of `(status, identifier)` responses, ending with
    /// the first non-pending status (C-FIND)
    Responses(Box<dyn Iterator<Item = (u16, Option<InMemDicomObject>)> + Send>),
    /// store sub-operations to perform before the final response
    /// (C-GET and C-MOVE)
    SubOperations(SubOperations),
}

/// A handler for a DIMSE intervention event.
pub trait InterventionHandler: Send {
    fn handle(&mut self, request: ServiceRequest<'_>) -> Result<HandlerOutcome, HandlerError>;
}

impl<F> InterventionHandler for F
where
    F: FnMut(ServiceRequest<'_>) -> Result<HandlerOutcome, HandlerError> + Send,
{
    fn handle(&mut self, request: ServiceRequest<'_>) -> Result<HandlerOutcome, HandlerError> {
        (self)(request)
    }
}

/// A hook over a negotiation item.
///
/// The handler receives each incoming item of its kind and decides
/// what the acceptor echoes back: the returned item is appended to
/// the outgoing user information, `None` omits it. A failing hook
/// also omits the item; the association continues regardless.
pub trait NegotiationHandler: Send {
    fn handle(&mut self, item: &UserVariableItem)
        -> Result<Option<UserVariableItem>, HandlerError>;
}

impl<F> NegotiationHandler for F
where
    F: FnMut(&UserVariableItem) -> Result<Option<UserVariableItem>, HandlerError> + Send,
{
    fn handle(
        &mut self,
        item: &UserVariableItem,
    ) -> Result<Option<UserVariableItem>, HandlerError> {
        (self)(item)
    }
}

/// The registry of event handlers of one application entity.
#[derive(Default)]
pub struct EventRegistry {
    notifications: HashMap<NotificationKind, Vec<Box<dyn NotificationHandler>>>,
    interventions: HashMap<InterventionKind, Box<dyn InterventionHandler>>,
    negotiations: HashMap<NegotiationKind, Box<dyn NegotiationHandler>>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("notifications", &self.notifications.keys())
            .field("interventions", &self.interventions.keys())
            .field("negotiations", &self.negotiations.keys())
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification handler for the given kind.
    pub fn subscribe<H>(&mut self, kind: NotificationKind, handler: H)
    where
        H: NotificationHandler + 'static,
    {
        self.notifications
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Bind the intervention handler for the given kind,
    /// replacing any previous one.
    pub fn bind<H>(&mut self, kind: InterventionKind, handler: H)
    where
        H: InterventionHandler + 'static,
    {
        self.interventions.insert(kind, Box::new(handler));
    }

    /// Bind the negotiation hook for the given kind,
    /// replacing any previous one.
    pub fn bind_negotiation<H>(&mut self, kind: NegotiationKind, handler: H)
    where
        H: NegotiationHandler + 'static,
    {
        self.negotiations.insert(kind, Box::new(handler));
    }

    /// Dispatch a notification to all registered handlers.
    /// Handler failures are logged and do not interrupt the association.
    pub fn notify(&mut self, event: &Notification<'_>) {
        if let Some(handlers) = self.notifications.get_mut(&event.kind()) {
            for handler in handlers {
                if let Err(e) = handler.handle(event) {
                    warn!("Notification handler for {:?} failed: {}", event.kind(), e);
                }
            }
        }
    }

    /// Access the intervention handler for the given kind.
    pub fn intervention(&mut self, kind: InterventionKind) -> Option<&mut dyn InterventionHandler> {
        self.interventions
            .get_mut(&kind)
            .map(|handler| handler.as_mut() as _)
    }

    /// Whether an intervention handler is bound for the given kind.
    pub fn has_intervention(&self, kind: InterventionKind) -> bool {
        self.interventions.contains_key(&kind)
    }

    /// Run the negotiation hook of the given kind over an item.
    ///
    /// Without a registered hook, the item is omitted from the response
    /// (the default acceptor makes no negotiation promises it cannot
    /// keep). A failing hook likewise omits the item.
    pub fn negotiate(
        &mut self,
        kind: NegotiationKind,
        item: &UserVariableItem,
    ) -> Option<UserVariableItem> {
        let handler = self.negotiations.get_mut(&kind)?;
        match handler.handle(item) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Negotiation handler for {:?} failed, omitting item: {}",
                    kind, e
                );
                None
            }
        }
    }

    /// Whether a negotiation hook is bound for the given kind.
    pub fn has_negotiation(&self, kind: NegotiationKind) -> bool {
        self.negotiations.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn notification_handlers_run_in_order_and_swallow_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = EventRegistry::new();

        let hits1 = Arc::clone(&hits);
        registry.subscribe(
            NotificationKind::AssociationEstablished,
            move |_: &Notification<'_>| {
                hits1.fetch_add(1, Ordering::SeqCst);
                Err::<(), HandlerError>("boom".into())
            },
        );
        let hits2 = Arc::clone(&hits);
        registry.subscribe(
            NotificationKind::AssociationEstablished,
            move |_: &Notification<'_>| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        registry.notify(&Notification::AssociationEstablished {
            peer_ae_title: "PEER",
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn intervention_handler_is_single() {
        let mut registry = EventRegistry::new();
        registry.bind(InterventionKind::CEcho, |_req: ServiceRequest<'_>| {
            Ok(HandlerOutcome::Status(0x0000))
        });
        registry.bind(InterventionKind::CEcho, |_req: ServiceRequest<'_>| {
            Ok(HandlerOutcome::Status(0x0122))
        });

        let command = InMemDicomObject::new_empty();
        let outcome = registry
            .intervention(InterventionKind::CEcho)
            .unwrap()
            .handle(ServiceRequest {
                kind: InterventionKind::CEcho,
                context_id: 1,
                abstract_syntax: "1.2.840.10008.1.1",
                command: &command,
                dataset: None,
            })
            .unwrap();
        match outcome {
            HandlerOutcome::Status(status) => assert_eq!(status, 0x0122),
            _ => panic!("unexpected outcome"),
        }
    }

    #[test]
    fn failing_negotiation_hook_omits_item() {
        let mut registry = EventRegistry::new();
        registry.bind_negotiation(NegotiationKind::UserIdentity, |_: &UserVariableItem| {
            Err::<Option<UserVariableItem>, HandlerError>("nope".into())
        });
        let item = UserVariableItem::UserIdentityResponse(vec![1, 2, 3]);
        assert!(registry
            .negotiate(NegotiationKind::UserIdentity, &item)
            .is_none());
    }
}
