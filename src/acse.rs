//! Association control: acceptor-side evaluation
//! of association requests.
//!
//! Given the local configuration and the handler registry,
//! [`evaluate_association_rq`] turns an incoming A-ASSOCIATE-RQ into
//! either the A-ASSOCIATE-AC to send back (plus the negotiated state
//! the association keeps) or the A-ASSOCIATE-RJ that ends the attempt.

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::debug;

use crate::config::AeConfig;
use crate::events::{EventRegistry, NegotiationKind};
use crate::machine::Mode;
use crate::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceProviderAsceReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PresentationContextResult, PresentationContextResultReason, RoleSelection, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use crate::presentation::{resolve_roles, ContextTable, PresentationContext};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// The application context name of the DICOM application context,
/// the only one defined by the standard.
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implicit VR Little Endian, the default transfer syntax.
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The outcome of a successful association negotiation,
/// from the acceptor's point of view.
#[derive(Debug)]
pub struct NegotiatedAssociation {
    /// the A-ASSOCIATE-AC to send back to the requestor
    pub ac: AssociationAC,
    /// the negotiated presentation contexts, acceptor view
    pub table: ContextTable,
    /// the maximum PDU body length the requestor can receive
    pub peer_max_pdu_length: u32,
    /// the requestor's AE title
    pub peer_ae_title: String,
    /// the user information items received from the requestor
    pub peer_user_variables: Vec<UserVariableItem>,
}

/// The effective bound for outgoing PDUs:
/// the smaller of what the peer can receive
/// and what we are configured to produce, 0 meaning unlimited.
pub fn negotiated_max_pdu(peer_proposed: u32, local_configured: u32) -> u32 {
    match (peer_proposed, local_configured) {
        (0, 0) => u32::MAX,
        (0, local) => local,
        (peer, 0) => peer,
        (peer, local) => peer.min(local),
    }
}

/// Check that a transfer syntax is supported by the main registry,
/// meaning that data sets in it can be decoded.
pub fn is_supported(ts_uid: &str) -> bool {
    TransferSyntaxRegistry
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// From a sequence of transfer syntaxes, choose the first
/// supported by the main registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

fn reject(
    result: AssociationRJResult,
    source: AssociationRJSource,
) -> Result<NegotiatedAssociation, AssociationRJ> {
    Err(AssociationRJ { result, source })
}

/// Evaluate an association request against the local configuration,
/// the supported abstract and transfer syntaxes,
/// and the registered negotiation hooks.
pub fn evaluate_association_rq(
    config: &AeConfig,
    abstract_syntaxes: &[String],
    transfer_syntaxes: &[String],
    registry: &mut EventRegistry,
    rq: AssociationRQ,
) -> Result<NegotiatedAssociation, AssociationRJ> {
    let AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        user_variables,
    } = rq;

    // only bit 0 of the protocol version is tested
    if protocol_version & 0x0001 == 0 {
        return reject(
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            ),
        );
    }

    if application_context_name != DICOM_APPLICATION_CONTEXT_NAME {
        return reject(
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        );
    }

    if config.require_called_aet && called_ae_title != config.ae_title {
        debug!(
            "Rejecting association: called AE title `{}` does not match `{}`",
            called_ae_title, config.ae_title
        );
        return reject(
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        );
    }

    if !config.require_calling_aet.is_empty()
        && !config.require_calling_aet.contains(&calling_ae_title)
    {
        debug!(
            "Rejecting association: calling AE title `{}` is not in the allow list",
            calling_ae_title
        );
        return reject(
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
        );
    }

    let peer_max_pdu_length = user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU);

    // negotiation hooks get a say on the items echoed back
    let mut hook_items = Vec::new();
    let mut accepted_roles: Vec<RoleSelection> = Vec::new();
    let proposed_roles: Vec<RoleSelection> = user_variables
        .iter()
        .filter_map(|item| match item {
            UserVariableItem::RoleSelection(role) => Some(role.clone()),
            _ => None,
        })
        .collect();

    for item in &user_variables {
        let kind = match item {
            UserVariableItem::UserIdentity(_) => NegotiationKind::UserIdentity,
            UserVariableItem::SopClassExtendedNegotiation(..) => NegotiationKind::SopClassExtended,
            UserVariableItem::SopClassCommonExtendedNegotiation(_) => {
                NegotiationKind::SopClassCommonExtended
            }
            UserVariableItem::RoleSelection(_) => NegotiationKind::RoleSelection,
            _ => continue,
        };
        let response = if registry.has_negotiation(kind) {
            registry.negotiate(kind, item)
        } else {
            // without a hook, negotiation items are copied through:
            // role selection and extended negotiation are echoed as
            // proposed, while the request-only items have no response
            match kind {
                NegotiationKind::RoleSelection | NegotiationKind::SopClassExtended => {
                    Some(item.clone())
                }
                NegotiationKind::UserIdentity | NegotiationKind::SopClassCommonExtended => None,
            }
        };
        if let Some(response) = response {
            if let UserVariableItem::RoleSelection(role) = &response {
                accepted_roles.push(role.clone());
            }
            hook_items.push(response);
        }
    }

    let negotiated: Vec<PresentationContext> = presentation_contexts
        .into_iter()
        .map(|pc| {
            let supported = abstract_syntaxes.iter().any(|uid| *uid == pc.abstract_syntax)
                || config.unrestricted_storage_service;
            let (result, transfer_syntax) = if !supported {
                (
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    IMPLICIT_VR_LE.to_string(),
                )
            } else {
                let chosen = if transfer_syntaxes.is_empty() {
                    choose_supported(pc.transfer_syntaxes)
                } else {
                    pc.transfer_syntaxes
                        .into_iter()
                        .find(|ts| transfer_syntaxes.contains(ts) && is_supported(ts))
                };
                match chosen {
                    Some(ts) => (PresentationContextResultReason::Acceptance, ts),
                    None => (
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                        IMPLICIT_VR_LE.to_string(),
                    ),
                }
            };

            let (scu, scp) = resolve_roles(
                &pc.abstract_syntax,
                &proposed_roles,
                &accepted_roles,
                Mode::Acceptor,
            );
            PresentationContext {
                id: pc.id,
                result,
                abstract_syntax: pc.abstract_syntax,
                transfer_syntax,
                scu,
                scp,
            }
        })
        .collect();

    let mut ac_user_variables = vec![
        UserVariableItem::MaxLength(config.maximum_pdu_size),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];
    ac_user_variables.extend(hook_items);

    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: calling_ae_title.clone(),
        called_ae_title,
        application_context_name: application_context_name.clone(),
        presentation_contexts: negotiated
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: pc.result,
                transfer_syntax: pc.transfer_syntax.clone(),
            })
            .collect(),
        user_variables: ac_user_variables,
    };

    Ok(NegotiatedAssociation {
        ac,
        table: ContextTable::new(negotiated),
        peer_max_pdu_length,
        peer_ae_title: calling_ae_title,
        peer_user_variables: user_variables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextProposed;
    use dicom_dictionary_std::uids;

    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn sample_rq(called: &str, calling: &str) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: calling.to_string(),
            called_ae_title: called.to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: uids::VERIFICATION.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(8192)],
        }
    }

    fn verification_only() -> Vec<String> {
        vec![uids::VERIFICATION.to_string()]
    }

    #[test]
    fn accepts_verification_context() {
        let config = AeConfig::default();
        let mut registry = EventRegistry::new();
        let outcome = evaluate_association_rq(
            &config,
            &verification_only(),
            &[],
            &mut registry,
            sample_rq("ANY-SCP", "SOME-SCU"),
        )
        .expect("association should be accepted");

        assert_eq!(outcome.peer_max_pdu_length, 8192);
        assert_eq!(outcome.peer_ae_title, "SOME-SCU");
        let pc = outcome.table.get(1).expect("context 1 accepted");
        assert_eq!(pc.transfer_syntax, IMPLICIT_VR_LE);
        // the acceptor side defaults to the SCP role
        assert!(pc.scp);
        assert!(!pc.scu);
    }

    #[test]
    fn rejects_mismatched_called_ae_title() {
        let mut config = AeConfig::default();
        config.ae_title = "ACCEPT".to_string();
        config.require_called_aet = true;
        let mut registry = EventRegistry::new();

        let rejection = evaluate_association_rq(
            &config,
            &verification_only(),
            &[],
            &mut registry,
            sample_rq("OTHER", "SOME-SCU"),
        )
        .expect_err("association should be rejected");

        assert_eq!(rejection.result, AssociationRJResult::Permanent);
        assert_eq!(rejection.source.codes(), (1, 7));
    }

    #[test]
    fn rejects_calling_ae_title_not_in_allow_list() {
        let mut config = AeConfig::default();
        config.require_calling_aet = vec!["TRUSTED".to_string()];
        let mut registry = EventRegistry::new();

        let rejection = evaluate_association_rq(
            &config,
            &verification_only(),
            &[],
            &mut registry,
            sample_rq("ANY-SCP", "STRANGER"),
        )
        .expect_err("association should be rejected");

        assert_eq!(rejection.source.codes(), (1, 3));
    }

    #[test]
    fn rejects_unsupported_protocol_version() {
        let config = AeConfig::default();
        let mut registry = EventRegistry::new();
        let mut rq = sample_rq("ANY-SCP", "SOME-SCU");
        rq.protocol_version = 2;

        let rejection = evaluate_association_rq(
            &config,
            &verification_only(),
            &[],
            &mut registry,
            rq,
        )
        .expect_err("association should be rejected");
        assert_eq!(rejection.source.codes(), (2, 2));
    }

    #[test]
    fn unsupported_abstract_syntax_marks_context() {
        let config = AeConfig::default();
        let mut registry = EventRegistry::new();
        let mut rq = sample_rq("ANY-SCP", "SOME-SCU");
        rq.presentation_contexts.push(PresentationContextProposed {
            id: 3,
            abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        });

        let outcome = evaluate_association_rq(
            &config,
            &verification_only(),
            &[],
            &mut registry,
            rq,
        )
        .expect("association should be accepted");
        let results = &outcome.ac.presentation_contexts;
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert!(!outcome.table.is_accepted(3));
    }

    #[test]
    fn unrestricted_storage_accepts_any_sop_class() {
        let mut config = AeConfig::default();
        config.unrestricted_storage_service = true;
        let mut registry = EventRegistry::new();
        let mut rq = sample_rq("ANY-SCP", "SOME-SCU");
        rq.presentation_contexts = vec![PresentationContextProposed {
            id: 9,
            abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
            transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string()],
        }];

        let outcome =
            evaluate_association_rq(&config, &[], &[], &mut registry, rq).expect("accepted");
        let pc = outcome.table.get(9).expect("context 9 accepted");
        assert_eq!(pc.transfer_syntax, EXPLICIT_VR_LE);
    }

    #[test]
    fn transfer_syntax_restriction_applies() {
        let config = AeConfig::default();
        let mut registry = EventRegistry::new();
        let mut rq = sample_rq("ANY-SCP", "SOME-SCU");
        rq.presentation_contexts[0].transfer_syntaxes = vec![EXPLICIT_VR_LE.to_string()];

        let outcome = evaluate_association_rq(
            &config,
            &verification_only(),
            &[IMPLICIT_VR_LE.to_string()],
            &mut registry,
            rq,
        )
        .expect("association should be accepted");
        assert_eq!(
            outcome.ac.presentation_contexts[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }

    #[test]
    fn negotiated_max_pdu_handles_unlimited() {
        assert_eq!(negotiated_max_pdu(0, 0), u32::MAX);
        assert_eq!(negotiated_max_pdu(0, 16384), 16384);
        assert_eq!(negotiated_max_pdu(32768, 0), 32768);
        assert_eq!(negotiated_max_pdu(32768, 16384), 16384);
    }
}
