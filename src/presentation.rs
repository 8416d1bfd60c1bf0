//! Negotiated presentation context table.
//!
//! After an association reaches the data transfer state,
//! the negotiated contexts are frozen into a [`ContextTable`]
//! which resolves context IDs for outgoing DIMSE messages
//! and validates the context IDs of incoming ones.

use snafu::Snafu;

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection,
};
use dicom_dictionary_std::uids;

/// A service class user or a provider.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum ServiceClassRole {
    /// Service Class User
    Scu,
    /// Service Class Provider
    Scp,
}

/// A single negotiated presentation context,
/// as seen from the local application entity.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContext {
    /// the presentation context identifier
    pub id: u8,
    /// the negotiation outcome
    pub result: PresentationContextResultReason,
    /// the abstract syntax UID proposed for this context
    pub abstract_syntax: String,
    /// the transfer syntax chosen by the acceptor
    /// (meaningful only when accepted)
    pub transfer_syntax: String,
    /// whether the local node may act as SCU on this context
    pub scu: bool,
    /// whether the local node may act as SCP on this context
    pub scp: bool,
}

impl PresentationContext {
    pub fn is_accepted(&self) -> bool {
        self.result == PresentationContextResultReason::Acceptance
    }

    fn allows(&self, role: ServiceClassRole) -> bool {
        match role {
            ServiceClassRole::Scu => self.scu,
            ServiceClassRole::Scp => self.scp,
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("No presentation context for {}", abstract_syntax))]
    NoPresentationContext { abstract_syntax: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The Unified Procedure Step SOP classes which may substitute
/// for each other when resolving a presentation context.
const UPS_SOP_CLASSES: [&str; 4] = [
    uids::UNIFIED_PROCEDURE_STEP_PUSH,
    uids::UNIFIED_PROCEDURE_STEP_WATCH,
    uids::UNIFIED_PROCEDURE_STEP_PULL,
    uids::UNIFIED_PROCEDURE_STEP_EVENT,
];

/// The table of negotiated presentation contexts of one association.
/// Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ContextTable {
    contexts: Vec<PresentationContext>,
}

impl ContextTable {
    pub fn new(contexts: Vec<PresentationContext>) -> Self {
        ContextTable { contexts }
    }

    /// Build the requestor-side view of the negotiation outcome
    /// by matching the acceptor's results against the proposed contexts.
    ///
    /// Results which do not match any proposed context ID are discarded
    /// with a warning, as they cannot be attributed to an abstract syntax.
    pub fn from_requestor_negotiation(
        proposed: &[PresentationContextProposed],
        results: &[PresentationContextResult],
        proposed_roles: &[RoleSelection],
        accepted_roles: &[RoleSelection],
    ) -> Self {
        let contexts = results
            .iter()
            .filter_map(|result| {
                let pc = match proposed.iter().find(|pc| pc.id == result.id) {
                    Some(pc) => pc,
                    None => {
                        tracing::warn!(
                            "Discarding presentation context result with unknown ID {}",
                            result.id
                        );
                        return None;
                    }
                };
                let (scu, scp) = resolve_roles(
                    &pc.abstract_syntax,
                    proposed_roles,
                    accepted_roles,
                    crate::machine::Mode::Requestor,
                );
                Some(PresentationContext {
                    id: result.id,
                    result: result.reason,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax: result.transfer_syntax.clone(),
                    scu,
                    scp,
                })
            })
            .collect();
        ContextTable { contexts }
    }

    /// All negotiated contexts, including rejected ones.
    pub fn contexts(&self) -> &[PresentationContext] {
        &self.contexts
    }

    /// All accepted contexts.
    pub fn accepted(&self) -> impl Iterator<Item = &PresentationContext> {
        self.contexts.iter().filter(|pc| pc.is_accepted())
    }

    /// Whether the given context ID was accepted.
    pub fn is_accepted(&self, context_id: u8) -> bool {
        self.get(context_id).is_some()
    }

    /// Look up an accepted context by ID.
    pub fn get(&self, context_id: u8) -> Option<&PresentationContext> {
        self.contexts
            .iter()
            .find(|pc| pc.id == context_id && pc.is_accepted())
    }

    /// Resolve the presentation context to use
    /// for a message of the given abstract syntax and role.
    ///
    /// When `context_id` is given, the context must exist, be accepted,
    /// and match the abstract syntax and role. Otherwise the table is
    /// searched for an accepted context matching the abstract syntax and
    /// role, preferring an exact transfer syntax match when
    /// `transfer_syntax` is non-empty. With `allow_conversion`, a context
    /// with a different transfer syntax is admitted (the caller will
    /// re-encode the data set). Unified Procedure Step SOP classes may
    /// substitute for each other when no direct match exists.
    pub fn select_context(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
        role: ServiceClassRole,
        context_id: Option<u8>,
        allow_conversion: bool,
    ) -> Result<&PresentationContext> {
        let fail = || {
            NoPresentationContextSnafu {
                abstract_syntax: abstract_syntax.to_string(),
            }
            .fail()
        };

        if let Some(id) = context_id {
            return match self.get(id) {
                Some(pc) if pc.abstract_syntax == abstract_syntax && pc.allows(role) => Ok(pc),
                _ => fail(),
            };
        }

        if let Some(pc) = self.match_syntax(abstract_syntax, transfer_syntax, role, allow_conversion)
        {
            return Ok(pc);
        }

        // a Unified Procedure Step operation may ride on
        // any of the other UPS SOP class contexts
        if UPS_SOP_CLASSES.contains(&abstract_syntax) {
            for candidate in UPS_SOP_CLASSES
                .iter()
                .filter(|uid| **uid != abstract_syntax)
            {
                if let Some(pc) =
                    self.match_syntax(candidate, transfer_syntax, role, allow_conversion)
                {
                    return Ok(pc);
                }
            }
        }

        fail()
    }

    fn match_syntax(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
        role: ServiceClassRole,
        allow_conversion: bool,
    ) -> Option<&PresentationContext> {
        let mut candidates = self
            .accepted()
            .filter(|pc| pc.abstract_syntax == abstract_syntax && pc.allows(role));

        if transfer_syntax.is_empty() {
            return candidates.next();
        }

        let mut fallback = None;
        for pc in candidates {
            if pc.transfer_syntax == transfer_syntax {
                return Some(pc);
            }
            fallback.get_or_insert(pc);
        }
        if allow_conversion {
            fallback
        } else {
            None
        }
    }
}

/// Resolve the effective local roles for the given SOP class
/// from the role selection items exchanged during negotiation.
///
/// The role flags of the items always refer to the requestor,
/// so the acceptor's view is the mirror image. When no role item
/// was exchanged for the SOP class, the requestor is the SCU
/// and the acceptor is the SCP.
pub fn resolve_roles(
    sop_class_uid: &str,
    requestor_roles: &[RoleSelection],
    acceptor_roles: &[RoleSelection],
    mode: crate::machine::Mode,
) -> (bool, bool) {
    let proposed = requestor_roles
        .iter()
        .find(|r| r.sop_class_uid == sop_class_uid);
    let accepted = acceptor_roles
        .iter()
        .find(|r| r.sop_class_uid == sop_class_uid);

    let (requestor_scu, requestor_scp) = match (proposed, accepted) {
        (Some(p), Some(a)) => (p.scu_role && a.scu_role, p.scp_role && a.scp_role),
        // no agreement reached, fall back to the defaults
        _ => (true, false),
    };

    match mode {
        crate::machine::Mode::Requestor => (requestor_scu, requestor_scp),
        crate::machine::Mode::Acceptor => (requestor_scp, requestor_scu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Mode;

    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn accepted(id: u8, abstract_syntax: &str, transfer_syntax: &str) -> PresentationContext {
        PresentationContext {
            id,
            result: PresentationContextResultReason::Acceptance,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntax: transfer_syntax.to_string(),
            scu: true,
            scp: false,
        }
    }

    #[test]
    fn exact_transfer_syntax_preferred() {
        let table = ContextTable::new(vec![
            accepted(1, uids::VERIFICATION, IMPLICIT_VR_LE),
            accepted(3, uids::VERIFICATION, EXPLICIT_VR_LE),
        ]);

        let pc = table
            .select_context(
                uids::VERIFICATION,
                EXPLICIT_VR_LE,
                ServiceClassRole::Scu,
                None,
                false,
            )
            .unwrap();
        assert_eq!(pc.id, 3);
    }

    #[test]
    fn conversion_fallback_requires_flag() {
        let table = ContextTable::new(vec![accepted(1, uids::VERIFICATION, IMPLICIT_VR_LE)]);

        assert!(table
            .select_context(
                uids::VERIFICATION,
                EXPLICIT_VR_LE,
                ServiceClassRole::Scu,
                None,
                false,
            )
            .is_err());

        let pc = table
            .select_context(
                uids::VERIFICATION,
                EXPLICIT_VR_LE,
                ServiceClassRole::Scu,
                None,
                true,
            )
            .unwrap();
        assert_eq!(pc.id, 1);
    }

    #[test]
    fn explicit_context_id_is_validated() {
        let table = ContextTable::new(vec![
            accepted(1, uids::VERIFICATION, IMPLICIT_VR_LE),
            PresentationContext {
                id: 3,
                result: PresentationContextResultReason::AbstractSyntaxNotSupported,
                abstract_syntax: uids::VERIFICATION.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
                scu: true,
                scp: false,
            },
        ]);

        assert!(table
            .select_context(uids::VERIFICATION, "", ServiceClassRole::Scu, Some(1), false)
            .is_ok());
        // rejected context
        assert!(table
            .select_context(uids::VERIFICATION, "", ServiceClassRole::Scu, Some(3), false)
            .is_err());
        // wrong role
        assert!(table
            .select_context(uids::VERIFICATION, "", ServiceClassRole::Scp, Some(1), false)
            .is_err());
    }

    #[test]
    fn ups_push_falls_back_to_other_ups_contexts() {
        let table = ContextTable::new(vec![accepted(
            5,
            uids::UNIFIED_PROCEDURE_STEP_PULL,
            IMPLICIT_VR_LE,
        )]);

        let pc = table
            .select_context(
                uids::UNIFIED_PROCEDURE_STEP_PUSH,
                IMPLICIT_VR_LE,
                ServiceClassRole::Scu,
                None,
                false,
            )
            .unwrap();
        assert_eq!(pc.id, 5);

        // the fallback is reserved for the UPS family
        assert!(table
            .select_context(
                uids::VERIFICATION,
                IMPLICIT_VR_LE,
                ServiceClassRole::Scu,
                None,
                false,
            )
            .is_err());
    }

    #[test]
    fn role_resolution_defaults_and_mirror() {
        // no role items: requestor is SCU, acceptor is SCP
        assert_eq!(
            resolve_roles(uids::VERIFICATION, &[], &[], Mode::Requestor),
            (true, false)
        );
        assert_eq!(
            resolve_roles(uids::VERIFICATION, &[], &[], Mode::Acceptor),
            (false, true)
        );

        // both peers agree on reversed roles
        let proposed = [RoleSelection {
            sop_class_uid: uids::VERIFICATION.to_string(),
            scu_role: false,
            scp_role: true,
        }];
        let accepted = [RoleSelection {
            sop_class_uid: uids::VERIFICATION.to_string(),
            scu_role: false,
            scp_role: true,
        }];
        assert_eq!(
            resolve_roles(uids::VERIFICATION, &proposed, &accepted, Mode::Requestor),
            (false, true)
        );
        assert_eq!(
            resolve_roles(uids::VERIFICATION, &proposed, &accepted, Mode::Acceptor),
            (true, false)
        );

        // the acceptor does not concede the proposed SCP role
        let denied = [RoleSelection {
            sop_class_uid: uids::VERIFICATION.to_string(),
            scu_role: true,
            scp_role: false,
        }];
        let proposed_both = [RoleSelection {
            sop_class_uid: uids::VERIFICATION.to_string(),
            scu_role: true,
            scp_role: true,
        }];
        assert_eq!(
            resolve_roles(uids::VERIFICATION, &proposed_both, &denied, Mode::Requestor),
            (true, false)
        );
    }
}
