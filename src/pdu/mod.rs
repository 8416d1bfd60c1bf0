//! Protocol data unit model.
//!
//! The types in this module represent the seven upper layer PDU kinds
//! exchanged between DICOM application entities,
//! plus the negotiation sub-items carried in the user information field.
//! Reading and writing them from byte streams
//! is the job of the [`reader`] and [`writer`] submodules.

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes:
/// PDU type (1), reserved (1), PDU length (4).
pub const PDU_HEADER_SIZE: u32 = 6;

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax with one or more candidate transfer syntaxes.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd integer in `[1, 255]`
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of a single presentation context negotiation,
/// as carried in an A-ASSOCIATE-AC.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax chosen by the acceptor
    /// (not significant unless accepted)
    pub transfer_syntax: String,
}

/// Reason field of a presentation context result.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from_code(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// Result field of an A-ASSOCIATE-RJ.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJResult {
    /// rejected-permanent
    Permanent,
    /// rejected-transient
    Transient,
}

impl AssociationRJResult {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// Source and reason of an A-ASSOCIATE-RJ,
/// combined because the reason codes depend on the source.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJSource {
    /// DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// DICOM UL service-provider (ACSE related function)
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    /// DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, r @ 4..=6) | (1, r @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(r),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, r) if r == 0 || (3..=7).contains(&r) => {
                Some(AssociationRJSource::ServiceProviderPresentation(
                    AssociationRJServiceProviderPresentationReason::Reserved(r),
                ))
            }
            _ => None,
        }
    }

    pub fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(r) => {
                let reason = match r {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(r) => r,
                };
                (1, reason)
            }
            AssociationRJSource::ServiceProviderAsce(r) => {
                let reason = match r {
                    AssociationRJServiceProviderAsceReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 2,
                };
                (2, reason)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                let reason = match r {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(r) => r,
                };
                (3, reason)
            }
        }
    }
}

/// Service-user rejection reasons.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

/// Service-provider (ACSE) rejection reasons.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// Service-provider (presentation) rejection reasons.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// Source field of an A-ABORT.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQSource {
    /// DICOM UL service-user initiated abort
    ServiceUser,
    /// DICOM UL service-provider initiated abort
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(r) => {
                let reason = match r {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                };
                (2, reason)
            }
        }
    }
}

/// Service-provider abort reasons.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// A single presentation data value item of a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment
/// carries command set or data set bytes.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The type of identity claimed in user identity negotiation.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum UserIdentityType {
    /// username as a UTF-8 string
    Username = 1,
    /// username and passcode
    UsernamePassword = 2,
    /// Kerberos service ticket
    KerberosServiceTicket = 3,
    /// SAML assertion
    SamlAssertion = 4,
    /// JSON web token
    Jwt = 5,
}

impl UserIdentityType {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }
}

/// A user identity negotiation sub-item (A-ASSOCIATE-RQ side).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserIdentity {
    identity_type: UserIdentityType,
    positive_response_requested: bool,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            identity_type,
            positive_response_requested,
            primary_field,
            secondary_field,
        }
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// An SCP/SCU role selection sub-item,
/// claiming the roles the requestor proposes (RQ)
/// or the acceptor concedes (AC) for one SOP class.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class (or meta SOP class) UID the roles apply to
    pub sop_class_uid: String,
    /// whether the sender supports the SCU role
    pub scu_role: bool,
    /// whether the sender supports the SCP role
    pub scp_role: bool,
}

/// A SOP class common extended negotiation sub-item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_uid: String,
    pub related_general_sop_class_uids: Vec<String>,
}

/// A user information sub-item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    /// (0x51) maximum length receivable by the sender
    MaxLength(u32),
    /// (0x52) implementation class UID
    ImplementationClassUID(String),
    /// (0x53) asynchronous operations window: (invoked, performed)
    AsyncOperationsWindow(u16, u16),
    /// (0x54) SCP/SCU role selection
    RoleSelection(RoleSelection),
    /// (0x55) implementation version name
    ImplementationVersionName(String),
    /// (0x56) SOP class extended negotiation:
    /// SOP class UID and opaque service class application information
    SopClassExtendedNegotiation(String, Vec<u8>),
    /// (0x57) SOP class common extended negotiation
    SopClassCommonExtendedNegotiation(CommonExtendedNegotiation),
    /// (0x58) user identity negotiation
    UserIdentity(UserIdentity),
    /// (0x59) user identity server response
    UserIdentityResponse(Vec<u8>),
    /// any other sub-item, carried opaquely
    Unknown(u8, Vec<u8>),
}

/// An intermediate variable item of an association PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// The body of an A-ASSOCIATE-RQ PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// The body of an A-ASSOCIATE-AC PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationAC {
    pub protocol_version: u16,
    /// mirrored from the request; not significant on receive
    pub calling_ae_title: String,
    /// mirrored from the request; not significant on receive
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// The body of an A-ASSOCIATE-RJ PDU.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

/// A DICOM upper layer protocol data unit.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (0x01)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (0x02)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (0x03)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (0x04)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (0x05)
    ReleaseRQ,
    /// A-RELEASE-RP (0x06)
    ReleaseRP,
    /// A-ABORT (0x07)
    AbortRQ { source: AbortRQSource },
    /// a PDU of unrecognized type, carried opaquely
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short name for logging purposes.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "<unknown>",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_round_trip() {
        for (source, reason) in [(1, 1), (1, 3), (1, 7), (2, 1), (2, 2), (3, 1), (3, 2)] {
            let parsed = AssociationRJSource::from_codes(source, reason).unwrap();
            assert_eq!(parsed.codes(), (source, reason));
        }
        assert!(AssociationRJSource::from_codes(4, 1).is_none());
        assert!(AssociationRJSource::from_codes(2, 9).is_none());
    }

    #[test]
    fn abort_codes_round_trip() {
        for reason in 0..=6 {
            let parsed = AbortRQSource::from_codes(2, reason).unwrap();
            assert_eq!(parsed.codes(), (2, reason));
        }
        assert_eq!(
            AbortRQSource::from_codes(0, 0),
            Some(AbortRQSource::ServiceUser)
        );
        assert!(AbortRQSource::from_codes(3, 0).is_none());
    }
}
