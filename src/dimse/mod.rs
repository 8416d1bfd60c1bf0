//! DIMSE message layer.
//!
//! A DIMSE message is a command set and, optionally, a data set,
//! exchanged over one presentation context of an established
//! association. The [`commands`] submodule builds outgoing command
//! sets; the [`codec`] submodule fragments messages into
//! presentation data values and reassembles incoming ones.

pub mod codec;
pub mod commands;

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};

/// Value of the command data set type field
/// when the message carries no data set.
pub const COMMAND_DATA_SET_ABSENT: u16 = 0x0101;

/// Value of the command data set type field
/// when the message carries a data set.
pub const COMMAND_DATA_SET_PRESENT: u16 = 0x0001;

/// The command field codes of the DIMSE services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        use CommandField::*;
        Some(match code {
            0x0001 => CStoreRq,
            0x8001 => CStoreRsp,
            0x0010 => CGetRq,
            0x8010 => CGetRsp,
            0x0020 => CFindRq,
            0x8020 => CFindRsp,
            0x0021 => CMoveRq,
            0x8021 => CMoveRsp,
            0x0030 => CEchoRq,
            0x8030 => CEchoRsp,
            0x0100 => NEventReportRq,
            0x8100 => NEventReportRsp,
            0x0110 => NGetRq,
            0x8110 => NGetRsp,
            0x0120 => NSetRq,
            0x8120 => NSetRsp,
            0x0130 => NActionRq,
            0x8130 => NActionRsp,
            0x0140 => NCreateRq,
            0x8140 => NCreateRsp,
            0x0150 => NDeleteRq,
            0x8150 => NDeleteRsp,
            0x0FFF => CCancelRq,
            _ => return None,
        })
    }

    /// Whether this is a response message (bit 15 set).
    pub fn is_response(self) -> bool {
        self as u16 & 0x8000 != 0
    }
}

/// The priority of a composite service request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// The broad class of a DIMSE status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

/// Classify a status code as defined in PS3.7 annex C.
pub fn status_type(status: u16) -> StatusType {
    match status {
        0x0000 => StatusType::Success,
        0xFF00 | 0xFF01 => StatusType::Pending,
        0xFE00 => StatusType::Cancel,
        0x0001 | 0x0107 | 0x0116 => StatusType::Warning,
        0xB000..=0xBFFF => StatusType::Warning,
        _ => StatusType::Failure,
    }
}

/// Whether the status terminates a response stream.
pub fn is_terminal(status: u16) -> bool {
    status_type(status) != StatusType::Pending
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Command set is missing element {}", name))]
    MissingCommandElement { name: &'static str },

    #[snafu(display("Could not read command element {}", name))]
    ReadCommandElement {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("Unknown command field code {:#06x}", code))]
    UnknownCommandField { code: u16 },

    #[snafu(display("Could not encode command set"))]
    EncodeCommand {
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("Could not decode command set"))]
    DecodeCommand { source: Box<dicom_object::ReadError> },

    #[snafu(display("Could not encode data set"))]
    EncodeData {
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("Could not decode data set"))]
    DecodeData { source: Box<dicom_object::ReadError> },

    #[snafu(display("Transfer syntax {} is not supported", uid))]
    UnsupportedTransferSyntax { uid: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully reassembled incoming DIMSE message.
///
/// The command set is decoded eagerly (it is always Implicit VR Little
/// Endian); the data set is kept as raw bytes until the consumer knows
/// the transfer syntax of the presentation context to decode it with.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    /// the presentation context the message arrived on
    pub context_id: u8,
    /// the decoded command set
    pub command: InMemDicomObject,
    /// the data set bytes, if the message carried a data set
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    /// The command field of this message.
    pub fn command_field(&self) -> Result<CommandField> {
        let code = self.element_u16(tags::COMMAND_FIELD, "CommandField")?;
        CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })
    }

    /// The message ID of a request.
    pub fn message_id(&self) -> Result<u16> {
        self.element_u16(tags::MESSAGE_ID, "MessageID")
    }

    /// The message ID a response refers to.
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.element_u16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "MessageIDBeingRespondedTo",
        )
    }

    /// The status code of a response.
    pub fn status(&self) -> Result<u16> {
        self.element_u16(tags::STATUS, "Status")
    }

    /// The affected SOP class UID, when present.
    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.element_str(tags::AFFECTED_SOP_CLASS_UID)
    }

    /// The affected SOP instance UID, when present.
    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.element_str(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    /// The requested SOP class UID of a normalized request, when present.
    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.element_str(tags::REQUESTED_SOP_CLASS_UID)
    }

    /// The requested SOP instance UID of a normalized request, when present.
    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        self.element_str(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    /// The priority field, when present.
    pub fn priority(&self) -> Option<u16> {
        self.command
            .get(tags::PRIORITY)
            .and_then(|el| el.to_int::<u16>().ok())
    }

    /// Whether the command set announces an accompanying data set.
    pub fn expects_data(&self) -> Result<bool> {
        let value = self.element_u16(tags::COMMAND_DATA_SET_TYPE, "CommandDataSetType")?;
        Ok(value != COMMAND_DATA_SET_ABSENT)
    }

    /// Decode the data set with the given transfer syntax.
    pub fn decode_data(&self, transfer_syntax_uid: &str) -> Result<Option<InMemDicomObject>> {
        use dicom_encoding::transfer_syntax::TransferSyntaxIndex;

        let data = match &self.data {
            Some(data) => data,
            None => return Ok(None),
        };
        let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
            .get(transfer_syntax_uid)
            .filter(|ts| !ts.is_unsupported())
            .context(UnsupportedTransferSyntaxSnafu {
                uid: transfer_syntax_uid.to_string(),
            })?;
        InMemDicomObject::read_dataset_with_ts(data.as_slice(), ts)
            .map_err(Box::from)
            .context(DecodeDataSnafu)
            .map(Some)
    }

    fn element_u16(&self, tag: dicom_core::Tag, name: &'static str) -> Result<u16> {
        self.command
            .get(tag)
            .context(MissingCommandElementSnafu { name })?
            .to_int::<u16>()
            .context(ReadCommandElementSnafu { name })
    }

    fn element_str(&self, tag: dicom_core::Tag) -> Option<String> {
        self.command.get(tag).and_then(|el| {
            el.to_str()
                .ok()
                .map(|s| s.trim_end_matches('\0').trim().to_string())
        })
    }
}

/// Decode a command set from its wire form
/// (always Implicit VR Little Endian).
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(Box::from)
        .context(DecodeCommandSnafu)
}

/// Encode a data set with the given transfer syntax.
pub fn encode_dataset(object: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    use dicom_encoding::transfer_syntax::TransferSyntaxIndex;

    let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .filter(|ts| !ts.is_unsupported())
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid.to_string(),
        })?;
    let mut buffer = Vec::new();
    object
        .write_dataset_with_ts(&mut buffer, ts)
        .map_err(Box::from)
        .context(EncodeDataSnafu)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(status_type(0x0000), StatusType::Success);
        assert_eq!(status_type(0xFF00), StatusType::Pending);
        assert_eq!(status_type(0xFF01), StatusType::Pending);
        assert_eq!(status_type(0xFE00), StatusType::Cancel);
        assert_eq!(status_type(0xB000), StatusType::Warning);
        assert_eq!(status_type(0xA801), StatusType::Failure);
        assert_eq!(status_type(0xC211), StatusType::Failure);
        assert_eq!(status_type(0x0122), StatusType::Failure);

        assert!(is_terminal(0x0000));
        assert!(is_terminal(0xFE00));
        assert!(is_terminal(0xA700));
        assert!(!is_terminal(0xFF00));
    }

    #[test]
    fn command_field_codes_round_trip() {
        for field in [
            CommandField::CStoreRq,
            CommandField::CStoreRsp,
            CommandField::CGetRq,
            CommandField::CFindRsp,
            CommandField::CMoveRq,
            CommandField::CEchoRsp,
            CommandField::NEventReportRq,
            CommandField::NDeleteRsp,
            CommandField::CCancelRq,
        ] {
            assert_eq!(CommandField::from_code(field as u16), Some(field));
        }
        assert!(CommandField::from_code(0x7777).is_none());
        assert!(CommandField::CStoreRsp.is_response());
        assert!(!CommandField::CStoreRq.is_response());
    }
}
