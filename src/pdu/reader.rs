//! PDU decoding from byte streams.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >= 2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display(
        "Incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("Invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("Unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a PDU from the given source.
///
/// `max_pdu_length` bounds the allowed PDU body length.
/// In strict mode, an oversized PDU is an error;
/// otherwise it is admitted with a warning
/// up to the absolute ceiling of [`MAXIMUM_PDU_SIZE`].
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // An EOF before any header byte means that the peer
    // simply has no more PDUs for us; an EOF in the middle
    // of a PDU is a hard error.
    let mut head = [0; 2];
    if let Err(e) = reader.read_exact(&mut head) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = head[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming PDU of length {} exceeds the negotiated maximum of {}",
            pdu_length, max_pdu_length
        );
    }

    let body = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => {
            // A-ASSOCIATE-RQ | A-ASSOCIATE-AC:
            // protocol version (2), reserved (2),
            // called AE title (16), calling AE title (16), reserved (32),
            // then variable items
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;
            cursor
                .read_u16::<BigEndian>()
                .context(ReadPduFieldSnafu { field: "reserved" })?;

            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadPduFieldSnafu { field: "reserved" })?;

            let mut application_context_name: Option<String> = None;
            let mut proposed = vec![];
            let mut results = vec![];
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) if pdu_type == 0x01 => {
                        proposed.push(val);
                    }
                    PduVariableItem::PresentationContextResult(val) if pdu_type == 0x02 => {
                        results.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            let application_context_name =
                application_context_name.context(MissingApplicationContextNameSnafu)?;

            if pdu_type == 0x01 {
                Ok(Pdu::AssociationRQ(AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: proposed,
                    user_variables,
                }))
            } else {
                Ok(Pdu::AssociationAC(AssociationAC {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: results,
                    user_variables,
                }))
            }
        }
        0x03 => {
            // A-ASSOCIATE-RJ: reserved (1), result (1), source (1), reason (1)
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            let result = AssociationRJResult::from_code(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;
            let source = AssociationRJSource::from_codes(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF: a sequence of presentation data value items,
            // each: item length (4), context ID (1), message control header (1), data
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;
                // bit 0: command fragment, bit 1: last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ: 4 reserved bytes
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP: 4 reserved bytes
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT: reserved (2), source (1), reason (1)
            let mut reserved = [0u8; 2];
            cursor
                .read_exact(&mut reserved)
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            let source = AbortRQSource::from_codes(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => {
            let data = cursor.into_inner();
            Ok(Pdu::Unknown { pdu_type, data })
        }
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() < bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "unexpected end of PDU data",
        ));
    }
    Ok(result)
}

fn read_ae_title<R>(reader: &mut R, codec: &dyn TextCodec, field: &'static str) -> Result<String>
where
    R: Read,
{
    let mut bytes = [0; 16];
    reader
        .read_exact(&mut bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_uid_field<R>(
    reader: &mut R,
    length: usize,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    // common sub-item header: item type (1), reserved (1), item length (2)
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "reserved" })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            let val = codec
                .decode(cursor.get_ref())
                .context(DecodeTextSnafu {
                    field: "Application-context-name",
                })?
                .trim()
                .to_string();
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // proposed presentation context:
            // context ID (1), reserved (3), then abstract/transfer syntax sub-items
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadPduFieldSnafu { field: "reserved" })?;

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let sub_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "reserved" })?;
                let sub_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match sub_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid_field(
                            &mut cursor,
                            sub_length as usize,
                            codec,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid_field(
                            &mut cursor,
                            sub_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // presentation context result:
            // context ID (1), reserved (1), result/reason (1), reserved (1),
            // then one transfer syntax sub-item
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "reserved" })?;
            let reason = PresentationContextResultReason::from_code(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "reserved" })?;

            let mut transfer_syntax: Option<String> = None;
            while cursor.position() < cursor.get_ref().len() as u64 {
                let sub_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "reserved" })?;
                let sub_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match sub_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_uid_field(
                            &mut cursor,
                            sub_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            let mut user_variables = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                user_variables.push(read_user_variable(&mut cursor, codec)?);
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_user_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<UserVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "reserved" })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    match item_type {
        0x51 => {
            let max_length = reader.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-length-received",
            })?;
            Ok(UserVariableItem::MaxLength(max_length))
        }
        0x52 => {
            let uid = read_uid_field(
                reader,
                item_length as usize,
                codec,
                "Implementation-class-uid",
            )?;
            Ok(UserVariableItem::ImplementationClassUID(uid))
        }
        0x53 => {
            let invoked = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-invoked",
            })?;
            let performed = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-performed",
            })?;
            Ok(UserVariableItem::AsyncOperationsWindow(invoked, performed))
        }
        0x54 => {
            let uid_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let sop_class_uid =
                read_uid_field(reader, uid_length as usize, codec, "SOP-class-uid")?;
            let scu_role = reader
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = reader
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            Ok(UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role: scu_role == 1,
                scp_role: scp_role == 1,
            }))
        }
        0x55 => {
            let name = read_uid_field(
                reader,
                item_length as usize,
                codec,
                "Implementation-version-name",
            )?;
            Ok(UserVariableItem::ImplementationVersionName(name))
        }
        0x56 => {
            let uid_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let sop_class_uid =
                read_uid_field(reader, uid_length as usize, codec, "SOP-class-uid")?;
            // the remainder of the sub-item is service class application information
            let info_length = (item_length as usize)
                .saturating_sub(2)
                .saturating_sub(uid_length as usize);
            let info = read_n(reader, info_length).context(ReadPduFieldSnafu {
                field: "Service-class-application-information",
            })?;
            Ok(UserVariableItem::SopClassExtendedNegotiation(
                sop_class_uid,
                info,
            ))
        }
        0x57 => {
            let uid_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let sop_class_uid =
                read_uid_field(reader, uid_length as usize, codec, "SOP-class-uid")?;
            let service_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Service-class-uid-length",
            })?;
            let service_class_uid =
                read_uid_field(reader, service_length as usize, codec, "Service-class-uid")?;
            let related_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Related-general-sop-class-identification-length",
            })?;
            let related_bytes = read_n(reader, related_length as usize).context(
                ReadPduFieldSnafu {
                    field: "Related-general-sop-class-identification",
                },
            )?;
            let mut related = Vec::new();
            let mut sub = Cursor::new(related_bytes);
            while sub.position() < sub.get_ref().len() as u64 {
                let len = sub.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Related-general-sop-class-uid-length",
                })?;
                related.push(read_uid_field(
                    &mut sub,
                    len as usize,
                    codec,
                    "Related-general-sop-class-uid",
                )?);
            }
            Ok(UserVariableItem::SopClassCommonExtendedNegotiation(
                CommonExtendedNegotiation {
                    sop_class_uid,
                    service_class_uid,
                    related_general_sop_class_uids: related,
                },
            ))
        }
        0x58 => {
            let identity_type = reader.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-type",
            })?;
            let positive_response_requested = reader.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-positive-response-requested",
            })?;
            let primary_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "User-Identity-primary-field-length",
            })?;
            let primary_field =
                read_n(reader, primary_length as usize).context(ReadPduFieldSnafu {
                    field: "User-Identity-primary-field",
                })?;
            let secondary_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "User-Identity-secondary-field-length",
            })?;
            let secondary_field =
                read_n(reader, secondary_length as usize).context(ReadPduFieldSnafu {
                    field: "User-Identity-secondary-field",
                })?;

            match UserIdentityType::from_code(identity_type) {
                Some(identity_type) => Ok(UserVariableItem::UserIdentity(UserIdentity::new(
                    positive_response_requested == 1,
                    identity_type,
                    primary_field,
                    secondary_field,
                ))),
                None => {
                    warn!("Unknown user identity type code {}", identity_type);
                    Ok(UserVariableItem::Unknown(item_type, vec![]))
                }
            }
        }
        0x59 => {
            let response_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Server-response-length",
            })?;
            let response = read_n(reader, response_length as usize).context(ReadPduFieldSnafu {
                field: "Server-response",
            })?;
            Ok(UserVariableItem::UserIdentityResponse(response))
        }
        _ => {
            let data = read_n(reader, item_length as usize)
                .context(ReadPduFieldSnafu { field: "Unknown" })?;
            Ok(UserVariableItem::Unknown(item_type, data))
        }
    }
}
