//! PDU encoding onto byte streams.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(backtrace)]
        source: WriteChunkError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    let mut bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    bytes.resize(16, b' ');
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

fn write_uid_chunk_u16(
    writer: &mut dyn Write,
    uid: &str,
    codec: &dyn TextCodec,
    field: &'static str,
    chunk: &'static str,
) -> Result<()> {
    write_chunk_u16(writer, |writer| {
        let bytes = codec.encode(uid).context(EncodeFieldSnafu { field })?;
        writer.write_all(&bytes).context(WriteFieldSnafu { field })
    })
    .context(WriteChunkSnafu { name: chunk })
}

/// Write a PDU onto the given destination.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_application_context(writer, application_context_name, &codec)?;
                for pc in presentation_contexts {
                    write_presentation_context_proposed(writer, pc, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;
                // the AE title fields of the AC are mirrored back
                // and not significant for the receiver
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_application_context(writer, application_context_name, &codec)?;
                for pc in presentation_contexts {
                    write_presentation_context_result(writer, pc, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;
                writer
                    .write_u8(result.code())
                    .context(WriteFieldSnafu { field: "Result" })?;
                let (source, reason) = source.codes();
                writer
                    .write_u8(source)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })
        }
        Pdu::PData { data } => {
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                for value in data {
                    // item length covers context ID, control header and payload
                    writer
                        .write_u32::<BigEndian>(value.data.len() as u32 + 2)
                        .context(WriteFieldSnafu {
                            field: "Item-length",
                        })?;
                    writer
                        .write_u8(value.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;
                    let mut header = match value.value_type {
                        PDataValueType::Command => 0x01,
                        PDataValueType::Data => 0x00,
                    };
                    if value.is_last {
                        header |= 0x02;
                    }
                    writer.write_u8(header).context(WriteFieldSnafu {
                        field: "Message Control Header",
                    })?;
                    writer.write_all(&value.data).context(WriteFieldSnafu {
                        field: "Presentation-data-value",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })
        }
        Pdu::ReleaseRQ => {
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "length" })?;
            writer
                .write_u32::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::ReleaseRP => {
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "length" })?;
            writer
                .write_u32::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "length" })?;
            writer
                .write_u16::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 2_u32 })?;
            let (source, reason) = source.codes();
            writer
                .write_u8(source)
                .context(WriteFieldSnafu { field: "Source" })?;
            writer.write_u8(reason).context(WriteFieldSnafu {
                field: "Reason/Diag",
            })
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(data.len() as u32)
                .context(WriteFieldSnafu { field: "length" })?;
            writer
                .write_all(data)
                .context(WriteFieldSnafu { field: "data" })
        }
    }
}

fn write_application_context(
    writer: &mut dyn Write,
    name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_uid_chunk_u16(
        writer,
        name,
        codec,
        "Application-context-name",
        "ApplicationContextItem",
    )
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    pc: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer.write_u8(pc.id).context(WriteFieldSnafu {
            field: "Presentation-context-ID",
        })?;
        writer
            .write_all(&[0; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        write_uid_chunk_u16(
            writer,
            &pc.abstract_syntax,
            codec,
            "Abstract-syntax-name",
            "AbstractSyntaxSubItem",
        )?;

        for ts in &pc.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            write_uid_chunk_u16(
                writer,
                ts,
                codec,
                "Transfer-syntax-name",
                "TransferSyntaxSubItem",
            )?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "PresentationContextItemRQ",
    })
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    pc: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer.write_u8(pc.id).context(WriteFieldSnafu {
            field: "Presentation-context-ID",
        })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        writer.write_u8(pc.reason as u8).context(WriteFieldSnafu {
            field: "Result/Reason",
        })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        write_uid_chunk_u16(
            writer,
            &pc.transfer_syntax,
            codec,
            "Transfer-syntax-name",
            "TransferSyntaxSubItem",
        )
    })
    .context(WriteChunkSnafu {
        name: "PresentationContextItemAC",
    })
}

fn write_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for item in user_variables {
            match item {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "MaximumLengthSubItem",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_uid_chunk_u16(
                        writer,
                        uid,
                        codec,
                        "Implementation-class-uid",
                        "ImplementationClassUIDSubItem",
                    )?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    writer
                        .write_u8(0x53)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "AsynchronousOperationsWindowSubItem",
                    })?;
                }
                UserVariableItem::RoleSelection(role) => {
                    writer
                        .write_u8(0x54)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let uid = codec.encode(&role.sop_class_uid).context(EncodeFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u8(role.scu_role as u8)
                            .context(WriteFieldSnafu { field: "SCU-role" })?;
                        writer
                            .write_u8(role.scp_role as u8)
                            .context(WriteFieldSnafu { field: "SCP-role" })
                    })
                    .context(WriteChunkSnafu {
                        name: "RoleSelectionSubItem",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_uid_chunk_u16(
                        writer,
                        name,
                        codec,
                        "Implementation-version-name",
                        "ImplementationVersionNameSubItem",
                    )?;
                }
                UserVariableItem::SopClassExtendedNegotiation(uid, info) => {
                    writer
                        .write_u8(0x56)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let uid = codec.encode(uid).context(EncodeFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer.write_all(info).context(WriteFieldSnafu {
                            field: "Service-class-application-information",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "SOPClassExtendedNegotiationSubItem",
                    })?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiation(neg) => {
                    writer
                        .write_u8(0x57)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let uid = codec.encode(&neg.sop_class_uid).context(EncodeFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        let service =
                            codec
                                .encode(&neg.service_class_uid)
                                .context(EncodeFieldSnafu {
                                    field: "Service-class-uid",
                                })?;
                        writer
                            .write_u16::<BigEndian>(service.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "Service-class-uid-length",
                            })?;
                        writer.write_all(&service).context(WriteFieldSnafu {
                            field: "Service-class-uid",
                        })?;
                        write_chunk_u16(writer, |writer| {
                            for related in &neg.related_general_sop_class_uids {
                                let related = codec.encode(related).context(EncodeFieldSnafu {
                                    field: "Related-general-sop-class-uid",
                                })?;
                                writer
                                    .write_u16::<BigEndian>(related.len() as u16)
                                    .context(WriteFieldSnafu {
                                        field: "Related-general-sop-class-uid-length",
                                    })?;
                                writer.write_all(&related).context(WriteFieldSnafu {
                                    field: "Related-general-sop-class-uid",
                                })?;
                            }
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "RelatedGeneralSOPClassIdentification",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "SOPClassCommonExtendedNegotiationSubItem",
                    })?;
                }
                UserVariableItem::UserIdentity(identity) => {
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(identity.identity_type() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;
                        writer
                            .write_u16::<BigEndian>(identity.primary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        writer
                            .write_all(identity.primary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;
                        writer
                            .write_u16::<BigEndian>(identity.secondary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        writer
                            .write_all(identity.secondary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "UserIdentitySubItem",
                    })?;
                }
                UserVariableItem::UserIdentityResponse(response) => {
                    writer
                        .write_u8(0x59)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(response.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "Server-response-length",
                            })?;
                        writer.write_all(response).context(WriteFieldSnafu {
                            field: "Server-response",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "UserIdentityResponseSubItem",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(data)
                            .context(WriteFieldSnafu { field: "Unknown" })
                    })
                    .context(WriteChunkSnafu {
                        name: "UnknownSubItem",
                    })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "UserInformationItem",
    })
}
