//! Fragmentation and reassembly of DIMSE messages.
//!
//! A logical message becomes one or more presentation data values:
//! the command set stream and the data set stream are fragmented
//! independently, each ending in a value with the last-fragment flag.
//! On the receiving side, values are accumulated per presentation
//! context until both streams are complete.

use std::collections::HashMap;

use snafu::{ResultExt, Snafu};

use crate::dimse::DimseMessage;
use crate::pdu::{PDataValue, PDataValueType, Pdu};

/// The length of a presentation data value item header:
/// item length (4), context ID (1), message control header (1).
pub const PDV_HEADER_LENGTH: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not decode command set on context {}", context_id))]
    DecodeCommandSet {
        context_id: u8,
        #[snafu(source(from(crate::dimse::Error, Box::from)))]
        source: Box<crate::dimse::Error>,
    },

    #[snafu(display(
        "Received data fragment without a command set on context {}",
        context_id
    ))]
    UnexpectedDataFragment { context_id: u8 },

    #[snafu(display(
        "Received command fragment while awaiting a data set on context {}",
        context_id
    ))]
    UnexpectedCommandFragment { context_id: u8 },

    #[snafu(display("Maximum PDU length {} leaves no room for data", max_pdu_length))]
    FragmentTooSmall { max_pdu_length: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The largest data payload that fits in one presentation data value
/// under the given maximum PDU body length.
pub fn max_fragment_length(max_pdu_length: u32) -> Result<usize> {
    if max_pdu_length <= PDV_HEADER_LENGTH {
        return FragmentTooSmallSnafu { max_pdu_length }.fail();
    }
    Ok((max_pdu_length - PDV_HEADER_LENGTH) as usize)
}

/// Fragment a DIMSE message into P-DATA PDUs
/// bounded by the peer's maximum PDU body length.
///
/// When the whole message fits in a single PDU,
/// the command and data values are combined into one;
/// otherwise each fragment travels in its own PDU.
pub fn fragment_message(
    context_id: u8,
    command: &[u8],
    data: Option<&[u8]>,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    let max_fragment = max_fragment_length(max_pdu_length)?;

    let combined_length = command.len() as u64
        + PDV_HEADER_LENGTH as u64
        + data.map_or(0, |d| d.len() as u64 + PDV_HEADER_LENGTH as u64);
    if combined_length <= max_pdu_length as u64 {
        let mut values = vec![PDataValue {
            presentation_context_id: context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: command.to_vec(),
        }];
        if let Some(data) = data {
            values.push(PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: data.to_vec(),
            });
        }
        return Ok(vec![Pdu::PData { data: values }]);
    }

    let mut pdus = Vec::new();
    push_fragments(
        &mut pdus,
        context_id,
        PDataValueType::Command,
        command,
        max_fragment,
    );
    if let Some(data) = data {
        push_fragments(
            &mut pdus,
            context_id,
            PDataValueType::Data,
            data,
            max_fragment,
        );
    }
    Ok(pdus)
}

fn push_fragments(
    pdus: &mut Vec<Pdu>,
    context_id: u8,
    value_type: PDataValueType,
    payload: &[u8],
    max_fragment: usize,
) {
    let mut chunks = payload.chunks(max_fragment).peekable();
    if chunks.peek().is_none() {
        // a zero-length stream still needs its terminating value
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        });
        return;
    }
    while let Some(chunk) = chunks.next() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }],
        });
    }
}

#[derive(Debug, Default)]
struct Partial {
    command: Vec<u8>,
    command_complete: bool,
    command_set: Option<dicom_object::InMemDicomObject>,
    expects_data: bool,
    data: Vec<u8>,
}

/// Reassembles presentation data values into DIMSE messages,
/// independently per presentation context.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u8, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one presentation data value.
    ///
    /// Returns a completed message once the command stream
    /// and, if announced, the data stream have both ended.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        let context_id = pdv.presentation_context_id;
        let partial = self.partial.entry(context_id).or_default();

        match pdv.value_type {
            PDataValueType::Command => {
                if partial.command_complete {
                    return UnexpectedCommandFragmentSnafu { context_id }.fail();
                }
                partial.command.extend(pdv.data);
                if pdv.is_last {
                    let command = crate::dimse::decode_command(&partial.command)
                        .context(DecodeCommandSetSnafu { context_id })?;

                    partial.command_complete = true;
                    let message = DimseMessage {
                        context_id,
                        command,
                        data: None,
                    };
                    partial.expects_data = message.expects_data().unwrap_or(false);
                    if partial.expects_data {
                        partial.command_set = Some(message.command);
                        return Ok(None);
                    }
                    self.partial.remove(&context_id);
                    return Ok(Some(message));
                }
                Ok(None)
            }
            PDataValueType::Data => {
                if !partial.command_complete {
                    return UnexpectedDataFragmentSnafu { context_id }.fail();
                }
                partial.data.extend(pdv.data);
                if pdv.is_last {
                    let partial = self
                        .partial
                        .remove(&context_id)
                        .expect("partial entry was just accessed");
                    let command = partial
                        .command_set
                        .expect("command set is kept while awaiting data");
                    return Ok(Some(DimseMessage {
                        context_id,
                        command,
                        data: Some(partial.data),
                    }));
                }
                Ok(None)
            }
        }
    }

    /// Drop any partial state, e.g. after an abort.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::commands::{CEchoRq, CStoreRq, Command};
    use crate::dimse::CommandField;
    use crate::pdu::MINIMUM_PDU_SIZE;

    fn pdvs(pdus: Vec<Pdu>) -> impl Iterator<Item = PDataValue> {
        pdus.into_iter().flat_map(|pdu| match pdu {
            Pdu::PData { data } => data,
            other => panic!("expected P-DATA, got {:?}", other),
        })
    }

    #[test]
    fn small_message_travels_in_one_pdu() {
        let command = CEchoRq::builder()
            .message_id(1)
            .affected_sop_class_uid("1.2.840.10008.1.1")
            .build()
            .encode(false)
            .unwrap();

        let pdus = fragment_message(1, &command, None, MINIMUM_PDU_SIZE).unwrap();
        assert_eq!(pdus.len(), 1);

        let mut reassembler = Reassembler::new();
        let mut message = None;
        for pdv in pdvs(pdus) {
            message = reassembler.push(pdv).unwrap();
        }
        let message = message.expect("message should be complete");
        assert_eq!(message.command_field().unwrap(), CommandField::CEchoRq);
        assert!(message.data.is_none());
    }

    #[test]
    fn large_data_set_is_fragmented_and_reassembled() {
        let command = CStoreRq::builder()
            .message_id(4)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .affected_sop_instance_uid("2.25.42")
            .build()
            .encode(true)
            .unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|x| x as u8).collect();

        let pdus = fragment_message(3, &command, Some(&data), MINIMUM_PDU_SIZE).unwrap();
        assert!(pdus.len() > 4);
        for pdu in &pdus {
            if let Pdu::PData { data } = pdu {
                let total: usize = data
                    .iter()
                    .map(|pdv| pdv.data.len() + PDV_HEADER_LENGTH as usize)
                    .sum();
                assert!(total <= MINIMUM_PDU_SIZE as usize);
            }
        }

        let mut reassembler = Reassembler::new();
        let mut message = None;
        for pdv in pdvs(pdus) {
            assert!(message.is_none(), "message completed early");
            message = reassembler.push(pdv).unwrap();
        }
        let message = message.expect("message should be complete");
        assert_eq!(message.command_field().unwrap(), CommandField::CStoreRq);
        assert_eq!(message.data.as_deref(), Some(&data[..]));
    }

    #[test]
    fn interleaved_contexts_reassemble_independently() {
        let command_a = CEchoRq::builder()
            .message_id(1)
            .affected_sop_class_uid("1.2.840.10008.1.1")
            .build()
            .encode(false)
            .unwrap();
        let command_b = CEchoRq::builder()
            .message_id(2)
            .affected_sop_class_uid("1.2.840.10008.1.1")
            .build()
            .encode(false)
            .unwrap();

        let mut reassembler = Reassembler::new();
        // first half of each command on contexts 1 and 3, then the rest
        let half_a = command_a.len() / 2;
        let half_b = command_b.len() / 2;
        assert!(reassembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: command_a[..half_a].to_vec(),
            })
            .unwrap()
            .is_none());
        assert!(reassembler
            .push(PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: false,
                data: command_b[..half_b].to_vec(),
            })
            .unwrap()
            .is_none());

        let done_a = reassembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_a[half_a..].to_vec(),
            })
            .unwrap()
            .expect("context 1 message should be complete");
        assert_eq!(done_a.message_id().unwrap(), 1);

        let done_b = reassembler
            .push(PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_b[half_b..].to_vec(),
            })
            .unwrap()
            .expect("context 3 message should be complete");
        assert_eq!(done_b.message_id().unwrap(), 2);
    }

    #[test]
    fn data_without_command_is_an_error() {
        let mut reassembler = Reassembler::new();
        let result = reassembler.push(PDataValue {
            presentation_context_id: 5,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8],
        });
        matches::assert_matches!(result, Err(Error::UnexpectedDataFragment { context_id: 5 }));
    }
}
