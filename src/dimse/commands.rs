//! Outgoing DIMSE command set builders.
//!
//! Each request and response primitive has a builder struct
//! which assembles the corresponding command set as an in-memory
//! DICOM object. Command sets are always encoded in
//! Implicit VR Little Endian, regardless of the transfer syntax
//! negotiated for the presentation context.

use bon::Builder;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use snafu::ResultExt;

use super::{
    CommandField, EncodeCommandSnafu, Priority, Result, COMMAND_DATA_SET_ABSENT,
    COMMAND_DATA_SET_PRESENT,
};

type Element = InMemElement<StandardDataDictionary>;

fn us(tag: Tag, value: u16) -> Element {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

fn ui(tag: Tag, value: &str) -> Element {
    DataElement::new(tag, VR::UI, dicom_value!(Str, value))
}

fn ae(tag: Tag, value: &str) -> Element {
    DataElement::new(tag, VR::AE, dicom_value!(Str, value))
}

/// A DIMSE command that can be turned into a command set.
pub trait Command {
    /// The command field code of this primitive.
    fn command_field(&self) -> CommandField;

    /// The command set elements other than
    /// the command field and the data set type.
    fn elements(&self) -> Vec<Element>;

    /// Assemble the full command set.
    fn command_set(&self, data_set_present: bool) -> InMemDicomObject {
        let mut elements = vec![
            us(tags::COMMAND_FIELD, self.command_field() as u16),
            us(
                tags::COMMAND_DATA_SET_TYPE,
                if data_set_present {
                    COMMAND_DATA_SET_PRESENT
                } else {
                    COMMAND_DATA_SET_ABSENT
                },
            ),
        ];
        elements.extend(self.elements());
        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Encode the command set to its wire form.
    fn encode(&self, data_set_present: bool) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.command_set(data_set_present)
            .write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(Box::from)
            .context(EncodeCommandSnafu)?;
        Ok(buffer)
    }
}

#[derive(Debug, Builder)]
pub struct CEchoRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
}

impl Command for CEchoRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct CEchoRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for CEchoRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct CStoreRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
    /// set on C-STORE sub-operations of a C-MOVE
    pub move_originator_ae_title: Option<&'a str>,
    /// set on C-STORE sub-operations of a C-MOVE
    pub move_originator_message_id: Option<u16>,
}

impl Command for CStoreRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRq
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            ui(
                tags::AFFECTED_SOP_INSTANCE_UID,
                self.affected_sop_instance_uid,
            ),
            us(tags::PRIORITY, self.priority as u16),
        ];
        if let Some(title) = self.move_originator_ae_title {
            elements.push(ae(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, title));
        }
        if let Some(id) = self.move_originator_message_id {
            elements.push(us(tags::MOVE_ORIGINATOR_MESSAGE_ID, id));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct CStoreRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for CStoreRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct CFindRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
}

impl Command for CFindRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            us(tags::PRIORITY, self.priority as u16),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct CFindRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for CFindRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct CGetRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
}

impl Command for CGetRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CGetRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            us(tags::PRIORITY, self.priority as u16),
        ]
    }
}

/// Sub-operation progress counters of a C-GET or C-MOVE response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperationCounts {
    pub remaining: Option<u16>,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperationCounts {
    fn push_elements(&self, elements: &mut Vec<Element>) {
        if let Some(remaining) = self.remaining {
            elements.push(us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining));
        }
        elements.push(us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, self.completed));
        elements.push(us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, self.failed));
        elements.push(us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, self.warning));
    }
}

#[derive(Debug, Builder)]
pub struct CGetRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
    #[builder(default)]
    pub sub_operations: SubOperationCounts,
}

impl Command for CGetRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CGetRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        self.sub_operations.push_elements(&mut elements);
        elements
    }
}

#[derive(Debug, Builder)]
pub struct CMoveRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
    /// the AE title of the destination of the sub-operations
    pub move_destination: &'a str,
}

impl Command for CMoveRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CMoveRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            us(tags::PRIORITY, self.priority as u16),
            ae(tags::MOVE_DESTINATION, self.move_destination),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct CMoveRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub status: u16,
    #[builder(default)]
    pub sub_operations: SubOperationCounts,
}

impl Command for CMoveRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CMoveRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        self.sub_operations.push_elements(&mut elements);
        elements
    }
}

#[derive(Debug, Builder)]
pub struct CCancelRq {
    pub message_id_being_responded_to: u16,
}

impl Command for CCancelRq {
    fn command_field(&self) -> CommandField {
        CommandField::CCancelRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![us(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        )]
    }
}

#[derive(Debug, Builder)]
pub struct NEventReportRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub event_type_id: u16,
}

impl Command for NEventReportRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NEventReportRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
            ui(
                tags::AFFECTED_SOP_INSTANCE_UID,
                self.affected_sop_instance_uid,
            ),
            us(tags::EVENT_TYPE_ID, self.event_type_id),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct NEventReportRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub event_type_id: Option<u16>,
    pub status: u16,
}

impl Command for NEventReportRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NEventReportRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        if let Some(event_type_id) = self.event_type_id {
            elements.push(us(tags::EVENT_TYPE_ID, event_type_id));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NGetRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
    /// the attributes to retrieve; all when empty
    #[builder(default)]
    pub attribute_identifier_list: Vec<Tag>,
}

impl Command for NGetRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NGetRq
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
        ];
        if !self.attribute_identifier_list.is_empty() {
            elements.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(self.attribute_identifier_list.iter().copied().collect()),
            ));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NGetRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for NGetRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NGetRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NSetRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
}

impl Command for NSetRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NSetRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct NSetRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for NSetRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NSetRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NActionRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
    pub action_type_id: u16,
}

impl Command for NActionRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NActionRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
            us(tags::ACTION_TYPE_ID, self.action_type_id),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct NActionRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub action_type_id: Option<u16>,
    pub status: u16,
}

impl Command for NActionRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NActionRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        if let Some(action_type_id) = self.action_type_id {
            elements.push(us(tags::ACTION_TYPE_ID, action_type_id));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NCreateRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    /// may be omitted to let the SCP assign the instance UID
    pub affected_sop_instance_uid: Option<&'a str>,
}

impl Command for NCreateRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NCreateRq
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid),
        ];
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NCreateRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for NCreateRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NCreateRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        elements
    }
}

#[derive(Debug, Builder)]
pub struct NDeleteRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
}

impl Command for NDeleteRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NDeleteRq
    }

    fn elements(&self) -> Vec<Element> {
        vec![
            us(tags::MESSAGE_ID, self.message_id),
            ui(tags::REQUESTED_SOP_CLASS_UID, self.requested_sop_class_uid),
            ui(
                tags::REQUESTED_SOP_INSTANCE_UID,
                self.requested_sop_instance_uid,
            ),
        ]
    }
}

#[derive(Debug, Builder)]
pub struct NDeleteRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: Option<&'a str>,
    pub affected_sop_instance_uid: Option<&'a str>,
    pub status: u16,
}

impl Command for NDeleteRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NDeleteRsp
    }

    fn elements(&self) -> Vec<Element> {
        let mut elements = vec![
            us(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                self.message_id_being_responded_to,
            ),
            us(tags::STATUS, self.status),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        elements
    }
}
