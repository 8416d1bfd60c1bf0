//! C-STORE over a loopback SCU/SCP pair,
//! plus the handling of DIMSE traffic on unaccepted contexts.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dicom_association::association::{
    AcceptorAssociation, AcceptorOptions, Error, RequestorOptions,
};
use dicom_association::dimse::Priority;
use dicom_association::events::{HandlerOutcome, ServiceRequest};
use dicom_association::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{FileDicomObject, InMemDicomObject};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static VERIFICATION: &str = "1.2.840.10008.1.1";
static MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn sample_file(sop_instance_uid: &str) -> FileDicomObject<InMemDicomObject> {
    let object = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, MR_IMAGE_STORAGE),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
    ]);
    object
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(MR_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid)
                .transfer_syntax(EXPLICIT_VR_LE),
        )
        .expect("file meta should build")
}

fn spawn_storage_scp(
    stored: Arc<Mutex<Vec<InMemDicomObject>>>,
) -> Result<(JoinHandle<Result<AcceptorAssociation>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let options = AcceptorOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(VERIFICATION)
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .network_timeout(Some(Duration::from_secs(2)))
        .on_c_store(move |request: ServiceRequest<'_>| {
            let dataset = request.dataset.cloned().expect("store carries a data set");
            stored.lock().unwrap().push(dataset);
            Ok(HandlerOutcome::Status(0x0000))
        });
    let handle = std::thread::spawn(move || -> Result<AcceptorAssociation> {
        let (stream, _addr) = listener.accept()?;
        let mut association = options.establish(stream)?;
        let _ = association.serve();
        Ok(association)
    });
    Ok((handle, addr))
}

#[test]
fn store_success() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (handle, addr) = spawn_storage_scp(Arc::clone(&stored)).unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_presentation_context(MR_IMAGE_STORAGE, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let file = sample_file("2.25.3111");
    let rsp = association.send_c_store(&file, Priority::Medium).unwrap();
    assert_eq!(
        rsp.get(tags::STATUS).unwrap().to_int::<u16>().unwrap(),
        0x0000
    );

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();

    let stored = stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0]
            .get(tags::PATIENT_NAME)
            .unwrap()
            .to_str()
            .unwrap(),
        "Doe^John"
    );
    assert_eq!(
        stored[0]
            .get(tags::SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches('\0'),
        "2.25.3111"
    );
}

#[test]
fn store_reencodes_when_context_disagrees() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (handle, addr) = spawn_storage_scp(Arc::clone(&stored)).unwrap();

    // the file claims Explicit VR LE, but only Implicit VR LE
    // is proposed for the storage context
    let mut association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_presentation_context(MR_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let file = sample_file("2.25.3112");
    let rsp = association.send_c_store(&file, Priority::Medium).unwrap();
    assert_eq!(
        rsp.get(tags::STATUS).unwrap().to_int::<u16>().unwrap(),
        0x0000
    );

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
    assert_eq!(stored.lock().unwrap().len(), 1);
}

#[test]
fn store_validates_the_data_set_before_sending() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (handle, addr) = spawn_storage_scp(stored).unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .establish(addr)
        .unwrap();

    // no SOPClassUID in the data set
    let object = InMemDicomObject::from_element_iter([DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, "2.25.3113"),
    )])
    .with_meta(
        FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(MR_IMAGE_STORAGE)
            .media_storage_sop_instance_uid("2.25.3113")
            .transfer_syntax(EXPLICIT_VR_LE),
    )
    .unwrap();

    let result = association.send_c_store(&object, Priority::Medium);
    assert!(matches!(
        result,
        Err(Error::MissingRequiredElement {
            name: "SOPClassUID"
        })
    ));
    // nothing touched the wire, the association is fine
    assert!(association.is_established());

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn store_fails_without_a_compatible_context() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (handle, addr) = spawn_storage_scp(stored).unwrap();

    // only verification is negotiated
    let mut association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(VERIFICATION)
        .establish(addr)
        .unwrap();

    let file = sample_file("2.25.3114");
    let result = association.send_c_store(&file, Priority::Medium);
    assert!(matches!(result, Err(Error::NoCompatibleContext { .. })));

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn forged_context_id_gets_the_association_aborted() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (handle, addr) = spawn_storage_scp(stored).unwrap();

    // context 3 is never proposed, let alone accepted
    let mut association = RequestorOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(VERIFICATION)
        .establish(addr)
        .unwrap();

    association
        .send_pdu(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 16],
            }],
        })
        .unwrap();

    // the acceptor drops the association
    let message = association.receive_message().unwrap();
    assert!(message.is_none());
    assert!(association.is_aborted());

    let scp = handle.join().unwrap().unwrap();
    assert!(scp.is_aborted());
}
