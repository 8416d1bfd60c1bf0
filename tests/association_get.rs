//! C-GET with store sub-operations flowing back
//! over the same association.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dicom_association::association::requestor::QueryModel;
use dicom_association::association::{
    AcceptorAssociation, AcceptorOptions, RequestorOptions,
};
use dicom_association::dimse::status_type;
use dicom_association::dimse::StatusType;
use dicom_association::events::{HandlerOutcome, ServiceRequest, SubOperations};
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static PATIENT_ROOT_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";
static SC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";

fn stored_instance(sop_instance_uid: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, SC_IMAGE_STORAGE),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Test")),
    ])
}

fn spawn_get_scp(
    instances: Vec<InMemDicomObject>,
) -> Result<(JoinHandle<Result<AcceptorAssociation>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let options = AcceptorOptions::new()
        .ae_title("GET-SCP")
        .with_abstract_syntax(PATIENT_ROOT_GET)
        .with_abstract_syntax(SC_IMAGE_STORAGE)
        .on_c_get(move |_request: ServiceRequest<'_>| {
            let remaining = instances.len() as u16;
            let datasets = instances.clone().into_iter().map(Ok);
            Ok(HandlerOutcome::SubOperations(SubOperations {
                destination: None,
                remaining: Some(remaining),
                datasets: Box::new(datasets),
            }))
        });
    let handle = std::thread::spawn(move || -> Result<AcceptorAssociation> {
        let (stream, _addr) = listener.accept()?;
        let mut association = options.establish(stream)?;
        let _ = association.serve();
        Ok(association)
    });
    Ok((handle, addr))
}

fn sample_query() -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Test")),
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "PATIENT"),
        ),
    ])
}

#[test]
fn get_with_two_sub_stores() {
    let (handle, addr) = spawn_get_scp(vec![
        stored_instance("2.25.901"),
        stored_instance("2.25.902"),
    ])
    .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    // the requestor is also the storage SCP of the sub-operations,
    // which takes role selection negotiation for the storage class
    let mut association = RequestorOptions::new()
        .calling_ae_title("GET-SCU")
        .called_ae_title("GET-SCP")
        .with_abstract_syntax(PATIENT_ROOT_GET)
        .with_abstract_syntax(SC_IMAGE_STORAGE)
        .with_role_selection(SC_IMAGE_STORAGE, true, true)
        .on_c_store(move |request: ServiceRequest<'_>| {
            let dataset = request.dataset.cloned().expect("sub-store carries a data set");
            sink.lock().unwrap().push(dataset);
            Ok(HandlerOutcome::Status(0x0000))
        })
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_get(&query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();

    // the final response is success with no identifier
    let (final_status, final_identifier) = responses.last().expect("at least one response");
    assert_eq!(*final_status, 0x0000);
    assert!(final_identifier.is_none());
    // anything before it is pending progress
    for (status, _) in &responses[..responses.len() - 1] {
        assert_eq!(status_type(*status), StatusType::Pending);
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 2);
    for dataset in received.iter() {
        assert_eq!(
            dataset.get(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Test"
        );
    }
    drop(received);

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn sub_store_without_reverse_role_reports_unsupported() {
    let (handle, addr) = spawn_get_scp(vec![stored_instance("2.25.903")]).unwrap();

    // no role selection: the requestor never becomes a storage SCP,
    // so the sub-operation comes back as a failure
    let mut association = RequestorOptions::new()
        .calling_ae_title("GET-SCU")
        .called_ae_title("GET-SCP")
        .with_abstract_syntax(PATIENT_ROOT_GET)
        .with_abstract_syntax(SC_IMAGE_STORAGE)
        .on_c_store(|_request: ServiceRequest<'_>| Ok(HandlerOutcome::Status(0x0000)))
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_get(&query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();

    let (final_status, final_identifier) = responses.last().expect("at least one response");
    // one failed sub-operation: warning status with a failure list
    assert_eq!(*final_status, 0xB000);
    let identifier = final_identifier
        .as_ref()
        .expect("failure list should be attached");
    assert!(identifier
        .get(tags::FAILED_SOP_INSTANCE_UID_LIST)
        .is_some());

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}
