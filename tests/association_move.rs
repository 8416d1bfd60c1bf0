//! C-MOVE with a sub-association towards the move destination.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dicom_association::association::requestor::QueryModel;
use dicom_association::association::{
    AcceptorAssociation, AcceptorOptions, RequestorOptions,
};
use dicom_association::events::{
    HandlerOutcome, MoveDestination, ServiceRequest, SubOperations,
};
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static PATIENT_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
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

/// A storage SCP standing in for the move destination.
fn spawn_destination_scp(
    stored: Arc<Mutex<Vec<InMemDicomObject>>>,
) -> Result<(JoinHandle<Result<AcceptorAssociation>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let options = AcceptorOptions::new()
        .ae_title("DEST-SCP")
        .with_abstract_syntax(SC_IMAGE_STORAGE)
        .on_c_store(move |request: ServiceRequest<'_>| {
            let dataset = request.dataset.cloned().expect("store carries a data set");
            // the sub-operation names the entity that asked for the move
            assert_eq!(
                request
                    .command
                    .get(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
                    .expect("move originator should be present")
                    .to_str()
                    .unwrap()
                    .trim(),
                "MOVE-SCU"
            );
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

fn spawn_move_scp(
    destination: Option<MoveDestination>,
    instances: Vec<InMemDicomObject>,
) -> Result<(JoinHandle<Result<AcceptorAssociation>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let options = AcceptorOptions::new()
        .ae_title("MOVE-SCP")
        .with_abstract_syntax(PATIENT_ROOT_MOVE)
        .on_c_move(move |_request: ServiceRequest<'_>| {
            let remaining = instances.len() as u16;
            let datasets = instances.clone().into_iter().map(Ok);
            Ok(HandlerOutcome::SubOperations(SubOperations {
                destination: destination.clone(),
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

#[test]
fn move_to_unknown_destination_reports_a801() {
    let (handle, addr) = spawn_move_scp(None, vec![]).unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title("MOVE-SCU")
        .called_ae_title("MOVE-SCP")
        .with_abstract_syntax(PATIENT_ROOT_MOVE)
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_move("NOWHERE", &query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();

    assert_eq!(responses.len(), 1);
    let (status, identifier) = &responses[0];
    assert_eq!(*status, 0xA801);
    assert!(identifier.is_none());

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn move_stores_to_the_destination() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let (dest_handle, dest_addr) = spawn_destination_scp(Arc::clone(&stored)).unwrap();

    let destination = MoveDestination {
        host: dest_addr.ip().to_string(),
        port: dest_addr.port(),
        ae_title: "DEST-SCP".to_string(),
    };
    let (move_handle, move_addr) = spawn_move_scp(
        Some(destination),
        vec![stored_instance("2.25.771"), stored_instance("2.25.772")],
    )
    .unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title("MOVE-SCU")
        .called_ae_title("MOVE-SCP")
        .with_abstract_syntax(PATIENT_ROOT_MOVE)
        .establish(move_addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_move("DEST-SCP", &query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();

    let (final_status, _) = responses.last().expect("at least one response");
    assert_eq!(*final_status, 0x0000);

    association.release().unwrap();
    let _ = move_handle.join().unwrap().unwrap();
    let _ = dest_handle.join().unwrap().unwrap();

    let stored = stored.lock().unwrap();
    assert_eq!(stored.len(), 2);
    for dataset in stored.iter() {
        assert_eq!(
            dataset.get(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Test"
        );
    }
}
