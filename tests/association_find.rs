//! C-FIND streaming over a loopback SCU/SCP pair.

use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use dicom_association::association::{
    AcceptorAssociation, AcceptorOptions, RequestorOptions,
};
use dicom_association::association::requestor::QueryModel;
use dicom_association::events::{HandlerOutcome, ServiceRequest};
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";

fn match_result(patient_name: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, patient_name)),
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "PATIENT"),
        ),
    ])
}

fn spawn_find_scp(
    matches: Vec<InMemDicomObject>,
) -> Result<(JoinHandle<Result<AcceptorAssociation>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let options = AcceptorOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND)
        .on_c_find(move |request: ServiceRequest<'_>| {
            // echo the query level back with every match
            assert!(request.dataset.is_some(), "C-FIND carries an identifier");
            let responses: Vec<(u16, Option<InMemDicomObject>)> = matches
                .iter()
                .map(|m| (0xFF00, Some(m.clone())))
                .chain(std::iter::once((0x0000, None)))
                .collect();
            Ok(HandlerOutcome::Responses(Box::new(responses.into_iter())))
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
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "*")),
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "PATIENT"),
        ),
    ])
}

#[test]
fn find_streams_until_success() {
    let (handle, addr) = spawn_find_scp(vec![
        match_result("Adams^Alice"),
        match_result("Baker^Bob"),
        match_result("Clark^Carol"),
    ])
    .unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND)
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_find(&query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();

    assert_eq!(responses.len(), 4);
    for (status, identifier) in &responses[..3] {
        assert_eq!(*status, 0xFF00);
        let identifier = identifier.as_ref().expect("pending responses carry a match");
        assert!(identifier.get(tags::PATIENT_NAME).is_some());
    }
    let (status, identifier) = &responses[3];
    assert_eq!(*status, 0x0000);
    assert!(identifier.is_none());

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn find_with_no_matches_yields_one_terminal_response() {
    let (handle, addr) = spawn_find_scp(vec![]).unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND)
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_find(&query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0, 0x0000);

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn cancel_closes_the_stream() {
    // a handler with endless matches: only a cancel can end it
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let options = AcceptorOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND)
        .on_c_find(|_request: ServiceRequest<'_>| {
            let endless =
                std::iter::repeat_with(|| (0xFF00, Some(match_result("Endless^Match"))));
            Ok(HandlerOutcome::Responses(Box::new(endless)))
        });
    let handle = std::thread::spawn(move || -> Result<AcceptorAssociation> {
        let (stream, _addr) = listener.accept()?;
        let mut association = options.establish(stream)?;
        let _ = association.serve();
        Ok(association)
    });

    let mut association = RequestorOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND)
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let mut stream = association
        .send_c_find(&query, QueryModel::PatientRoot)
        .unwrap();

    for _ in 0..3 {
        let (status, _) = stream.next().expect("pending response").unwrap();
        assert_eq!(status, 0xFF00);
    }
    stream.cancel().unwrap();

    // drain what is already in flight; the stream must terminate
    // with the cancel confirmation
    let mut last_status = 0xFF00;
    for response in stream {
        last_status = response.unwrap().0;
    }
    assert_eq!(last_status, 0xFE00);

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}

#[test]
fn missing_find_handler_fails_the_operation() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let options = AcceptorOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND);
    let handle = std::thread::spawn(move || -> Result<AcceptorAssociation> {
        let (stream, _addr) = listener.accept()?;
        let mut association = options.establish(stream)?;
        let _ = association.serve();
        Ok(association)
    });

    let mut association = RequestorOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(PATIENT_ROOT_FIND)
        .establish(addr)
        .unwrap();

    let query = sample_query();
    let responses: Vec<_> = association
        .send_c_find(&query, QueryModel::PatientRoot)
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0, 0xC311);

    association.release().unwrap();
    let _ = handle.join().unwrap().unwrap();
}
