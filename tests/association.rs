//! Association establishment, rejection, release and abort
//! over a loopback SCU/SCP pair.

use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;
use std::time::Duration;

use dicom_association::association::{AcceptorAssociation, AcceptorOptions, RequestorOptions};
use dicom_association::association::acceptor::ConcurrencyLimit;
use dicom_association::association::Error;
use dicom_association::pdu::{
    AssociationRJResult, PresentationContextResultReason,
};
use dicom_association::presentation::PresentationContext;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "TEST-SCU";
static SCP_AE_TITLE: &str = "TEST-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION: &str = "1.2.840.10008.1.1";
static MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

fn spawn_scp<F>(
    options: AcceptorOptions,
    body: F,
) -> Result<(JoinHandle<Result<AcceptorAssociation>>, SocketAddr)>
where
    F: FnOnce(&mut AcceptorAssociation) -> Result<()> + Send + 'static,
{
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let handle = std::thread::spawn(move || -> Result<AcceptorAssociation> {
        let (stream, _addr) = listener.accept()?;
        let mut association = options.establish(stream)?;
        body(&mut association)?;
        Ok(association)
    });
    Ok((handle, addr))
}

#[test]
fn establish_and_release() {
    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp, |scp| {
        scp.serve()?;
        Ok(())
    })
    .unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .with_presentation_context(
            MR_IMAGE_STORAGE,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        )
        .establish(addr)
        .unwrap();

    assert!(association.is_established());
    assert_eq!(association.peer_ae_title(), SCP_AE_TITLE);

    let contexts: Vec<&PresentationContext> =
        association.presentation_contexts().iter().collect();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].id, 1);
    assert_eq!(contexts[0].result, PresentationContextResultReason::Acceptance);
    assert_eq!(contexts[0].abstract_syntax, VERIFICATION);
    assert_eq!(contexts[1].id, 3);
    assert_eq!(
        contexts[1].result,
        PresentationContextResultReason::AbstractSyntaxNotSupported
    );

    association.release().unwrap();
    assert!(association.is_released());
    assert!(!association.is_established());
    assert!(!association.is_aborted());

    // abort after release stays a no-op
    association.abort().unwrap();
    assert!(association.is_released());
    assert!(!association.is_aborted());

    let scp = handle.join().unwrap().unwrap();
    assert!(scp.is_released());
}

#[test]
fn rejection_on_called_ae_title() {
    let scp = AcceptorOptions::new()
        .ae_title("ACCEPT")
        .require_called_aet(true)
        .with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp, |_| Ok(())).unwrap();

    let result = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("OTHER")
        .with_abstract_syntax(VERIFICATION)
        .establish(addr);

    match result {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Permanent);
            assert_eq!(association_rj.source.codes(), (1, 7));
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }

    // the acceptor side reports the same rejection
    match handle.join().unwrap() {
        Err(e) => {
            let message = e.to_string();
            assert!(message.contains("rejected"), "unexpected error: {}", message);
        }
        Ok(_) => panic!("acceptor should not establish"),
    }
}

#[test]
fn rejection_on_calling_ae_title_allow_list() {
    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .require_calling_aet(["TRUSTED-SCU"])
        .with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp, |_| Ok(())).unwrap();

    let result = RequestorOptions::new()
        .calling_ae_title("STRANGER")
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .establish(addr);

    match result {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.source.codes(), (1, 3));
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
    let _ = handle.join().unwrap();
}

#[test]
fn no_accepted_contexts_aborts() {
    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp, |scp| {
        scp.serve()?;
        Ok(())
    })
    .unwrap();

    // only an abstract syntax the acceptor does not support
    let result = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .establish(addr);

    assert!(matches!(
        result,
        Err(Error::NoAcceptedPresentationContexts)
    ));
    let scp = handle.join().unwrap().unwrap();
    assert!(scp.is_aborted());
}

#[test]
fn local_abort_is_idempotent_and_observed_by_peer() {
    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp, |scp| {
        scp.serve()?;
        Ok(())
    })
    .unwrap();

    let mut association = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .establish(addr)
        .unwrap();

    association.abort().unwrap();
    assert!(association.is_aborted());
    assert!(!association.is_established());
    assert!(!association.is_released());

    // abort again: no-op
    association.abort().unwrap();
    assert!(association.is_aborted());

    // release after abort: no-op, state unchanged
    association.release().unwrap();
    assert!(association.is_aborted());
    assert!(!association.is_released());

    let scp = handle.join().unwrap().unwrap();
    assert!(scp.is_aborted());
}

#[test]
fn concurrency_limit_rejects_excess_associations() {
    let limit = ConcurrencyLimit::new(1);

    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .limit(limit.clone());
    let (first_handle, first_addr) = spawn_scp(scp, |scp| {
        scp.serve()?;
        Ok(())
    })
    .unwrap();

    let mut first = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .establish(first_addr)
        .unwrap();
    assert!(first.is_established());

    // a second association while the first is active is turned away
    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .limit(limit.clone());
    let (second_handle, second_addr) = spawn_scp(scp, |_| Ok(())).unwrap();

    let result = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .acse_timeout(Some(Duration::from_secs(2)))
        .establish(second_addr);
    match result {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Transient);
            assert_eq!(association_rj.source.codes(), (3, 2));
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
    let _ = second_handle.join().unwrap();

    first.release().unwrap();
    let _ = first_handle.join().unwrap().unwrap();

    // with the first association gone, a new one fits again
    let scp = AcceptorOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .limit(limit);
    let (third_handle, third_addr) = spawn_scp(scp, |scp| {
        scp.serve()?;
        Ok(())
    })
    .unwrap();
    let mut third = RequestorOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .establish(third_addr)
        .unwrap();
    third.release().unwrap();
    let _ = third_handle.join().unwrap().unwrap();
}
