//! Association service for the DICOM upper layer protocol.
//!
//! This crate establishes, maintains and terminates associations
//! between DICOM application entities over TCP,
//! and carries DIMSE service requests and responses across them.
//!
//! - The [`machine`] module implements the upper layer protocol
//!   state machine driving establishment, release and abort.
//! - The [`pdu`] module models and codes the protocol data units.
//! - The [`presentation`] module keeps the negotiated presentation
//!   contexts and resolves them for DIMSE traffic.
//! - The [`acse`] module evaluates association requests
//!   on the acceptor side.
//! - The [`dimse`] module converts logical messages to and from
//!   presentation data value streams.
//! - The [`association`] module drives it all: the
//!   [requestor](association::RequestorOptions) and
//!   [acceptor](association::AcceptorOptions) APIs,
//!   with the DIMSE services on top.
//! - The [`events`] module holds the handler registry through which
//!   applications observe and serve the association.
//!
//! Data set encoding and decoding is delegated to the DICOM core
//! crates; this crate only moves data sets around, re-encoding them
//! when the negotiated transfer syntax demands it.

pub mod acse;
pub mod address;
pub mod association;
pub mod config;
pub mod dimse;
pub mod events;
pub mod machine;
pub mod pdu;
pub mod presentation;

/// The implementation class UID of this implementation.
///
/// Generated under the UUID-derived arc as per the standard,
/// part 5, section B.2. May change between versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137236757356966251337349635263711519266";

/// The implementation version name of this implementation.
/// May change between versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-ASSOC01";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::{
    AcceptorAssociation, AcceptorOptions, RequestorAssociation, RequestorOptions,
};
pub use config::AeConfig;
pub use pdu::{read_pdu, write_pdu, Pdu};
pub use presentation::ServiceClassRole;
