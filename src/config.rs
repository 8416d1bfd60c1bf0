//! Application entity configuration.

use std::time::Duration;

use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid AE title `{}`: {}", ae_title, reason))]
    InvalidAeTitle {
        ae_title: String,
        reason: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid maximum PDU size {}", value))]
    InvalidMaxPduSize { value: u32, backtrace: Backtrace },

    #[snafu(display("maximum_associations must be at least 1"))]
    InvalidMaximumAssociations { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What to do when the network timeout expires
/// on an established but idle association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTimeoutResponse {
    /// abort the association (A-ABORT)
    Abort,
    /// release the association gracefully (A-RELEASE)
    Release,
}

/// Configuration of a local application entity.
///
/// The same surface applies to requestor and acceptor nodes;
/// the acceptor-only options (`maximum_associations`,
/// `require_called_aet`, `require_calling_aet`,
/// `unrestricted_storage_service`) have no effect on a requestor.
#[derive(Debug, Clone)]
pub struct AeConfig {
    /// the local AE title, sent as 16 space-padded ASCII bytes
    pub ae_title: String,
    /// maximum incoming PDU body length; 0 means unlimited
    pub maximum_pdu_size: u32,
    /// how many simultaneous associations the acceptor serves
    pub maximum_associations: usize,
    /// interval of the association request/reply timer
    pub acse_timeout: Option<Duration>,
    /// how long to wait for a DIMSE response
    pub dimse_timeout: Option<Duration>,
    /// how long the wire may stay silent on an established association
    pub network_timeout: Option<Duration>,
    /// TCP connect timeout for the requestor
    pub connection_timeout: Option<Duration>,
    /// the action taken when `network_timeout` expires
    pub network_timeout_response: NetworkTimeoutResponse,
    /// reject association requests whose called AE title
    /// differs from `ae_title`
    pub require_called_aet: bool,
    /// when non-empty, only these calling AE titles are admitted
    pub require_calling_aet: Vec<String>,
    /// accept any abstract syntax as a storage service
    pub unrestricted_storage_service: bool,
}

impl Default for AeConfig {
    fn default() -> Self {
        AeConfig {
            ae_title: "THIS-AE".to_string(),
            maximum_pdu_size: DEFAULT_MAX_PDU,
            maximum_associations: 10,
            acse_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: Some(Duration::from_secs(30)),
            network_timeout: None,
            connection_timeout: None,
            network_timeout_response: NetworkTimeoutResponse::Abort,
            require_called_aet: false,
            require_calling_aet: Vec::new(),
            unrestricted_storage_service: false,
        }
    }
}

impl AeConfig {
    /// Check the configuration for local errors.
    /// Never touches the wire.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.ae_title.trim().is_empty(),
            InvalidAeTitleSnafu {
                ae_title: self.ae_title.clone(),
                reason: "must not be empty",
            }
        );
        ensure!(
            self.ae_title.len() <= 16,
            InvalidAeTitleSnafu {
                ae_title: self.ae_title.clone(),
                reason: "must not exceed 16 characters",
            }
        );
        ensure!(
            self.ae_title.is_ascii(),
            InvalidAeTitleSnafu {
                ae_title: self.ae_title.clone(),
                reason: "must be ASCII",
            }
        );
        ensure!(
            self.maximum_pdu_size == 0
                || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.maximum_pdu_size),
            InvalidMaxPduSizeSnafu {
                value: self.maximum_pdu_size,
            }
        );
        ensure!(
            self.maximum_associations >= 1,
            InvalidMaximumAssociationsSnafu
        );
        Ok(())
    }

    /// The maximum PDU body length to apply when reading from the wire,
    /// with 0 mapped to the standard ceiling.
    pub fn effective_read_limit(&self) -> u32 {
        if self.maximum_pdu_size == 0 {
            MAXIMUM_PDU_SIZE
        } else {
            self.maximum_pdu_size
        }
    }
}
