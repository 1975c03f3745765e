//! Error taxonomy for coordinator operations

use ipnet::Ipv4Net;
use sea_orm::DbErr;
use std::net::Ipv4Addr;
use thiserror::Error;
use tunnelgate_drivers::{InterfaceError, ProxyError};
use uuid::Uuid;

/// Coarse classification callers map onto transport status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    ExternalToolFailure,
    ConfigurationMissing,
    Internal,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Peer '{0}' not found")]
    PeerNotFound(Uuid),

    #[error("Tunnel '{0}' not found")]
    TunnelNotFound(Uuid),

    #[error("Peer '{0}' is inactive")]
    PeerInactive(Uuid),

    #[error("Subdomain '{0}' is already in use")]
    SubdomainTaken(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Address {0} is still bound to another peer")]
    AddressConflict(Ipv4Addr),

    #[error("Address pool {0} is exhausted")]
    AddressPoolExhausted(Ipv4Net),

    #[error("{0} is not configured")]
    ConfigurationMissing(&'static str),

    #[error("Corrupt stored value for {field}: {reason}")]
    CorruptRecord { field: String, reason: String },

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::PeerNotFound(_) | ControlError::TunnelNotFound(_) => ErrorKind::NotFound,
            ControlError::Interface(InterfaceError::PeerNotFound(_)) => ErrorKind::NotFound,
            ControlError::PeerInactive(_)
            | ControlError::SubdomainTaken(_)
            | ControlError::AddressConflict(_)
            | ControlError::AddressPoolExhausted(_) => ErrorKind::Conflict,
            ControlError::InvalidSubdomain(_) | ControlError::InvalidRequest(_) => {
                ErrorKind::BadRequest
            }
            ControlError::Interface(_) | ControlError::Proxy(_) => ErrorKind::ExternalToolFailure,
            ControlError::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            ControlError::CorruptRecord { .. } | ControlError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::PeerNotFound(_) => "PEER_NOT_FOUND",
            ControlError::TunnelNotFound(_) => "TUNNEL_NOT_FOUND",
            ControlError::PeerInactive(_) => "PEER_INACTIVE",
            ControlError::SubdomainTaken(_) => "SUBDOMAIN_TAKEN",
            ControlError::InvalidSubdomain(_) => "INVALID_SUBDOMAIN",
            ControlError::InvalidRequest(_) => "INVALID_REQUEST",
            ControlError::AddressConflict(_) => "ADDRESS_CONFLICT",
            ControlError::AddressPoolExhausted(_) => "ADDRESS_POOL_EXHAUSTED",
            ControlError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            ControlError::CorruptRecord { .. } => "CORRUPT_RECORD",
            ControlError::Interface(InterfaceError::PeerNotFound(_)) => "PEER_NOT_ON_INTERFACE",
            ControlError::Interface(_) => "NETWORK_COMMAND_FAILED",
            ControlError::Proxy(ProxyError::ReloadFailed(_)) => "PROXY_RELOAD_FAILED",
            ControlError::Proxy(ProxyError::WriteFailed { .. }) => "PROXY_WRITE_FAILED",
            ControlError::Proxy(ProxyError::RemoveFailed { .. }) => "PROXY_REMOVE_FAILED",
            ControlError::Proxy(ProxyError::ListFailed { .. }) => "PROXY_LIST_FAILED",
            ControlError::Database(_) => "DATABASE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
