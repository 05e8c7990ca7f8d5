use thiserror::Error;

use crate::protocol::{ClientId, VariableId};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no subscriptions outstanding")]
    Empty,
    #[error("request quota exhausted for client {client} (remote: {remote})")]
    QuotaExceeded { client: ClientId, remote: bool },
    #[error("unknown variable id {0}")]
    UnknownVariable(VariableId),
    #[error("client id {0} out of range")]
    ClientOutOfRange(ClientId),
}

pub type Result<T> = std::result::Result<T, Error>;
