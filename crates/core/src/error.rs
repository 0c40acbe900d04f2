use thiserror::Error;

/// Named failures surfaced to whoever initiated the request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrmError {
    #[error("ERR_DUPLICATED_CONTACT")]
    DuplicateContact,
    #[error("ERR_WAPP_INVALID_CONTACT")]
    InvalidContact,
    #[error("ERR_WAPP_CHECK_CONTACT")]
    CheckContactFailed,
    #[error("ERR_CHECK_NUMBER")]
    NumberNotFound,
    #[error("ERR_NO_TICKET_FOUND")]
    TicketNotFound,
    #[error("ERR_TICKET_CONFLICT")]
    TicketConflict,
    #[error("ERR_WAPP_NOT_INITIALIZED")]
    SessionNotFound,
    #[error("ERR_SENDING_WAPP_MSG")]
    SendFailed,
}

impl CrmError {
    pub fn code(&self) -> String {
        self.to_string()
    }

    /// HTTP status the gateway answers with.
    pub fn status(&self) -> u16 {
        match self {
            CrmError::DuplicateContact | CrmError::TicketConflict => 409,
            CrmError::InvalidContact | CrmError::NumberNotFound => 400,
            CrmError::TicketNotFound | CrmError::SessionNotFound => 404,
            CrmError::CheckContactFailed | CrmError::SendFailed => 502,
        }
    }
}
