use ulid::Ulid;

use crate::model::{TableId, VisitStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("table {table_id} not found in restaurant {restaurant_id}")]
    TableNotFound { restaurant_id: Ulid, table_id: TableId },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("table {0} already exists")]
    TableAlreadyExists(TableId),
    #[error("visit of {minutes} minutes is shorter than the minimum of {min}")]
    VisitTooShort { minutes: i64, min: i64 },
    #[error("visit of {minutes} minutes exceeds the maximum of {max}")]
    VisitExceedsMaxTime { minutes: i64, max: i64 },
    #[error("invalid time window: start must be before end")]
    InvalidWindow,
    #[error("invalid party size: {0}")]
    InvalidPartySize(u32),
    #[error("reservation starts in the past")]
    ReservationInPast,
    #[error("requester already holds an overlapping reservation: {0}")]
    Duplicate(Ulid),
    #[error("no available table")]
    NoAvailableTable,
    #[error("table {table_id} is not available: conflicts with visit {conflict}")]
    TableNotAvailable { table_id: TableId, conflict: Ulid },
    #[error("visit {visit_id} has incorrect status: {status}")]
    IncorrectVisitStatus { visit_id: Ulid, status: VisitStatus },
    #[error("visit {0} has neither a start time nor a reservation")]
    InvalidState(Ulid),
    #[error("access denied")]
    AccessDenied,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Failures caused by a concurrent writer winning the same slot. The
    /// caller may resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Duplicate(_)
                | EngineError::NoAvailableTable
                | EngineError::TableNotAvailable { .. }
        )
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::TableNotFound { .. } => "P0002",
            EngineError::AlreadyExists(_) | EngineError::TableAlreadyExists(_) => "23505",
            EngineError::Duplicate(_)
            | EngineError::NoAvailableTable
            | EngineError::TableNotAvailable { .. } => "40001",
            EngineError::VisitTooShort { .. }
            | EngineError::VisitExceedsMaxTime { .. }
            | EngineError::InvalidWindow
            | EngineError::InvalidPartySize(_)
            | EngineError::ReservationInPast => "22023",
            EngineError::IncorrectVisitStatus { .. } | EngineError::InvalidState(_) => "55000",
            EngineError::AccessDenied => "42501",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_map_to_serialization_failure() {
        let retryable = [
            EngineError::Duplicate(Ulid::nil()),
            EngineError::NoAvailableTable,
            EngineError::TableNotAvailable {
                table_id: 1,
                conflict: Ulid::nil(),
            },
        ];
        for e in retryable {
            assert!(e.is_retryable(), "{e}");
            assert_eq!(e.sqlstate(), "40001");
        }
    }

    #[test]
    fn validation_errors_are_final() {
        let e = EngineError::VisitTooShort { minutes: 10, min: 30 };
        assert!(!e.is_retryable());
        assert_eq!(e.sqlstate(), "22023");
        assert!(e.to_string().contains("10"));
        assert_eq!(EngineError::AccessDenied.sqlstate(), "42501");
        assert_eq!(EngineError::NotFound(Ulid::nil()).sqlstate(), "P0002");
    }
}
