use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Visit length must lie within `[MIN_VISIT_MINUTES, max_reservation_minutes]`.
pub fn validate_duration(settings: &RestaurantSettings, window: &Span) -> Result<(), EngineError> {
    let minutes = window.duration_minutes();
    if window.duration_ms() > settings.max_duration_ms() {
        return Err(EngineError::VisitExceedsMaxTime {
            minutes: (window.duration_ms() + MINUTE_MS - 1) / MINUTE_MS,
            max: settings.max_reservation_minutes as i64,
        });
    }
    if minutes < MIN_VISIT_MINUTES {
        return Err(EngineError::VisitTooShort {
            minutes,
            min: MIN_VISIT_MINUTES,
        });
    }
    Ok(())
}

pub(crate) fn validate_timestamps(start: Ms, end: Ms) -> Result<(), EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if start >= end {
        return Err(EngineError::InvalidWindow);
    }
    Ok(())
}

pub(crate) fn validate_party_size(party_size: u32) -> Result<(), EngineError> {
    if party_size == 0 || party_size > MAX_PARTY_SIZE {
        return Err(EngineError::InvalidPartySize(party_size));
    }
    Ok(())
}

/// Shape checks that need no restaurant state.
pub fn validate_request(request: &ReservationRequest, now: Ms) -> Result<(), EngineError> {
    validate_party_size(request.party_size)?;
    validate_timestamps(request.window.start, request.window.end)?;
    if request.window.start < now {
        return Err(EngineError::ReservationInPast);
    }
    Ok(())
}

pub(crate) fn validate_settings(settings: &RestaurantSettings) -> Result<(), EngineError> {
    let max = settings.max_reservation_minutes;
    if (max as i64) < MIN_VISIT_MINUTES || max > MAX_RESERVATION_MINUTES_CAP {
        return Err(EngineError::LimitExceeded("max reservation minutes out of range"));
    }
    Ok(())
}
