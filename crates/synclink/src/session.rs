//! Session identity carried across reconnects.

use std::time::{SystemTime, UNIX_EPOCH};

/// One logical client session, stable for the lifetime of the process.
///
/// The server has no memory of a prior socket's subscriptions, but the session
/// id ties successive connections of the same client together; the connection
/// count and previous close reason let it distinguish a resume from a restart.
#[derive(Debug)]
pub(crate) struct Session {
    session_id: String,
    connection_count: u32,
    last_close_reason: Option<String>,
    max_observed_timestamp: Option<i64>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            session_id: ulid::Ulid::new().to_string(),
            connection_count: 0,
            last_close_reason: None,
            max_observed_timestamp: None,
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Begin a new established connection: bumps the connection count and
    /// takes the close reason left behind by the previous socket.
    ///
    /// Returns `(connection_count, last_close_reason)` for the handshake.
    pub(crate) fn begin_connection(&mut self) -> (u32, Option<String>) {
        self.connection_count += 1;
        (self.connection_count, self.last_close_reason.take())
    }

    pub(crate) fn record_close_reason(&mut self, reason: impl Into<String>) {
        self.last_close_reason = Some(reason.into());
    }

    /// Track the highest server timestamp observed in mutation responses.
    pub(crate) fn observe_timestamp(&mut self, ts: i64) {
        match self.max_observed_timestamp {
            Some(seen) if seen >= ts => {}
            _ => self.max_observed_timestamp = Some(ts),
        }
    }

    pub(crate) fn max_observed_timestamp(&self) -> Option<i64> {
        self.max_observed_timestamp
    }

    /// Wall-clock milliseconds for the `clientTs` handshake field.
    pub(crate) fn client_ts() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_count_increments() {
        let mut session = Session::new();
        let (count, reason) = session.begin_connection();
        assert_eq!(count, 1);
        assert!(reason.is_none());

        session.record_close_reason("AbnormalClosure(1006)");
        let (count, reason) = session.begin_connection();
        assert_eq!(count, 2);
        assert_eq!(reason.as_deref(), Some("AbnormalClosure(1006)"));

        // The reason is consumed by the handshake that reports it.
        let (_, reason) = session.begin_connection();
        assert!(reason.is_none());
    }

    #[test]
    fn test_observed_timestamp_is_monotonic() {
        let mut session = Session::new();
        assert!(session.max_observed_timestamp().is_none());
        session.observe_timestamp(100);
        session.observe_timestamp(50);
        assert_eq!(session.max_observed_timestamp(), Some(100));
        session.observe_timestamp(200);
        assert_eq!(session.max_observed_timestamp(), Some(200));
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(Session::new().session_id(), Session::new().session_id());
    }
}
