use chrono::{DateTime, Duration, Utc};

use lm_assist_types::{RecordKind, SessionStatus};

const RUNNING_WINDOW_SECS: i64 = 60;
const IDLE_WINDOW_SECS: i64 = 600;

/// Evidence the status machine runs on. `last_activity` is the max of the
/// file mtime and the last record timestamp.
#[derive(Debug, Clone)]
pub struct StatusInputs {
    pub has_result: bool,
    pub result_success: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub tail_kind: Option<RecordKind>,
    pub tail_prev_kind: Option<RecordKind>,
    pub has_assistant: bool,
}

/// Classify a session from available evidence; never stored, always
/// recomputed on read.
pub fn classify(inputs: &StatusInputs, now: DateTime<Utc>) -> SessionStatus {
    if inputs.has_result {
        return if inputs.result_success {
            SessionStatus::Completed
        } else {
            SessionStatus::Error
        };
    }

    let idle = inputs
        .last_activity
        .map(|at| now.signed_duration_since(at))
        .unwrap_or(Duration::MAX);

    if idle < Duration::seconds(RUNNING_WINDOW_SECS) {
        return SessionStatus::Running;
    }

    let idle_expired = idle >= Duration::seconds(IDLE_WINDOW_SECS);

    // A trailing user message with no answer: the agent never responded.
    if inputs.tail_kind == Some(RecordKind::User) && (!inputs.has_assistant || idle_expired) {
        return SessionStatus::Interrupted;
    }

    // Assistant (optionally followed by system bookkeeping) at the tail,
    // gone quiet: finished without a result record.
    let assistant_tail = inputs.tail_kind == Some(RecordKind::Assistant)
        || (inputs.tail_kind == Some(RecordKind::System)
            && inputs.tail_prev_kind == Some(RecordKind::Assistant));
    if assistant_tail && idle_expired {
        return SessionStatus::Completed;
    }

    if !idle_expired {
        return SessionStatus::Idle;
    }

    SessionStatus::Stale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> StatusInputs {
        StatusInputs {
            has_result: false,
            result_success: false,
            last_activity: None,
            tail_kind: None,
            tail_prev_kind: None,
            has_assistant: false,
        }
    }

    #[test]
    fn test_result_success_is_completed() {
        let mut i = inputs();
        i.has_result = true;
        i.result_success = true;
        assert_eq!(classify(&i, Utc::now()), SessionStatus::Completed);
    }

    #[test]
    fn test_result_error() {
        let mut i = inputs();
        i.has_result = true;
        assert_eq!(classify(&i, Utc::now()), SessionStatus::Error);
    }

    #[test]
    fn test_recent_activity_is_running() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::seconds(30));
        i.tail_kind = Some(RecordKind::Assistant);
        i.has_assistant = true;
        assert_eq!(classify(&i, now), SessionStatus::Running);
    }

    #[test]
    fn test_assistant_tail_after_ten_minutes_is_completed() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::minutes(12));
        i.tail_kind = Some(RecordKind::Assistant);
        i.has_assistant = true;
        assert_eq!(classify(&i, now), SessionStatus::Completed);
    }

    #[test]
    fn test_assistant_then_system_tail_is_completed() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::minutes(12));
        i.tail_kind = Some(RecordKind::System);
        i.tail_prev_kind = Some(RecordKind::Assistant);
        i.has_assistant = true;
        assert_eq!(classify(&i, now), SessionStatus::Completed);
    }

    #[test]
    fn test_user_tail_after_ten_minutes_is_interrupted() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::minutes(12));
        i.tail_kind = Some(RecordKind::User);
        i.has_assistant = true;
        assert_eq!(classify(&i, now), SessionStatus::Interrupted);
    }

    #[test]
    fn test_user_tail_never_answered_is_interrupted_even_when_recentish() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::minutes(2));
        i.tail_kind = Some(RecordKind::User);
        i.has_assistant = false;
        assert_eq!(classify(&i, now), SessionStatus::Interrupted);
    }

    #[test]
    fn test_quietish_session_is_idle() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::minutes(5));
        i.tail_kind = Some(RecordKind::Assistant);
        i.has_assistant = true;
        assert_eq!(classify(&i, now), SessionStatus::Idle);
    }

    #[test]
    fn test_old_empty_file_is_stale() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::hours(2));
        assert_eq!(classify(&i, now), SessionStatus::Stale);
    }

    #[test]
    fn test_fresh_empty_file_is_running() {
        let now = Utc::now();
        let mut i = inputs();
        i.last_activity = Some(now - Duration::seconds(5));
        assert_eq!(classify(&i, now), SessionStatus::Running);
    }
}
