//! Bus subject catalogue shared with external services.
//!
//! Subjects are dot separated. Subscriptions may use NATS-style wildcards:
//! - `*` matches exactly one segment
//! - `>` matches one or more trailing segments

use super::value_object::{RoomId, UserId};

pub const EVENT_UPDATE: &str = "hiroba.events.update";
pub const EVENT_REGISTRATION: &str = "hiroba.events.registration";
pub const EVENT_REMINDER: &str = "hiroba.events.reminder";
pub const NOTIFICATION: &str = "hiroba.notifications";
pub const LIVE_LOCATION: &str = "hiroba.live.location";
pub const LIVE_ATTENDANCE: &str = "hiroba.live.attendance";
pub const LIVE_POLL: &str = "hiroba.live.poll";
pub const LIVE_QNA: &str = "hiroba.live.qna";
pub const BROADCAST_GLOBAL: &str = "hiroba.broadcast.global";

const BROADCAST_USER_PREFIX: &str = "hiroba.broadcast.user.";
const BROADCAST_ROOM_PREFIX: &str = "hiroba.broadcast.room.";

/// Wildcard matching every per-user broadcast subject.
pub const BROADCAST_USER_PATTERN: &str = "hiroba.broadcast.user.*";
/// Wildcard matching every per-room broadcast subject.
pub const BROADCAST_ROOM_PATTERN: &str = "hiroba.broadcast.room.*";

/// Every subscription the bridge opens at start-up.
pub const SUBSCRIPTIONS: [&str; 11] = [
    EVENT_UPDATE,
    EVENT_REGISTRATION,
    EVENT_REMINDER,
    NOTIFICATION,
    LIVE_LOCATION,
    LIVE_ATTENDANCE,
    LIVE_POLL,
    LIVE_QNA,
    BROADCAST_USER_PATTERN,
    BROADCAST_ROOM_PATTERN,
    BROADCAST_GLOBAL,
];

pub fn user_broadcast(user_id: &UserId) -> String {
    format!("{BROADCAST_USER_PREFIX}{user_id}")
}

pub fn room_broadcast(room_id: &RoomId) -> String {
    format!("{BROADCAST_ROOM_PREFIX}{room_id}")
}

/// Recognised subject with its parameter extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject<'a> {
    EventUpdate,
    EventRegistration,
    EventReminder,
    Notification,
    LiveLocation,
    LiveAttendance,
    LivePoll,
    LiveQna,
    UserBroadcast(&'a str),
    RoomBroadcast(&'a str),
    GlobalBroadcast,
}

impl<'a> Subject<'a> {
    pub fn parse(subject: &'a str) -> Option<Self> {
        let parsed = match subject {
            EVENT_UPDATE => Subject::EventUpdate,
            EVENT_REGISTRATION => Subject::EventRegistration,
            EVENT_REMINDER => Subject::EventReminder,
            NOTIFICATION => Subject::Notification,
            LIVE_LOCATION => Subject::LiveLocation,
            LIVE_ATTENDANCE => Subject::LiveAttendance,
            LIVE_POLL => Subject::LivePoll,
            LIVE_QNA => Subject::LiveQna,
            BROADCAST_GLOBAL => Subject::GlobalBroadcast,
            other => {
                if let Some(user) = other.strip_prefix(BROADCAST_USER_PREFIX) {
                    Subject::UserBroadcast(user)
                } else if let Some(room) = other.strip_prefix(BROADCAST_ROOM_PREFIX) {
                    Subject::RoomBroadcast(room)
                } else {
                    return None;
                }
            }
        };
        Some(parsed)
    }
}

/// Check if a subscription pattern matches a concrete subject.
pub fn matches_subject(pattern: &str, subject: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let subject_parts: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;
    while pi < pattern_parts.len() && si < subject_parts.len() {
        match pattern_parts[pi] {
            // consumes the rest, at least one segment is left here
            ">" => return true,
            "*" => {}
            literal if literal == subject_parts[si] => {}
            _ => return false,
        }
        pi += 1;
        si += 1;
    }

    pi == pattern_parts.len() && si == subject_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard_matching() {
        assert!(matches_subject(EVENT_UPDATE, "hiroba.events.update"));
        assert!(!matches_subject(EVENT_UPDATE, "hiroba.events.reminder"));
        assert!(matches_subject(BROADCAST_USER_PATTERN, "hiroba.broadcast.user.alice"));
        assert!(!matches_subject(BROADCAST_USER_PATTERN, "hiroba.broadcast.user"));
        assert!(!matches_subject(
            BROADCAST_USER_PATTERN,
            "hiroba.broadcast.user.alice.extra"
        ));
        assert!(matches_subject("hiroba.>", "hiroba.live.poll"));
        assert!(!matches_subject("hiroba.live.poll.>", "hiroba.live.poll"));
    }

    #[test]
    fn test_parameterized_subjects_round_trip() {
        // テスト項目: ユーザー / ルーム単位のサブジェクトからパラメータを取り出せる
        // given (前提条件):
        let user = UserId::new("alice".to_string()).unwrap();
        let room = RoomId::event_live("7").unwrap();

        // when (操作):
        let user_subject = user_broadcast(&user);
        let room_subject = room_broadcast(&room);

        // then (期待する結果):
        assert_eq!(
            Subject::parse(&user_subject),
            Some(Subject::UserBroadcast("alice"))
        );
        assert_eq!(
            Subject::parse(&room_subject),
            Some(Subject::RoomBroadcast("event_live:7"))
        );
        assert!(matches_subject(BROADCAST_ROOM_PATTERN, &room_subject));
        assert_eq!(Subject::parse("hiroba.unknown"), None);
    }

    #[test]
    fn test_every_subscription_is_recognised() {
        for subject in SUBSCRIPTIONS.iter().filter(|s| !s.contains('*')) {
            assert!(Subject::parse(subject).is_some(), "{subject}");
        }
    }
}
