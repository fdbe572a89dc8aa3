//! Job triggers.
//!
//! A trigger answers one question, "when is this job due next?", and moves
//! forward one occurrence each time the job fires. The engine only talks to
//! [`Trigger::has_next_due_time`] and [`Trigger::advance`], so adding a
//! variant never touches the scheduling code.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// When and how often a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at `at`.
    PointInTime {
        at: DateTime<Utc>,
        #[serde(default)]
        fired: bool,
    },
    /// Fire at `start`, then every `interval_millis`.
    ///
    /// `repeat_limit` caps the total number of firings; a negative limit
    /// repeats until `end_time` (if any).
    Interval {
        start: DateTime<Utc>,
        interval_millis: u64,
        repeat_limit: i32,
        #[serde(default)]
        repeat_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_time: Option<DateTime<Utc>>,
    },
}

impl Trigger {
    /// A single occurrence at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Trigger::PointInTime { at, fired: false }
    }

    /// Occurrences every `interval` from `start`, at most `repeat_limit` of them.
    pub fn interval(start: DateTime<Utc>, interval: Duration, repeat_limit: i32) -> Self {
        Trigger::Interval {
            start,
            interval_millis: interval.num_milliseconds().max(0) as u64,
            repeat_limit,
            repeat_count: 0,
            end_time: None,
        }
    }

    /// Stop producing occurrences after `end`.
    pub fn until(self, end: DateTime<Utc>) -> Self {
        match self {
            Trigger::Interval {
                start,
                interval_millis,
                repeat_limit,
                repeat_count,
                ..
            } => Trigger::Interval {
                start,
                interval_millis,
                repeat_limit,
                repeat_count,
                end_time: Some(end),
            },
            other => other,
        }
    }

    /// The next due time, or `None` once the trigger is exhausted.
    pub fn has_next_due_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::PointInTime { at, fired } => (!fired).then_some(*at),
            Trigger::Interval {
                start,
                interval_millis,
                repeat_limit,
                repeat_count,
                end_time,
            } => {
                if *repeat_limit >= 0 && i64::from(*repeat_count) >= i64::from(*repeat_limit) {
                    return None;
                }
                let offset = (*interval_millis as i64).checked_mul(i64::from(*repeat_count))?;
                let next = start.checked_add_signed(Duration::milliseconds(offset))?;
                match end_time {
                    Some(end) if next > *end => None,
                    _ => Some(next),
                }
            }
        }
    }

    /// Move to the following occurrence. No-op on an exhausted trigger.
    pub fn advance(&mut self) {
        if self.has_next_due_time().is_none() {
            return;
        }
        match self {
            Trigger::PointInTime { fired, .. } => *fired = true,
            Trigger::Interval { repeat_count, .. } => *repeat_count += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_point_in_time_fires_once() {
        let at = Utc::now() + Duration::hours(1);
        let mut trigger = Trigger::at(at);

        assert_eq!(trigger.has_next_due_time(), Some(at));
        trigger.advance();
        assert_eq!(trigger.has_next_due_time(), None);

        // Advancing an exhausted trigger changes nothing
        trigger.advance();
        assert_eq!(trigger, Trigger::PointInTime { at, fired: true });
    }

    #[test]
    fn test_interval_steps_by_interval() {
        let start = Utc::now();
        let mut trigger = Trigger::interval(start, Duration::seconds(30), 3);

        assert_eq!(trigger.has_next_due_time(), Some(start));
        trigger.advance();
        assert_eq!(
            trigger.has_next_due_time(),
            Some(start + Duration::seconds(30))
        );
        trigger.advance();
        assert_eq!(
            trigger.has_next_due_time(),
            Some(start + Duration::seconds(60))
        );
        trigger.advance();
        assert_eq!(trigger.has_next_due_time(), None);
    }

    #[test]
    fn test_interval_zero_limit_never_fires() {
        let trigger = Trigger::interval(Utc::now(), Duration::seconds(1), 0);
        assert!(trigger.has_next_due_time().is_none());
    }

    #[test]
    fn test_interval_end_time() {
        let start = Utc::now();
        let mut trigger =
            Trigger::interval(start, Duration::minutes(1), -1).until(start + Duration::seconds(90));

        assert_eq!(trigger.has_next_due_time(), Some(start));
        trigger.advance();
        assert_eq!(
            trigger.has_next_due_time(),
            Some(start + Duration::minutes(1))
        );
        trigger.advance();
        assert!(trigger.has_next_due_time().is_none());
    }

    #[test]
    fn test_until_ignored_for_point_in_time() {
        let at = Utc::now();
        let trigger = Trigger::at(at).until(at - Duration::hours(1));
        assert_eq!(trigger.has_next_due_time(), Some(at));
    }

    #[test]
    fn test_serde_tagged() {
        let at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(Trigger::at(at)).unwrap();
        assert_eq!(json["type"], "point_in_time");

        let parsed: Trigger = serde_json::from_str(
            r#"{"type":"interval","start":"2026-01-01T00:00:00Z","interval_millis":1000,"repeat_limit":-1}"#,
        )
        .unwrap();
        assert_eq!(parsed.has_next_due_time(), Some(at));
    }

    proptest! {
        // A bounded interval trigger produces exactly repeat_limit occurrences
        #[test]
        fn bounded_interval_fires_exactly_limit(limit in 0i32..50, interval_secs in 1i64..3600) {
            let mut trigger = Trigger::interval(Utc::now(), Duration::seconds(interval_secs), limit);
            let mut fired = 0;
            while trigger.has_next_due_time().is_some() {
                trigger.advance();
                fired += 1;
                prop_assert!(fired <= limit, "fired more than the limit");
            }
            prop_assert_eq!(fired, limit);
        }

        // Due times are strictly increasing for positive intervals
        #[test]
        fn interval_due_times_increase(interval_millis in 1i64..1_000_000, steps in 1usize..20) {
            let mut trigger = Trigger::interval(Utc::now(), Duration::milliseconds(interval_millis), -1);
            let mut previous = trigger.has_next_due_time().unwrap();
            for _ in 0..steps {
                trigger.advance();
                let next = trigger.has_next_due_time().unwrap();
                prop_assert_eq!((next - previous).num_milliseconds(), interval_millis);
                previous = next;
            }
        }
    }
}
