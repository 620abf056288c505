//! Load scheduling
//!
//! Decides when a remote that finished downloading should switch to the new
//! image.

use std::time::Duration;

use chrono::{DateTime, Days, FixedOffset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::UpdateConfig;

/// Added to every load delay when re-arming the session timeout
pub const LOAD_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Load policy chosen by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadType {
    /// Load as soon as asked
    Now,
    /// Load at `time_to_load`
    AtTime,
    /// Load once the remote has been idle for `time_after_inactive`
    WhenInactive,
}

/// Per-session load policy; `load_type: None` means the configured default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPolicy {
    pub load_type: Option<LoadType>,
    pub time_to_load: Option<DateTime<Utc>>,
    pub time_after_inactive: Duration,
}

/// Answer to a remote asking when to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadInfo {
    Now,
    /// Ask again after the delay
    PollAgain(Duration),
    /// Load after being idle for the delay
    WhenInactive(Duration),
}

impl LoadInfo {
    /// Delay carried by the answer, zero for [`LoadInfo::Now`]
    pub fn delay(&self) -> Duration {
        match self {
            LoadInfo::Now => Duration::ZERO,
            LoadInfo::PollAgain(delay) | LoadInfo::WhenInactive(delay) => *delay,
        }
    }
}

/// Compute the load answer
///
/// `awaiting_initiation` is true while an interactive load has not been
/// started. `now` is local wall-clock time, used for the daily load window.
pub fn decide(
    policy: &LoadPolicy,
    awaiting_initiation: bool,
    config: &UpdateConfig,
    now: DateTime<FixedOffset>,
) -> LoadInfo {
    if awaiting_initiation {
        return LoadInfo::PollAgain(config.load_poll_interval);
    }

    let answer = match policy.load_type {
        Some(LoadType::Now) => LoadInfo::Now,
        Some(LoadType::AtTime) => match policy.time_to_load {
            Some(at) if at.fixed_offset() > now => {
                LoadInfo::PollAgain((at.fixed_offset() - now).to_std().unwrap_or_default())
            }
            _ => LoadInfo::Now,
        },
        Some(LoadType::WhenInactive) => LoadInfo::WhenInactive(policy.time_after_inactive),
        None if config.load_immediately => LoadInfo::Now,
        None => LoadInfo::WhenInactive(config.load_inactivity_delay),
    };

    match (answer, config.load_before_hour) {
        (LoadInfo::PollAgain(_), _) | (_, None) => answer,
        (_, Some(hour)) if now.hour() >= u32::from(hour) => {
            LoadInfo::PollAgain(until_midnight(now))
        }
        _ => answer,
    }
}

fn until_midnight(now: DateTime<FixedOffset>) -> Duration {
    let midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|naive| now.timezone().from_local_datetime(&naive).single());
    match midnight {
        Some(midnight) => (midnight - now).to_std().unwrap_or_default(),
        None => Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .and_then(|tz| tz.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).single())
            .unwrap_or_default()
    }

    #[test]
    fn test_default_policy() {
        let mut config = UpdateConfig::default();
        let policy = LoadPolicy::default();
        assert_eq!(
            decide(&policy, false, &config, at(10, 0)),
            LoadInfo::WhenInactive(config.load_inactivity_delay)
        );
        config.load_immediately = true;
        assert_eq!(decide(&policy, false, &config, at(10, 0)), LoadInfo::Now);
    }

    #[test]
    fn test_interactive_waits() {
        let config = UpdateConfig::default();
        let policy = LoadPolicy {
            load_type: Some(LoadType::Now),
            ..LoadPolicy::default()
        };
        assert_eq!(
            decide(&policy, true, &config, at(10, 0)),
            LoadInfo::PollAgain(config.load_poll_interval)
        );
    }

    #[test]
    fn test_at_time() {
        let config = UpdateConfig::default();
        let now = at(10, 0);
        let policy = LoadPolicy {
            load_type: Some(LoadType::AtTime),
            time_to_load: Some((now + chrono::Duration::minutes(5)).with_timezone(&Utc)),
            ..LoadPolicy::default()
        };
        assert_eq!(
            decide(&policy, false, &config, now),
            LoadInfo::PollAgain(Duration::from_secs(300))
        );
        assert_eq!(decide(&policy, false, &config, at(10, 6)), LoadInfo::Now);
    }

    #[test]
    fn test_load_window_defers_to_midnight() {
        let config = UpdateConfig {
            load_immediately: true,
            load_before_hour: Some(5),
            ..UpdateConfig::default()
        };
        let policy = LoadPolicy::default();
        assert_eq!(decide(&policy, false, &config, at(4, 59)), LoadInfo::Now);
        assert_eq!(
            decide(&policy, false, &config, at(22, 0)),
            LoadInfo::PollAgain(Duration::from_secs(2 * 3600))
        );
    }
}
