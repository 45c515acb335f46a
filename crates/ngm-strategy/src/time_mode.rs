//! Scale-out / scale-in windows.
//!
//! A cron period is open while its next scale-in fires before its next
//! scale-out. Cron expressions use the seconds-first syntax of the `cron`
//! crate (`"0 0 8 * * Mon-Fri"`). A fixed period is open on
//! `[scale_out_time, scale_in_time)`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use ngm_state::{TimeMode, TimePeriod};

use crate::error::{StrategyError, StrategyResult};

/// Position of `now` relative to every configured window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowState {
    /// Inside at least one scale-out window.
    pub in_scale_out: bool,
    /// At least one window has already closed.
    pub past_scale_in: bool,
}

impl WindowState {
    /// Capacity may be released: every window is closed and one has ended.
    pub fn should_scale_in(&self) -> bool {
        !self.in_scale_out && self.past_scale_in
    }
}

fn parse(expr: &str) -> StrategyResult<Schedule> {
    Schedule::from_str(expr).map_err(|source| StrategyError::InvalidCron {
        expr: expr.to_string(),
        source,
    })
}

fn period_state(period: &TimePeriod, now: DateTime<Utc>) -> StrategyResult<WindowState> {
    match period {
        TimePeriod::Cron {
            scale_out_cron,
            scale_in_cron,
        } => {
            let next_out = parse(scale_out_cron)?.after(&now).next();
            let next_in = parse(scale_in_cron)?.after(&now).next();
            let open = match (next_out, next_in) {
                (Some(out), Some(inn)) => inn < out,
                (None, Some(_)) => true,
                _ => false,
            };
            Ok(WindowState {
                in_scale_out: open,
                past_scale_in: !open,
            })
        }
        TimePeriod::Fixed {
            scale_out_time,
            scale_in_time,
        } => Ok(WindowState {
            in_scale_out: *scale_out_time <= now && now < *scale_in_time,
            past_scale_in: now >= *scale_in_time,
        }),
    }
}

/// Fold every period of `mode` into one [`WindowState`].
pub fn evaluate(mode: &TimeMode, now: DateTime<Utc>) -> StrategyResult<WindowState> {
    let mut state = WindowState::default();
    for period in &mode.time_periods {
        let s = period_state(period, now)?;
        state.in_scale_out |= s.in_scale_out;
        state.past_scale_in |= s.past_scale_in;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, h, m, 0).unwrap()
    }

    fn cron_mode(out: &str, inn: &str) -> TimeMode {
        TimeMode {
            time_periods: vec![TimePeriod::Cron {
                scale_out_cron: out.to_string(),
                scale_in_cron: inn.to_string(),
            }],
        }
    }

    #[test]
    fn cron_window_open_during_business_hours() {
        let mode = cron_mode("0 0 8 * * *", "0 0 20 * * *");
        let state = evaluate(&mode, at(12, 0)).unwrap();
        assert!(state.in_scale_out);
        assert!(!state.should_scale_in());
    }

    #[test]
    fn cron_window_closed_at_night() {
        let mode = cron_mode("0 0 8 * * *", "0 0 20 * * *");
        let state = evaluate(&mode, at(22, 0)).unwrap();
        assert!(!state.in_scale_out);
        assert!(state.should_scale_in());
    }

    #[test]
    fn fixed_window_boundaries() {
        let mode = TimeMode {
            time_periods: vec![TimePeriod::Fixed {
                scale_out_time: at(8, 0),
                scale_in_time: at(20, 0),
            }],
        };
        let before = evaluate(&mode, at(7, 0)).unwrap();
        assert!(!before.in_scale_out && !before.should_scale_in());

        assert!(evaluate(&mode, at(8, 0)).unwrap().in_scale_out);
        assert!(evaluate(&mode, at(20, 0)).unwrap().should_scale_in());
    }

    #[test]
    fn any_open_window_blocks_scale_in() {
        let mode = TimeMode {
            time_periods: vec![
                TimePeriod::Fixed {
                    scale_out_time: at(1, 0),
                    scale_in_time: at(2, 0),
                },
                TimePeriod::Fixed {
                    scale_out_time: at(9, 0),
                    scale_in_time: at(11, 0),
                },
            ],
        };
        let state = evaluate(&mode, at(10, 0)).unwrap();
        assert!(state.in_scale_out && state.past_scale_in);
        assert!(!state.should_scale_in());
    }

    #[test]
    fn invalid_cron_is_reported() {
        let mode = cron_mode("every morning", "0 0 20 * * *");
        assert!(matches!(
            evaluate(&mode, at(0, 0)),
            Err(StrategyError::InvalidCron { .. })
        ));
    }
}
