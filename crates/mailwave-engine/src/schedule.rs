//! Send-instant scheduling: business-hours window resolution plus the
//! randomized spacing chain.
//!
//! Both halves are pure. `next_send_instant` moves a candidate instant
//! forward to the first legal moment inside the configured window;
//! `ScheduleChain` threads one candidate per recipient off the previous
//! recipient's scheduled instant. Instants only ever move forward, so the
//! per-recipient schedule is non-decreasing in list order.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;

use mailwave_core::Campaign;

/// The recurring window sends are allowed in, evaluated in a fixed timezone.
#[derive(Debug, Clone)]
pub struct SendWindow {
    /// When false, every candidate instant is already legal.
    pub enabled: bool,
    /// Local hour the window opens (inclusive).
    pub start_hour: u32,
    /// Local hour the window closes (exclusive).
    pub end_hour: u32,
    /// Saturday and Sunday are excluded when set.
    pub weekdays_only: bool,
    pub tz: Tz,
}

impl SendWindow {
    /// Window as configured on a campaign. The timezone string was validated
    /// at creation; an unparseable one (hand-edited storage) falls back to
    /// UTC rather than stalling the batch.
    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            enabled: campaign.respect_business_hours,
            start_hour: campaign.business_hours_start as u32,
            end_hour: campaign.business_hours_end as u32,
            weekdays_only: campaign.business_days_only,
            tz: campaign.timezone.parse().unwrap_or(Tz::UTC),
        }
    }

    /// An always-open window (business hours disabled).
    pub fn always_open() -> Self {
        Self {
            enabled: false,
            start_hour: 0,
            end_hour: 24,
            weekdays_only: false,
            tz: Tz::UTC,
        }
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Local midnight-anchored window opening for `date`. `None` only when the
/// opening hour lands in a DST gap that the one-hour slide cannot escape.
fn window_open(date: NaiveDate, window: &SendWindow) -> Option<DateTime<Tz>> {
    let at = |hour: u32| {
        window
            .tz
            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, 0, 0)
            .earliest()
    };
    // DST spring-forward can delete the opening hour; slide one hour in
    at(window.start_hour)
        .or_else(|| at((window.start_hour + 1).min(23)))
}

/// Resolve `candidate` to the next legal send instant.
///
/// Outside the window the instant advances to the opening of the next
/// eligible day (same day when the window has not opened yet) and is
/// re-evaluated; the loop settles within two advances plus weekend skips.
pub fn next_send_instant(candidate: DateTime<Utc>, window: &SendWindow) -> DateTime<Utc> {
    if !window.enabled {
        return candidate;
    }

    let mut local = candidate.with_timezone(&window.tz);
    for _ in 0..16 {
        if window.weekdays_only && is_weekend(local.weekday()) {
            let Some(next_day) = local.date_naive().succ_opt() else {
                return candidate;
            };
            let Some(opened) = window_open(next_day, window) else {
                return candidate;
            };
            local = opened;
            continue;
        }
        let hour = local.hour();
        if hour < window.start_hour {
            let Some(opened) = window_open(local.date_naive(), window) else {
                return candidate;
            };
            local = opened;
            continue;
        }
        if hour >= window.end_hour {
            let Some(next_day) = local.date_naive().succ_opt() else {
                return candidate;
            };
            let Some(opened) = window_open(next_day, window) else {
                return candidate;
            };
            local = opened;
            continue;
        }
        return local.with_timezone(&Utc);
    }

    // A window this pathological (every probe in a DST gap) does not occur
    // with real tz data; keep the lower-bound contract and send now.
    tracing::warn!("⚠️ Send window resolution did not settle; using candidate instant");
    candidate
}

/// Randomized spacing between consecutive recipients.
#[derive(Debug, Clone)]
pub struct Spacing {
    pub use_delay: bool,
    pub min_minutes: i64,
    pub max_minutes: i64,
}

impl Spacing {
    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            use_delay: campaign.use_delay,
            min_minutes: campaign.delay_min_minutes,
            max_minutes: campaign.delay_max_minutes,
        }
    }

    pub fn none() -> Self {
        Self {
            use_delay: false,
            min_minutes: 0,
            max_minutes: 0,
        }
    }

    /// Draw one inter-recipient delay, uniform over `[min, max]` minutes.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> Duration {
        if !self.use_delay {
            return Duration::zero();
        }
        Duration::minutes(rng.gen_range(self.min_minutes..=self.max_minutes))
    }
}

/// Per-recipient scheduled instants, chained in recipient-list order.
///
/// The first recipient's candidate is the trigger instant; each subsequent
/// candidate is the previous *scheduled* instant plus one drawn delay. No
/// delay trails the last recipient.
pub struct ScheduleChain<'a, R: Rng> {
    window: &'a SendWindow,
    spacing: &'a Spacing,
    rng: R,
    trigger: DateTime<Utc>,
    prev: Option<DateTime<Utc>>,
}

impl<'a, R: Rng> ScheduleChain<'a, R> {
    pub fn new(
        trigger: DateTime<Utc>,
        window: &'a SendWindow,
        spacing: &'a Spacing,
        rng: R,
    ) -> Self {
        Self {
            window,
            spacing,
            rng,
            trigger,
            prev: None,
        }
    }

    /// Scheduled instant for the next recipient in list order.
    pub fn next_instant(&mut self) -> DateTime<Utc> {
        let candidate = match self.prev {
            None => self.trigger,
            Some(prev) => prev + self.spacing.draw(&mut self.rng),
        };
        let scheduled = next_send_instant(candidate, self.window);
        self.prev = Some(scheduled);
        scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn window(start: u32, end: u32, weekdays_only: bool, tz: Tz) -> SendWindow {
        SendWindow {
            enabled: true,
            start_hour: start,
            end_hour: end,
            weekdays_only,
            tz,
        }
    }

    #[test]
    fn test_disabled_window_passes_through() {
        let candidate = Utc.with_ymd_and_hms(2025, 6, 14, 3, 12, 45).unwrap();
        assert_eq!(next_send_instant(candidate, &SendWindow::always_open()), candidate);
    }

    #[test]
    fn test_saturday_resolves_to_monday_open() {
        // Saturday 2025-06-14 10:00 UTC → Monday 2025-06-16 09:00 UTC
        let candidate = Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap();
        let resolved = next_send_instant(candidate, &window(9, 17, true, Tz::UTC));
        assert_eq!(resolved, Utc.with_ymd_and_hms(2025, 6, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_weekend_allowed_when_not_weekdays_only() {
        // Saturday inside the hours window stays put
        let candidate = Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap();
        let resolved = next_send_instant(candidate, &window(9, 17, false, Tz::UTC));
        assert_eq!(resolved, candidate);
    }

    #[test]
    fn test_before_hours_same_day() {
        // Monday 03:30 → Monday 09:00
        let candidate = Utc.with_ymd_and_hms(2025, 6, 16, 3, 30, 0).unwrap();
        let resolved = next_send_instant(candidate, &window(9, 17, true, Tz::UTC));
        assert_eq!(resolved, Utc.with_ymd_and_hms(2025, 6, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_after_hours_next_day() {
        // Monday 18:00 → Tuesday 09:00
        let candidate = Utc.with_ymd_and_hms(2025, 6, 16, 18, 0, 0).unwrap();
        let resolved = next_send_instant(candidate, &window(9, 17, true, Tz::UTC));
        assert_eq!(resolved, Utc.with_ymd_and_hms(2025, 6, 17, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_friday_evening_skips_to_monday() {
        // Friday 2025-06-13 20:00 → Monday 2025-06-16 09:00
        let candidate = Utc.with_ymd_and_hms(2025, 6, 13, 20, 0, 0).unwrap();
        let resolved = next_send_instant(candidate, &window(9, 17, true, Tz::UTC));
        assert_eq!(resolved, Utc.with_ymd_and_hms(2025, 6, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_inside_window_unchanged() {
        let candidate = Utc.with_ymd_and_hms(2025, 6, 16, 13, 45, 10).unwrap();
        let resolved = next_send_instant(candidate, &window(9, 17, true, Tz::UTC));
        assert_eq!(resolved, candidate);
    }

    #[test]
    fn test_window_in_named_timezone() {
        // Saturday 2025-06-14 10:00 UTC is 06:00 in New York; the window
        // resolves to Monday 09:00 local = 13:00 UTC (EDT).
        let candidate = Utc.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap();
        let resolved = next_send_instant(
            candidate,
            &window(9, 17, true, chrono_tz::America::New_York),
        );
        assert_eq!(resolved, Utc.with_ymd_and_hms(2025, 6, 16, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_chain_gaps_within_bounds_and_no_trailing_delay() {
        let trigger = Utc.with_ymd_and_hms(2025, 6, 16, 10, 0, 0).unwrap();
        let win = SendWindow::always_open();
        let spacing = Spacing {
            use_delay: true,
            min_minutes: 4,
            max_minutes: 7,
        };
        let mut chain = ScheduleChain::new(trigger, &win, &spacing, StdRng::seed_from_u64(7));

        let instants: Vec<_> = (0..5).map(|_| chain.next_instant()).collect();
        assert_eq!(instants[0], trigger);
        // 5 recipients → exactly 4 gaps, each within [4, 7] minutes
        for pair in instants.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::minutes(4), "gap {gap} below minimum");
            assert!(gap <= Duration::minutes(7), "gap {gap} above maximum");
        }
    }

    #[test]
    fn test_chain_without_delay_is_flat() {
        let trigger = Utc.with_ymd_and_hms(2025, 6, 16, 10, 0, 0).unwrap();
        let win = SendWindow::always_open();
        let spacing = Spacing::none();
        let mut chain = ScheduleChain::new(trigger, &win, &spacing, StdRng::seed_from_u64(1));
        for _ in 0..4 {
            assert_eq!(chain.next_instant(), trigger);
        }
    }

    #[test]
    fn test_chain_is_non_decreasing_across_window_edges() {
        // Trigger late Friday; spacing pushes candidates past the window
        // close and the chain carries everyone to Monday in order.
        let trigger = Utc.with_ymd_and_hms(2025, 6, 13, 16, 50, 0).unwrap();
        let win = window(9, 17, true, Tz::UTC);
        let spacing = Spacing {
            use_delay: true,
            min_minutes: 4,
            max_minutes: 7,
        };
        let mut chain = ScheduleChain::new(trigger, &win, &spacing, StdRng::seed_from_u64(42));
        let instants: Vec<_> = (0..6).map(|_| chain.next_instant()).collect();
        for pair in instants.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        // At least one recipient crossed the weekend boundary
        assert!(instants.last().unwrap().weekday() == Weekday::Mon);
    }
}
