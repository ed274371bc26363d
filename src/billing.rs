//! Coin ledger and subscription lifecycle rules.
//!
//! Every endpoint that needs to know whether a subscription is live, how many
//! coins still count toward a renewal, or which discount tier applies goes
//! through this module.

use chrono::{DateTime, Duration, Months, Utc};
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};

use crate::models::Role;

pub const CHECKOUT_REWARD_COINS: i64 = 3;
pub const REFERRAL_REWARD_COINS: i64 = 25;
pub const OWNER_REFERRAL_EARNING_INR: i64 = 5;
pub const SUBSCRIPTION_COST_COINS: i64 = 450;
pub const OWNER_SUBSCRIPTION_COST_INR: i64 = 99;
pub const REWARD_WINDOW_DAYS: i64 = 90;
pub const GRACE_PERIOD_DAYS: i64 = 3;
pub const RENEWAL_WARNING_DAYS: i64 = 10;
pub const VERIFICATION_TRIAL_DAYS: i64 = 30;
pub const REMINDER_OFFSETS_DAYS: [i64; 3] = [10, 3, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Checkout,
    Referral,
    ReferralBonus,
    Purchase,
    Subscription,
    Manual,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::Checkout => "checkout",
            RewardKind::Referral => "referral",
            RewardKind::ReferralBonus => "referral_bonus",
            RewardKind::Purchase => "purchase",
            RewardKind::Subscription => "subscription",
            RewardKind::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "checkout" => Some(RewardKind::Checkout),
            "referral" => Some(RewardKind::Referral),
            "referral_bonus" => Some(RewardKind::ReferralBonus),
            "purchase" => Some(RewardKind::Purchase),
            "subscription" => Some(RewardKind::Subscription),
            "manual" => Some(RewardKind::Manual),
            _ => None,
        }
    }
}

/// One signed movement in a user's coin ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerEntry {
    pub coins: i64,
    pub at: DateTime<Utc>,
}

/// Coins earned or spent inside the rolling reward window.
pub fn active_coins(entries: &[LedgerEntry], now: DateTime<Utc>) -> i64 {
    let cutoff = now - Duration::days(REWARD_WINDOW_DAYS);
    entries.iter().filter(|e| e.at >= cutoff).map(|e| e.coins).sum()
}

/// One calendar month ahead, clamped to the end of shorter months.
pub fn next_billing_date(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_add_months(Months::new(1)).unwrap_or(now + Duration::days(30))
}

pub fn trial_end(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(VERIFICATION_TRIAL_DAYS)
}

pub fn subscription_active(next_payment_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match next_payment_date {
        Some(next) => now < next + Duration::days(GRACE_PERIOD_DAYS),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    NotSubscribed,
    Active,
    RenewalDue { days_left: i64 },
    GracePeriod { days_left: i64 },
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::NotSubscribed => "not_subscribed",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::RenewalDue { .. } => "renewal_due",
            SubscriptionStatus::GracePeriod { .. } => "grace_period",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn days_left(&self) -> Option<i64> {
        match self {
            SubscriptionStatus::RenewalDue { days_left } | SubscriptionStatus::GracePeriod { days_left } => Some(*days_left),
            _ => None,
        }
    }

    pub fn to_document(&self) -> Document {
        let mut out = doc! { "status": self.as_str() };
        if let Some(days) = self.days_left() {
            out.insert("days_left", days);
        }
        out
    }
}

/// Where a user stands relative to their next renewal.
///
/// Customers are only warned when their active coins cannot cover the
/// renewal; owners pay in money and are always warned inside the window.
pub fn evaluate(
    next_payment_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    active_coins: i64,
    role: Role,
) -> SubscriptionStatus {
    let Some(next) = next_payment_date else {
        return SubscriptionStatus::NotSubscribed;
    };

    let grace_end = next + Duration::days(GRACE_PERIOD_DAYS);
    if now >= grace_end {
        return SubscriptionStatus::Expired;
    }
    if now > next {
        return SubscriptionStatus::GracePeriod { days_left: (grace_end - now).num_days() + 1 };
    }

    let days_until = (next - now).num_days();
    let needs_warning = match role {
        Role::Customer => active_coins < SUBSCRIPTION_COST_COINS,
        Role::Owner => true,
    };
    if days_until <= RENEWAL_WARNING_DAYS && needs_warning {
        SubscriptionStatus::RenewalDue { days_left: days_until + 1 }
    } else {
        SubscriptionStatus::Active
    }
}

/// Discount tier granted by account age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub phase: u8,
    pub coins_required: i64,
    pub discount_percent: u8,
}

impl Phase {
    pub fn to_document(&self, months_since_start: u32) -> Document {
        doc! {
            "phase": self.phase as i32,
            "coins_required": self.coins_required,
            "discount_percent": self.discount_percent as i32,
            "months_since_start": months_since_start as i64,
        }
    }
}

/// Whole calendar months between two instants, never negative.
pub fn months_between(start: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    if now <= start {
        return 0;
    }
    let mut months = 0u32;
    while let Some(next) = start.checked_add_months(Months::new(months + 1)) {
        if next > now {
            break;
        }
        months += 1;
    }
    months
}

pub fn phase_for(created_at: DateTime<Utc>, now: DateTime<Utc>) -> (Phase, u32) {
    let months = months_between(created_at, now);
    let phase = match months {
        0 => Phase { phase: 1, coins_required: SUBSCRIPTION_COST_COINS, discount_percent: 100 },
        1 => Phase { phase: 2, coins_required: SUBSCRIPTION_COST_COINS, discount_percent: 75 },
        2 => Phase { phase: 3, coins_required: SUBSCRIPTION_COST_COINS, discount_percent: 50 },
        3 => Phase { phase: 4, coins_required: SUBSCRIPTION_COST_COINS, discount_percent: 25 },
        _ => Phase { phase: 5, coins_required: 0, discount_percent: 0 },
    };
    (phase, months)
}

/// Whole days until `next_payment_date` if today is one of the reminder days.
pub fn reminder_due(next_payment_date: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
    let days = (next_payment_date.date_naive() - now.date_naive()).num_days();
    REMINDER_OFFSETS_DAYS.contains(&days).then_some(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn active_coins_ignore_entries_outside_window() {
        let now = at(2024, 6, 30);
        let entries = [
            LedgerEntry { coins: 25, at: now - Duration::days(91) },
            LedgerEntry { coins: 3, at: now - Duration::days(89) },
            LedgerEntry { coins: 450, at: now - Duration::days(1) },
            LedgerEntry { coins: -450, at: now },
        ];
        assert_eq!(active_coins(&entries, now), 3);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let now = at(2024, 6, 30);
        let entries = [LedgerEntry { coins: 10, at: now - Duration::days(REWARD_WINDOW_DAYS) }];
        assert_eq!(active_coins(&entries, now), 10);
    }

    #[test]
    fn next_billing_date_clamps_to_month_end() {
        assert_eq!(next_billing_date(at(2024, 1, 31)).date_naive(), at(2024, 2, 29).date_naive());
        assert_eq!(next_billing_date(at(2024, 3, 15)).date_naive(), at(2024, 4, 15).date_naive());
    }

    #[test]
    fn missing_date_is_not_subscribed() {
        assert_eq!(evaluate(None, at(2024, 1, 1), 0, Role::Customer), SubscriptionStatus::NotSubscribed);
    }

    #[test]
    fn far_renewal_is_active() {
        let now = at(2024, 1, 1);
        let status = evaluate(Some(now + Duration::days(20)), now, 0, Role::Customer);
        assert_eq!(status, SubscriptionStatus::Active);
    }

    #[test]
    fn customer_with_enough_coins_is_not_warned() {
        let now = at(2024, 1, 1);
        let next = Some(now + Duration::days(5));
        assert_eq!(evaluate(next, now, 450, Role::Customer), SubscriptionStatus::Active);
        assert_eq!(evaluate(next, now, 449, Role::Customer), SubscriptionStatus::RenewalDue { days_left: 6 });
    }

    #[test]
    fn owner_is_always_warned_inside_window() {
        let now = at(2024, 1, 1);
        let status = evaluate(Some(now + Duration::days(10)), now, 10_000, Role::Owner);
        assert_eq!(status, SubscriptionStatus::RenewalDue { days_left: 11 });
    }

    #[test]
    fn grace_period_then_expiry() {
        let next = at(2024, 1, 10);
        let status = evaluate(Some(next), next + Duration::hours(1), 0, Role::Customer);
        assert_eq!(status, SubscriptionStatus::GracePeriod { days_left: 3 });

        let status = evaluate(Some(next), next + Duration::days(2) + Duration::hours(1), 0, Role::Owner);
        assert_eq!(status, SubscriptionStatus::GracePeriod { days_left: 1 });

        let status = evaluate(Some(next), next + Duration::days(3), 0, Role::Customer);
        assert_eq!(status, SubscriptionStatus::Expired);
    }

    #[test]
    fn subscription_active_includes_grace() {
        let next = at(2024, 1, 10);
        assert!(subscription_active(Some(next), next + Duration::days(2)));
        assert!(!subscription_active(Some(next), next + Duration::days(3)));
        assert!(!subscription_active(None, next));
    }

    #[test]
    fn phases_follow_calendar_months() {
        let created = at(2024, 1, 31);
        assert_eq!(phase_for(created, at(2024, 2, 28)).0.phase, 1);
        assert_eq!(phase_for(created, at(2024, 2, 29)).0.phase, 2);
        assert_eq!(phase_for(created, at(2024, 4, 30)).0.phase, 4);
        let (late, months) = phase_for(created, at(2025, 1, 1));
        assert_eq!(late, Phase { phase: 5, coins_required: 0, discount_percent: 0 });
        assert_eq!(months, 11);
        assert_eq!(phase_for(created, at(2023, 12, 1)).1, 0);
    }

    #[test]
    fn reminders_fire_on_configured_offsets() {
        let now = at(2024, 5, 1);
        assert_eq!(reminder_due(at(2024, 5, 11), now), Some(10));
        assert_eq!(reminder_due(at(2024, 5, 4), now), Some(3));
        assert_eq!(reminder_due(at(2024, 5, 2), now), Some(1));
        assert_eq!(reminder_due(at(2024, 5, 5), now), None);
    }

    #[test]
    fn reward_kind_round_trips_through_str() {
        for kind in [RewardKind::Checkout, RewardKind::ReferralBonus, RewardKind::Subscription] {
            assert_eq!(RewardKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RewardKind::parse("bogus"), None);
    }
}
