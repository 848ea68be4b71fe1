//! Integer-precision ownership: share quantities, holders and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::{
    fmt,
    ops::{Add, Neg, Sub},
};

use super::ledger::{EarnSources, LedgerAction, SourceKind};

/// A fixed-decimal share count with two fractional digits, stored as an
/// integer number of hundredths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Shares(i64);

impl Shares {
    pub const ZERO: Shares = Shares(0);
    const SCALE: i64 = 100;

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Shares(hundredths)
    }

    pub const fn from_whole(shares: i64) -> Self {
        Shares(shares * Self::SCALE)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `total_shares × percentage ÷ 100`, rounded to the nearest hundredth.
    pub fn from_percentage(total_shares: i64, percentage: f64) -> Self {
        // hundredths = total × 100 × pct ÷ 100
        Shares((total_shares as f64 * percentage).round() as i64)
    }

    /// `100 × shares ÷ total_shares`, full float precision.
    pub fn percentage_of(self, total_shares: i64) -> f64 {
        if total_shares <= 0 {
            return 0.0;
        }
        // pct = 100 × (h ÷ 100) ÷ total
        self.0 as f64 / total_shares as f64
    }

    /// Percentage of `total_shares`, banker's-rounded to two decimals using
    /// exact integer arithmetic.
    pub fn display_percentage(self, total_shares: i64) -> f64 {
        if total_shares <= 0 {
            return 0.0;
        }
        // percentage in hundredths of a percent = h × 100 ÷ total
        let numerator = self.0 as i128 * 100;
        let denominator = total_shares as i128;
        round_half_even(numerator, denominator) as f64 / 100.0
    }

    /// Shares holders may collectively own once `platform_fee` is reserved.
    pub fn distributable(total_shares: i64, platform_fee: f64) -> Self {
        Shares((total_shares as f64 * (100.0 - platform_fee)).round() as i64)
    }

    pub fn total(total_shares: i64) -> Self {
        Shares::from_whole(total_shares)
    }
}

fn round_half_even(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator.div_euclid(denominator);
    let remainder = numerator.rem_euclid(denominator);
    let twice = remainder * 2;
    if twice > denominator || (twice == denominator && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

impl Add for Shares {
    type Output = Shares;
    fn add(self, rhs: Shares) -> Shares {
        Shares(self.0 + rhs.0)
    }
}

impl Sub for Shares {
    type Output = Shares;
    fn sub(self, rhs: Shares) -> Shares {
        Shares(self.0 - rhs.0)
    }
}

impl Neg for Shares {
    type Output = Shares;
    fn neg(self) -> Shares {
        Shares(-self.0)
    }
}

impl std::iter::Sum for Shares {
    fn sum<I: Iterator<Item = Shares>>(iter: I) -> Shares {
        iter.fold(Shares::ZERO, Add::add)
    }
}

impl fmt::Display for Shares {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Shares {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Shares {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Ok(Shares((value * Shares::SCALE as f64).round() as i64))
    }
}

/// A (project, user) share balance.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ShareHolder {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub shares: Shares,
    pub earned_from: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShareHolder {
    pub fn sources(&self) -> EarnSources {
        EarnSources::parse(&self.earned_from)
    }
}

/// Immutable record of one change to a share balance.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ShareEvent {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub action: LedgerAction,
    pub shares_change: Shares,
    pub shares_before: Shares,
    pub shares_after: Shares,
    pub percentage_before: f64,
    pub percentage_after: f64,
    pub reason: String,
    pub source_type: SourceKind,
    pub source_id: Option<i64>,
    pub changed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}
