//! Fixed point simulation time
//!
//! [SimTime] is the global clock value every scheduler decision is ordered
//! by. It carries whole seconds plus an attosecond fraction so that devices
//! clocked in the hundreds of megahertz still have many representable
//! instants between two of their cycles.

use num::rational::Ratio;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Clock rates are exact rationals, in ticks per second
///
/// Fractional clocks (NTSC color burst dividers and friends) are the norm in
/// real machines, so an integer hertz type is not enough
pub type Frequency = Ratio<u64>;

/// Subdivisions of a second
pub const ATTOS_PER_SECOND: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("value is not representable as a simulation time")]
    Unrepresentable,
}

/// A point on (or duration along) the simulation timeline
///
/// Ordering is lexicographic over (seconds, attos), which matches numeric
/// ordering because `attos` is always normalized below [ATTOS_PER_SECOND].
/// Subtraction floors at [SimTime::ZERO]; simulation time is never negative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SimTime {
    seconds: u64,
    attos: u64,
}

impl SimTime {
    pub const ZERO: Self = Self {
        seconds: 0,
        attos: 0,
    };

    /// Sentinel meaning "no pending event", greater than every finite time
    ///
    /// Absorbing under arithmetic
    pub const NEVER: Self = Self {
        seconds: u64::MAX,
        attos: 0,
    };

    /// Build a time, normalizing attosecond carry
    pub const fn new(seconds: u64, attos: u64) -> Self {
        let (seconds, attos) = if attos >= ATTOS_PER_SECOND {
            (
                seconds.saturating_add(attos / ATTOS_PER_SECOND),
                attos % ATTOS_PER_SECOND,
            )
        } else {
            (seconds, attos)
        };

        if seconds == u64::MAX {
            return Self::NEVER;
        }

        Self { seconds, attos }
    }

    #[inline]
    pub const fn is_never(&self) -> bool {
        self.seconds == u64::MAX
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.seconds == 0 && self.attos == 0
    }

    pub const fn from_secs(seconds: u64) -> Self {
        Self::new(seconds, 0)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::new(millis / 1_000, (millis % 1_000) * (ATTOS_PER_SECOND / 1_000))
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self::new(
            micros / 1_000_000,
            (micros % 1_000_000) * (ATTOS_PER_SECOND / 1_000_000),
        )
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self::new(
            nanos / 1_000_000_000,
            (nanos % 1_000_000_000) * (ATTOS_PER_SECOND / 1_000_000_000),
        )
    }

    pub fn from_secs_f64(seconds: f64) -> Result<Self, TimeError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(TimeError::Unrepresentable);
        }

        if seconds >= u64::MAX as f64 {
            return Ok(Self::NEVER);
        }

        let whole = seconds.trunc() as u64;
        let attos = (seconds.fract() * ATTOS_PER_SECOND as f64) as u64;

        Ok(Self::new(whole, attos))
    }

    pub const fn seconds(&self) -> u64 {
        self.seconds
    }

    pub const fn attos(&self) -> u64 {
        self.attos
    }

    /// Addition saturating to [SimTime::NEVER]
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        if self.is_never() || rhs.is_never() {
            return Self::NEVER;
        }

        let attos = self.attos + rhs.attos;
        let carry = (attos >= ATTOS_PER_SECOND) as u64;

        match self.seconds.checked_add(rhs.seconds) {
            Some(seconds) => match seconds.checked_add(carry) {
                Some(seconds) if seconds != u64::MAX => Self {
                    seconds,
                    attos: attos % ATTOS_PER_SECOND,
                },
                _ => Self::NEVER,
            },
            None => Self::NEVER,
        }
    }

    /// Subtraction flooring at [SimTime::ZERO]
    ///
    /// [SimTime::NEVER] minus anything finite stays [SimTime::NEVER]
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        if rhs.is_never() {
            return Self::ZERO;
        }

        if self.is_never() {
            return Self::NEVER;
        }

        if self.seconds < rhs.seconds
            || (self.seconds == rhs.seconds && self.attos < rhs.attos)
        {
            return Self::ZERO;
        }

        let (seconds, attos) = if self.attos >= rhs.attos {
            (self.seconds - rhs.seconds, self.attos - rhs.attos)
        } else {
            (
                self.seconds - rhs.seconds - 1,
                ATTOS_PER_SECOND - (rhs.attos - self.attos),
            )
        };

        Self { seconds, attos }
    }

    /// How many whole ticks of `clock` fit in this duration (floor)
    ///
    /// Floor rounding is load bearing: periodic re-arming depends on the
    /// conversion never crediting a tick that has not fully elapsed
    pub fn to_ticks(&self, clock: Frequency) -> u64 {
        let (ticks, _) = self.tick_parts(clock);
        ticks
    }

    /// Like [Self::to_ticks] but rounding any partial tick up
    pub fn to_ticks_ceil(&self, clock: Frequency) -> u64 {
        let (ticks, remainder) = self.tick_parts(clock);
        ticks.saturating_add((remainder != 0) as u64)
    }

    fn tick_parts(&self, clock: Frequency) -> (u64, u128) {
        if self.is_never() {
            return (u64::MAX, 0);
        }

        let numer = *clock.numer() as u128;
        let denom = *clock.denom() as u128;
        let attos_per_second = ATTOS_PER_SECOND as u128;

        // Split so no intermediate exceeds u128: the whole seconds part
        // divides first and only its remainder joins the attosecond part
        let second_ticks = (self.seconds as u128).saturating_mul(numer);
        let whole = second_ticks / denom;
        let carry = second_ticks % denom;

        let fraction_numer = carry * attos_per_second + self.attos as u128 * numer;
        let fraction_denom = attos_per_second * denom;

        let ticks = whole + fraction_numer / fraction_denom;
        let remainder = fraction_numer % fraction_denom;

        (ticks.try_into().unwrap_or(u64::MAX), remainder)
    }

    /// The instant `ticks` whole ticks of `clock` after zero (floor)
    pub fn from_ticks(ticks: u64, clock: Frequency) -> Self {
        let numer = *clock.numer() as u128;
        let denom = *clock.denom() as u128;

        let scaled = ticks as u128 * denom;
        let seconds = scaled / numer;
        let carry = scaled % numer;
        let attos = carry * ATTOS_PER_SECOND as u128 / numer;

        Self::new(
            seconds.try_into().unwrap_or(u64::MAX),
            attos.try_into().unwrap_or(0),
        )
    }

    /// Duration of a single tick of `clock`
    pub fn period_of(clock: Frequency) -> Self {
        Self::from_ticks(1, clock)
    }
}

impl Add for SimTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl AddAssign for SimTime {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for SimTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for SimTime {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.saturating_sub(rhs);
    }
}

impl Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{}.{:018}s", self.seconds, self.attos)
        }
    }
}
