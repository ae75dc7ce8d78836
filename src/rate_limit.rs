//! Rate limits for model API calls, parsed from strings like `"10/s"`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which a rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
    Hour,
}

impl RateLimitPeriod {
    /// How long is this period?
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self {
            RateLimitPeriod::Second => "s",
            RateLimitPeriod::Minute => "m",
            RateLimitPeriod::Hour => "h",
        };
        f.write_str(suffix)
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            "h" => Ok(RateLimitPeriod::Hour),
            _ => Err(anyhow!("unsupported rate limit period {:?} (expected s, m or h)", s)),
        }
    }
}

/// A rate limit for an API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period. Never zero.
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a [`RateLimiter`] for this rate limit.
    ///
    /// Requests are spread evenly across the period instead of being released
    /// in one burst at the start of each period, so two runs started back to
    /// back can't double the effective rate.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        let interval = self.per_period.to_duration() / self.max_requests as u32;
        RateLimiter::builder()
            .initial(1)
            .refill(1)
            .max(self.max_requests)
            .interval(interval.max(Duration::from_millis(1)))
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (count, period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected COUNT/PERIOD"))?;
            let max_requests = count.trim().parse::<usize>()?;
            if max_requests == 0 || max_requests > u32::MAX as usize {
                return Err(anyhow!("request count must be between 1 and {}", u32::MAX));
            }
            let per_period = period.trim().parse::<RateLimitPeriod>()?;
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("failed to parse rate limit {:?}", s))
    }
}
