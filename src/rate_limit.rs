//! Rate-limit and quota policy (§4.7). Thin wrapper over the OLTP counters that applies the
//! fail-open/fail-closed posture: rate-limit coordinator unavailability fails open (a burst is
//! tolerable), quota coordinator unavailability fails closed (unbounded spend is not).

use chrono::Utc;
use uuid::Uuid;

use crate::config::{QuotaConfig, RateLimitConfig};
use crate::errors::AppError;
use crate::oltp_store::OltpStore;

/// `checkRateLimit` + `checkQuota`, invoked in that order after auth (§4.7).
pub fn check(
    oltp: &OltpStore,
    tenant_id: Uuid,
    batch_size: u64,
    rate_cfg: &RateLimitConfig,
    quota_cfg: &QuotaConfig,
) -> Result<(), AppError> {
    let now = Utc::now();

    if rate_cfg.enabled {
        match oltp.check_rate_limit(tenant_id, rate_cfg.requests_per_minute, now) {
            Ok(true) => {}
            Ok(false) => return Err(AppError::RateLimited),
            Err(e) if rate_cfg.fail_open => {
                tracing::warn!(error = %e, "rate limit coordinator unavailable, failing open");
            }
            Err(e) => return Err(e),
        }
    }

    if quota_cfg.enabled {
        match oltp.check_and_increment_quota(tenant_id, batch_size, quota_cfg.monthly_event_quota, now) {
            Ok(true) => {}
            Ok(false) => return Err(AppError::QuotaExceeded),
            Err(e) => return Err(e), // quota fails closed regardless of configuration
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_cfg(fail_open: bool) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            requests_per_minute: 1,
            fail_open,
        }
    }

    fn quota_cfg() -> QuotaConfig {
        QuotaConfig {
            enabled: true,
            monthly_event_quota: 10,
        }
    }

    #[test]
    fn rejects_over_rate_limit() {
        let oltp = OltpStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        assert!(check(&oltp, tenant, 1, &rate_cfg(true), &quota_cfg()).is_ok());
        let result = check(&oltp, tenant, 1, &rate_cfg(true), &quota_cfg());
        assert!(matches!(result, Err(AppError::RateLimited)));
    }

    #[test]
    fn rejects_over_quota() {
        let oltp = OltpStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let lenient_rate = RateLimitConfig {
            enabled: true,
            requests_per_minute: 1000,
            fail_open: true,
        };
        assert!(check(&oltp, tenant, 10, &lenient_rate, &quota_cfg()).is_ok());
        let result = check(&oltp, tenant, 1, &lenient_rate, &quota_cfg());
        assert!(matches!(result, Err(AppError::QuotaExceeded)));
    }

    #[test]
    fn disabled_checks_always_pass() {
        let oltp = OltpStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let disabled_rate = RateLimitConfig {
            enabled: false,
            requests_per_minute: 0,
            fail_open: false,
        };
        let disabled_quota = QuotaConfig {
            enabled: false,
            monthly_event_quota: 0,
        };
        assert!(check(&oltp, tenant, 1_000_000, &disabled_rate, &disabled_quota).is_ok());
    }
}
