//! Redis-backed admission counters.
//!
//! Admission and release each run as one Lua script, so the idempotency
//! reservation, the rate window and the usage counter move together. All keys
//! of a tenant share the `{tenant}` hash tag and land on one cluster slot.
//! Usage counters are scaled integers (`10^6` units per quantity unit,
//! rounded up) so comparisons inside the script are exact up to 2^53 scaled
//! units, about 9 * 10^9 quantity units per limit period.

use crate::models::{LimitDecision, LimitOutcome};
use crate::services::counters::{AdmissionOutcome, AdmissionRequest, CounterStore};
use crate::services::limits::next_reset;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use redis::{aio::ConnectionManager, Client, Script};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::time::Duration;
use tracing::{debug, info, instrument};

const USAGE_SCALE: u32 = 6;

static ADMIT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local existing = redis.call('GET', KEYS[1])
        if existing then
            return {'duplicate', existing}
        end

        local now = tonumber(ARGV[3])
        local window = tonumber(ARGV[4])
        local max_events = tonumber(ARGV[5])

        redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now - window)
        local count = redis.call('ZCARD', KEYS[2])
        if count >= max_events then
            local retry = window
            local oldest = redis.call('ZRANGE', KEYS[2], 0, 0, 'WITHSCORES')
            if oldest[2] then
                retry = tonumber(oldest[2]) + window - now
            end
            if retry < 1 then
                retry = 1
            end
            return {'rate_limited', string.format('%.0f', retry)}
        end

        local decision = 'none'
        local before = 0
        local after = 0
        local reset_at = -1
        if ARGV[7] == '1' then
            local incoming = tonumber(ARGV[8])
            local limit = tonumber(ARGV[9])
            local action = ARGV[10]
            local next_reset = tonumber(ARGV[11])
            local state = redis.call('HMGET', KEYS[3], 'usage', 'reset_at')
            before = tonumber(state[1]) or 0
            reset_at = tonumber(state[2])
            if reset_at == nil then
                reset_at = next_reset
            elseif reset_at >= 0 and now >= reset_at then
                before = 0
                reset_at = next_reset
            end
            after = before + incoming
            if after <= limit then
                decision = 'allow'
            elseif action == 'block' then
                return {'blocked', string.format('%.0f', before), string.format('%.0f', reset_at)}
            elseif action == 'allow_overage' then
                decision = 'allow_overage'
            else
                decision = 'notify'
            end
            redis.call('HSET', KEYS[3],
                'usage', string.format('%.0f', after),
                'reset_at', string.format('%.0f', reset_at))
        end

        redis.call('ZADD', KEYS[2], now, ARGV[6])
        redis.call('PEXPIRE', KEYS[2], window + 1000)
        redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
        return {
            'admitted',
            string.format('%.0f', max_events - count - 1),
            decision,
            string.format('%.0f', before),
            string.format('%.0f', after),
            string.format('%.0f', reset_at)
        }
        "#,
    )
});

static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('DEL', KEYS[1])
        redis.call('ZREM', KEYS[2], ARGV[2])
        if ARGV[4] == '1' then
            local usage = tonumber(redis.call('HGET', KEYS[3], 'usage')) or 0
            usage = usage - tonumber(ARGV[3])
            if usage < 0 then
                usage = 0
            end
            redis.call('HSET', KEYS[3], 'usage', string.format('%.0f', usage))
        end
        return 1
        "#,
    )
});

pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisCounterStore {
    #[instrument(skip(url))]
    pub async fn new(url: &str) -> Result<Self, AppError> {
        info!("Connecting to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            AppError::RedisError(e)
        })?;

        info!("Redis connection manager established");
        Ok(Self {
            manager,
            prefix: "billing".to_string(),
        })
    }

    fn keys(&self, request: &AdmissionRequest) -> [String; 3] {
        let tenant = request.tenant_id;
        let limit = match &request.limit {
            Some(check) => format!(
                "{}:{{{}}}:limit:{}:{}",
                self.prefix, tenant, check.limit.subscription_id, check.limit.metric_name
            ),
            None => format!("{}:{{{}}}:limit:none", self.prefix, tenant),
        };
        [
            format!(
                "{}:{{{}}}:idem:{}",
                self.prefix, tenant, request.idempotency_key
            ),
            format!("{}:{{{}}}:window", self.prefix, tenant),
            limit,
        ]
    }
}

fn to_scaled(quantity: Decimal) -> Result<i64, AppError> {
    quantity
        .checked_mul(Decimal::from(10_i64.pow(USAGE_SCALE)))
        .and_then(|scaled| scaled.ceil().to_i64())
        .ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Quantity {} is out of range for usage counters",
                quantity
            ))
        })
}

fn from_scaled(raw: &str) -> Result<Decimal, AppError> {
    raw.parse::<i64>()
        .map(|v| Decimal::new(v, USAGE_SCALE).normalize())
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Bad counter value {}: {}", raw, e)))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(raw: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    let ms: i64 = raw
        .parse()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Bad reset value {}: {}", raw, e)))?;
    if ms < 0 {
        return Ok(None);
    }
    Ok(Utc.timestamp_millis_opt(ms).single())
}

fn field<'a>(reply: &'a [String], index: usize) -> Result<&'a str, AppError> {
    reply.get(index).map(String::as_str).ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!(
            "Admission script reply missing field {}",
            index
        ))
    })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id))]
    async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionOutcome, AppError> {
        let [idem_key, window_key, limit_key] = self.keys(request);
        let now = millis(request.now);

        let mut invocation = ADMIT_SCRIPT.key(&idem_key);
        invocation
            .key(&window_key)
            .key(&limit_key)
            .arg(&request.reservation)
            .arg(request.idempotency_ttl.as_millis() as u64)
            .arg(now)
            .arg(request.rate.window.as_millis() as u64)
            .arg(request.rate.max_events)
            .arg(&request.token);

        match &request.limit {
            Some(check) => {
                let reset = next_reset(check.limit.period, request.now)
                    .map(millis)
                    .unwrap_or(-1);
                invocation
                    .arg("1")
                    .arg(to_scaled(check.quantity)?)
                    .arg(to_scaled(check.limit.limit_value)?)
                    .arg(check.limit.action_on_exceed.as_str())
                    .arg(reset);
            }
            None => {
                invocation.arg("0").arg(0).arg(0).arg("").arg(-1);
            }
        }

        let mut conn = self.manager.clone();
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;

        match field(&reply, 0)? {
            "duplicate" => Ok(AdmissionOutcome::Duplicate {
                reservation: field(&reply, 1)?.to_string(),
            }),
            "rate_limited" => {
                let retry_ms: u64 = field(&reply, 1)?.parse().unwrap_or(1);
                debug!(retry_ms = retry_ms, "Admission rate limited");
                Ok(AdmissionOutcome::RateLimited {
                    retry_after: Duration::from_millis(retry_ms),
                    remaining: 0,
                })
            }
            "blocked" => {
                let before = from_scaled(field(&reply, 1)?)?;
                Ok(AdmissionOutcome::LimitBlocked {
                    outcome: LimitOutcome {
                        decision: LimitDecision::Block,
                        usage_before: before,
                        usage_after: before,
                        reset_at: from_millis(field(&reply, 2)?)?,
                    },
                })
            }
            "admitted" => {
                let remaining: u64 = field(&reply, 1)?.parse().unwrap_or(0);
                let limit = match (field(&reply, 2)?, &request.limit) {
                    ("none", _) | (_, None) => None,
                    (decision, Some(check)) => {
                        let usage_before = from_scaled(field(&reply, 3)?)?;
                        let usage_after = from_scaled(field(&reply, 4)?)?;
                        let decision = match decision {
                            "allow_overage" => LimitDecision::AllowWithOverage {
                                overage: usage_after
                                    - usage_before.max(check.limit.limit_value),
                            },
                            "notify" => LimitDecision::Notify,
                            _ => LimitDecision::Allow,
                        };
                        Some(LimitOutcome {
                            decision,
                            usage_before,
                            usage_after,
                            reset_at: from_millis(field(&reply, 5)?)?,
                        })
                    }
                };
                Ok(AdmissionOutcome::Admitted { remaining, limit })
            }
            other => Err(AppError::InternalError(anyhow::anyhow!(
                "Unexpected admission script reply '{}'",
                other
            ))),
        }
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id))]
    async fn release(&self, request: &AdmissionRequest) -> Result<(), AppError> {
        let [idem_key, window_key, limit_key] = self.keys(request);
        let decrement = match &request.limit {
            Some(check) => to_scaled(check.quantity)?,
            None => 0,
        };

        let mut conn = self.manager.clone();
        let released: i64 = RELEASE_SCRIPT
            .key(&idem_key)
            .key(&window_key)
            .key(&limit_key)
            .arg(&request.reservation)
            .arg(&request.token)
            .arg(decrement)
            .arg(if request.limit.is_some() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        debug!(released = released == 1, "Admission released");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(AppError::RedisError)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
