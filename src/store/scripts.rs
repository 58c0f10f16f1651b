//! Atomic script bodies executed by the shared store.
//!
//! Every script replies with a two-element array `{code, value}`: code `1`
//! grants, code `0` means the dimension is exceeded, and `value` carries the
//! remaining capacity for diagnostics. Each check-then-increment runs inside
//! one atomic execution so competing processes cannot interleave.

/// Bounded increment against the permit ceiling.
///
/// KEYS[1] = `{identity}:concurrency`
/// ARGV = permit_unit, max_permit, ttl_seconds
///
/// The TTL is refreshed on every grant so a crashed client cannot leak its
/// permits forever.
pub const CONCURRENCY_ACQUIRE: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local unit = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
if current + unit > max then
    return {0, max - current}
end
local total = redis.call('INCRBY', KEYS[1], unit)
redis.call('EXPIRE', KEYS[1], ttl)
return {1, max - total}
"#;

/// Decrement on release, deleting the key once it reaches zero.
///
/// KEYS[1] = `{identity}:concurrency`
/// ARGV = permit_unit
pub const CONCURRENCY_RELEASE: &str = r#"
local unit = tonumber(ARGV[1])
local total = redis.call('DECRBY', KEYS[1], unit)
if total <= 0 then
    redis.call('DEL', KEYS[1])
    total = 0
end
return {1, total}
"#;

/// Fixed one-second window keyed by the caller-supplied epoch second.
///
/// KEYS[1] = `{identity}:rate:{epoch_second}`
/// ARGV = rate_unit, max_rate
///
/// The key expires shortly after its second passes; a two-second TTL covers
/// clock skew between callers.
pub const RATE_ACQUIRE: &str = r#"
local unit = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current + unit > max then
    return {0, max - current}
end
local total = redis.call('INCRBY', KEYS[1], unit)
redis.call('EXPIRE', KEYS[1], 2)
return {1, max - total}
"#;

/// Windowed counter with a server-side expiry equal to the window length.
///
/// KEYS[1] = `{identity}:counter:{window_start_ms}`
/// ARGV = count_unit, max_count, interval_ms
pub const COUNTER_ACQUIRE: &str = r#"
local unit = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current + unit > max then
    return {0, max - current}
end
local total = redis.call('INCRBY', KEYS[1], unit)
redis.call('PEXPIRE', KEYS[1], interval)
return {1, max - total}
"#;
