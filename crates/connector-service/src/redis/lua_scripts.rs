//! Lua scripts for atomic lock and breaker operations.
//!
//! Each script runs as a single Redis command, so concurrent instances never
//! interleave a read-modify-write on the same key.

/// Release an operation lock only if the caller still holds it.
///
/// Arguments:
/// - KEYS[1]: Lock key (e.g., `connector:{provider}:lock:{meeting_id}`)
/// - ARGV[1]: Holder token
///
/// Returns:
/// - 1: Released
/// - 0: Not held by this token (expired or re-acquired by someone else)
pub const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Record an exhausted call failure and open the breaker at the threshold.
///
/// Arguments:
/// - KEYS[1]: Breaker hash (e.g., `connector:{provider}:breaker`)
/// - ARGV[1]: Failure threshold
/// - ARGV[2]: Current time in epoch milliseconds
/// - ARGV[3]: Failure reason
///
/// Returns `{state, consecutive_failures, opened_at_ms}` after the update,
/// with `opened_at_ms` as an empty string while Closed.
pub const RECORD_FAILURE: &str = r#"
local failures = redis.call('HINCRBY', KEYS[1], 'consecutive_failures', 1)
redis.call('HSET', KEYS[1], 'last_failure_reason', ARGV[3])

local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'open' then
    state = 'closed'
    if failures >= tonumber(ARGV[1]) then
        state = 'open'
        redis.call('HSET', KEYS[1], 'state', 'open', 'opened_at_ms', ARGV[2])
    else
        redis.call('HSET', KEYS[1], 'state', 'closed')
    end
end

local opened_at = redis.call('HGET', KEYS[1], 'opened_at_ms') or ''
return {state, failures, opened_at}
"#;

/// Clear the failure streak of a Closed breaker.
///
/// Arguments:
/// - KEYS[1]: Breaker hash
///
/// Returns:
/// - 1: Streak cleared
/// - 0: Breaker is Open, left untouched
pub const RECORD_SUCCESS: &str = r#"
if redis.call('HGET', KEYS[1], 'state') == 'open' then
    return 0
end
redis.call('HSET', KEYS[1], 'consecutive_failures', 0)
return 1
"#;

/// Force the breaker Closed, optionally conditioned on `opened_at`.
///
/// Arguments:
/// - KEYS[1]: Breaker hash
/// - ARGV[1]: Expected `opened_at_ms`, or empty string for an unconditional reset
/// - ARGV[2]: Current time in epoch milliseconds
/// - ARGV[3]: Reset source (`manual` or `auto`)
///
/// Returns:
/// - 1: An Open breaker was closed
/// - 0: Breaker was already Closed, or the condition did not match
pub const RESET_BREAKER: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if ARGV[1] ~= '' then
    if state ~= 'open' or redis.call('HGET', KEYS[1], 'opened_at_ms') ~= ARGV[1] then
        return 0
    end
end

redis.call('HSET', KEYS[1],
    'state', 'closed',
    'consecutive_failures', 0,
    'last_reset_at_ms', ARGV[2],
    'last_reset_source', ARGV[3])
redis.call('HDEL', KEYS[1], 'opened_at_ms')

if state == 'open' then
    return 1
end
return 0
"#;
