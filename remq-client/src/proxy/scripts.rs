//! Server-side scripts used by queue operations that have no single command.

/// Removes up to `ARGV[1]` items from the head of `KEYS[1]` and returns them in order.
pub const DRAIN_LIMIT: &str = "local elemNum = math.min(ARGV[1], redis.call('llen', KEYS[1])) - 1; \
local vals = redis.call('lrange', KEYS[1], 0, elemNum); \
redis.call('ltrim', KEYS[1], elemNum + 1, -1); \
return vals";

/// Removes every item of `KEYS[1]` and returns them in order.
pub const DRAIN_ALL: &str = "local vals = redis.call('lrange', KEYS[1], 0, -1); \
redis.call('ltrim', KEYS[1], -1, 0); \
return vals";

/// Pops the head of the first non-empty list among `KEYS`, or returns nil.
pub const POLL_FIRST_FROM_ANY: &str = "for i, key in ipairs(KEYS) do \
local v = redis.call('lpop', key); \
if v ~= false then return v end \
end; \
return nil";
