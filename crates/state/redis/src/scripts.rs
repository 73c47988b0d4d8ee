//! Lua scripts executed atomically on the Redis server.

/// Set `KEYS[1]` to `ARGV[1]` only when neither the plain key nor the
/// versioned hash (`KEYS[2]`) exists. `ARGV[2]` is the TTL in milliseconds
/// (0 means no expiry). Returns 1 when the key was newly set.
pub const CHECK_AND_SET: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 or redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
";

/// Compare-and-swap on the versioned hash `KEYS[1]` (fields `v`, `ver`).
/// `ARGV[1]` is the expected version, `ARGV[2]` the new value, `ARGV[3]` the
/// TTL in milliseconds (0 means keep). Returns `{1, new_version}` on success
/// and `{0, current_version, current_value}` on conflict.
pub const COMPARE_AND_SWAP: &str = r"
local ver = tonumber(redis.call('HGET', KEYS[1], 'ver') or '0')
if ver ~= tonumber(ARGV[1]) then
  return {0, ver, redis.call('HGET', KEYS[1], 'v')}
end
local new_ver = ver + 1
redis.call('HSET', KEYS[1], 'v', ARGV[2], 'ver', new_ver)
if tonumber(ARGV[3]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return {1, new_ver}
";

/// Increment `KEYS[1]` by `ARGV[1]`, applying the TTL `ARGV[2]` (ms) only
/// when the counter was created by this call. Returns the new value.
pub const INCR_WITH_TTL: &str = r"
local val = redis.call('INCRBY', KEYS[1], ARGV[1])
if val == tonumber(ARGV[1]) and tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return val
";

/// Release the lock `KEYS[1]` only when still owned by `ARGV[1]`.
pub const RELEASE_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";
