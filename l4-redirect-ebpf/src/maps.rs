// Maps shared with userspace. Names must match the constants in
// `l4_redirect_common`, which is how the agent finds and pins them.
//
// - policy: hash, (proto, __be16 port) -> (__be32 addr, __be16 port), 4096
//   entries unless the loader resizes it
// - stats: per-cpu array of u64 outcome counters, indexed by STAT_*

use aya_ebpf::macros::map;
use aya_ebpf::maps::{HashMap, PerCpuArray};
use l4_redirect_common::{PolicyKey, PolicyValue, POLICY_MAP_CAPACITY, STAT_SLOTS};

#[map(name = "l4_redirect_policy")]
pub static POLICY: HashMap<PolicyKey, PolicyValue> =
    HashMap::<PolicyKey, PolicyValue>::with_max_entries(POLICY_MAP_CAPACITY, 0);

#[map(name = "l4_redirect_stats")]
pub static STATS: PerCpuArray<u64> = PerCpuArray::<u64>::with_max_entries(STAT_SLOTS, 0);
