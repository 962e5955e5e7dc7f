use std::{convert::TryFrom, path::Path};

use anyhow::{anyhow, Result};
use aya::maps::{Map, MapData, PerCpuArray, PerCpuValues};
use serde::Serialize;

use crate::dataplane::{open_pinned, stats_pin};
use l4_redirect_common::{STAT_PASSED, STAT_REWRITE_FAILED, STAT_REWRITTEN};

/// Frames seen by the classifier, by outcome, summed over every CPU.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Outcomes {
    pub passed: u64,
    pub rewritten: u64,
    pub rewrite_failed: u64,
}

impl Outcomes {
    fn slot_mut(&mut self, slot: u32) -> Option<&mut u64> {
        match slot {
            STAT_PASSED => Some(&mut self.passed),
            STAT_REWRITTEN => Some(&mut self.rewritten),
            STAT_REWRITE_FAILED => Some(&mut self.rewrite_failed),
            _ => None,
        }
    }
}

/// Reads the outcome counters of a running dataplane from its pin.
pub fn read_stats(pin_dir: &Path) -> Result<Outcomes> {
    let map = Map::PerCpuArray(open_pinned(&stats_pin(pin_dir))?);
    let per_cpu = PerCpuArray::<MapData, u64>::try_from(map)
        .map_err(|e| anyhow!("stats map has unexpected layout: {e}"))?;

    let mut outcomes = Outcomes::default();
    for slot in 0..l4_redirect_common::STAT_SLOTS {
        let values: PerCpuValues<u64> = per_cpu
            .get(&slot, 0)
            .map_err(|e| anyhow!("failed to read stats slot {slot}: {e}"))?;
        if let Some(total) = outcomes.slot_mut(slot) {
            *total = sum_counters(values.iter());
        }
    }
    Ok(outcomes)
}

/// Per-CPU counters only ever grow; a total past `u64::MAX` is pinned there.
fn sum_counters<'a, I>(values: I) -> u64
where
    I: IntoIterator<Item = &'a u64>,
{
    values
        .into_iter()
        .fold(0u64, |total, v| total.saturating_add(*v))
}
