//! Per-species planted/survived totals and survival rates.

use std::collections::BTreeMap;

use sdp_core::columns::{self, leaf_name};
use sdp_core::{SpeciesSummary, Table};
use tracing::debug;

/// Column positions of one species in a specific table. A species asked in
/// more than one group has several columns per side, and they are summed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeciesColumns {
    pub species: String,
    pub planted: Vec<usize>,
    pub survived: Vec<usize>,
}

/// Species discovered once from a table's column names and reused by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeciesSchema {
    entries: Vec<SpeciesColumns>,
}

impl SpeciesSchema {
    /// Species need a `planted_` column; missing `survived_` columns count as zero.
    pub fn discover(table: &Table) -> Self {
        let mut found: BTreeMap<String, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
        for (idx, name) in table.columns().iter().enumerate() {
            let leaf = leaf_name(name);
            let (species, planted_side) = if let Some(s) = leaf.strip_prefix(columns::PLANTED_PREFIX) {
                (s, true)
            } else if let Some(s) = leaf.strip_prefix(columns::SURVIVED_PREFIX) {
                (s, false)
            } else {
                continue;
            };
            if species.is_empty() {
                continue;
            }
            let slot = found.entry(species.to_string()).or_default();
            let target = if planted_side { &mut slot.0 } else { &mut slot.1 };
            if !target.is_empty() {
                debug!(column = %name, species, "species column repeated across groups; summing");
            }
            target.push(idx);
        }

        let entries = found
            .into_iter()
            .filter(|(_, (planted, _))| !planted.is_empty())
            .map(|(species, (planted, survived))| SpeciesColumns {
                species,
                planted,
                survived,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[SpeciesColumns] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Totals over `table`, which must have the column layout this schema was discovered from.
    pub fn aggregate(&self, table: &Table) -> Vec<SpeciesSummary> {
        let sum = |indices: &[usize]| -> f64 {
            indices
                .iter()
                .flat_map(|&idx| table.column_values(idx))
                .filter_map(|v| v.as_f64())
                .sum()
        };

        let mut out = self
            .entries
            .iter()
            .map(|entry| {
                let planted = sum(&entry.planted);
                let survived = sum(&entry.survived);
                species_summary(&entry.species, planted, survived)
            })
            .filter(|s| s.planted > 0.0)
            .collect::<Vec<_>>();

        out.sort_by(|a, b| {
            b.survival_rate
                .total_cmp(&a.survival_rate)
                .then_with(|| a.species.cmp(&b.species))
        });
        out
    }
}

/// Rates are 0 when nothing was planted.
pub fn species_summary(species: &str, planted: f64, survived: f64) -> SpeciesSummary {
    let loss_count = planted - survived;
    let (survival_rate, loss_rate) = if planted == 0.0 {
        (0.0, 0.0)
    } else {
        (survived / planted * 100.0, loss_count / planted * 100.0)
    };
    SpeciesSummary {
        species: species.to_string(),
        planted,
        survived,
        survival_rate,
        loss_count,
        loss_rate,
    }
}

pub fn aggregate_species(completed: &Table) -> Vec<SpeciesSummary> {
    SpeciesSchema::discover(completed).aggregate(completed)
}
