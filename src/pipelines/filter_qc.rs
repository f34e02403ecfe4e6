use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info};
use serde::Serialize;
use crate::config::defs::{
    PipelineError, RunConfig, DEFAULT_OUT_PREFIX, QC_JSON_SUFFIX,
    DUP_PERCENT_DUPLICATION, DUP_READ_PAIRS_EXAMINED, DUP_READ_PAIR_DUPLICATES,
    DUP_UNPAIRED_READS_EXAMINED, DUP_UNPAIRED_READ_DUPLICATES,
};
use crate::utils::file::{report_prefix, resolve_path};
use crate::utils::metrics::{
    read_alignment_summary, read_complexity_report, read_duplication_report,
    AlignmentCategory, AlignmentSummaryRecord, ComplexityRecord, DuplicationRecord, MetricValue,
};
use crate::utils::storage::{LocalStore, ObjectStore};


/// QC values reported for a filtered alignment set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QcSummary {
    pub paired_end: bool,
    pub n_reads_input: u64,
    pub picard_read_pairs_examined: u64,
    pub picard_unpaired_reads_examined: u64,
    pub picard_read_pair_duplicates: u64,
    pub picard_unpaired_read_duplicates: u64,
    pub useable_fragments: u64,
    #[serde(rename = "NRF")]
    pub nrf: f64,
    #[serde(rename = "PBC1")]
    pub pbc1: f64,
    #[serde(rename = "PBC2")]
    pub pbc2: f64,
    pub duplicate_fraction: f64,
}

impl QcSummary {
    /// Combines the parsed reports.
    ///
    /// # Arguments
    ///
    /// * `dup` - Duplicate marking metrics.
    /// * `pbc` - Library complexity.
    /// * `final_mapstats` - Alignment summary after filtering.
    /// * `initial_mapstats` - Alignment summary of the raw input; when absent the
    ///   input read count falls back to `final_mapstats`.
    /// * `paired_end` - Fragments are counted as pairs.
    ///
    /// # Returns
    /// The summary, or `MissingMetric` if the duplication report lacks a needed column.
    pub fn build(
        dup: &DuplicationRecord,
        pbc: &ComplexityRecord,
        final_mapstats: &AlignmentSummaryRecord,
        initial_mapstats: Option<&AlignmentSummaryRecord>,
        paired_end: bool,
    ) -> Result<Self, PipelineError> {
        let final_total = final_mapstats.get(AlignmentCategory::InTotal).high_quality;
        let n_reads_input = initial_mapstats
            .unwrap_or(final_mapstats)
            .get(AlignmentCategory::InTotal)
            .high_quality;
        let useable_fragments = if paired_end { final_total / 2 } else { final_total };

        Ok(QcSummary {
            paired_end,
            n_reads_input,
            picard_read_pairs_examined: dup.get_u64(DUP_READ_PAIRS_EXAMINED)?,
            picard_unpaired_reads_examined: dup.get_u64(DUP_UNPAIRED_READS_EXAMINED)?,
            picard_read_pair_duplicates: dup.get_u64(DUP_READ_PAIR_DUPLICATES)?,
            picard_unpaired_read_duplicates: dup.get_u64(DUP_UNPAIRED_READ_DUPLICATES)?,
            useable_fragments,
            nrf: pbc.nrf,
            pbc1: pbc.pbc1,
            pbc2: pbc.pbc2,
            duplicate_fraction: dup.get_f64(DUP_PERCENT_DUPLICATION)?,
        })
    }
}


fn required<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str, PipelineError> {
    value
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig(format!("filter_qc requires --{}", flag)))
}

fn log_record(name: &str, map: &[(&str, MetricValue)]) {
    debug!("{}:", name);
    for (key, value) in map {
        debug!("  {}: {}", key, value);
    }
}


/// Parses the duplicate, complexity and alignment reports of one sample and writes
/// `<prefix>.qc.json` to the output directory.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    println!("\n-------------\n Filter QC\n-------------\n");
    let args = &config.args;

    let dup_id = required(&args.dup_report, "dup")?;
    let pbc_id = required(&args.pbc_report, "pbc")?;
    let flagstat_id = required(&args.flagstat_report, "flagstat")?;

    let store_root = match &args.store {
        Some(dir) => resolve_path(&PathBuf::from(dir), &config.cwd),
        None => config.cwd.clone(),
    };
    let store = LocalStore::new(store_root, config.out_dir.clone());

    let dup_path = store.fetch(dup_id).await?;
    let pbc_path = store.fetch(pbc_id).await?;
    let final_path = store.fetch(flagstat_id).await?;
    let initial_path = match &args.initial_flagstat_report {
        Some(id) => Some(store.fetch(id).await?),
        None => None,
    };

    info!("Calculating QC metrics");
    let dup_qc = read_duplication_report(&dup_path).await?;
    let pbc_qc = read_complexity_report(&pbc_path).await?;
    let final_mapstats_qc = read_alignment_summary(&final_path).await?;
    let initial_mapstats_qc = match &initial_path {
        Some(path) => Some(read_alignment_summary(path).await?),
        None => None,
    };

    log_record("dup_qc", &dup_qc.to_map());
    log_record("pbc_qc", &pbc_qc.to_map());
    log_record("final_mapstats_qc", &final_mapstats_qc.to_map());
    if let Some(initial) = &initial_mapstats_qc {
        log_record("initial_mapstats_qc", &initial.to_map());
    }

    let summary = QcSummary::build(
        &dup_qc,
        &pbc_qc,
        &final_mapstats_qc,
        initial_mapstats_qc.as_ref(),
        args.paired_end,
    )?;

    let prefix = match &args.prefix {
        Some(prefix) => prefix.clone(),
        None => match Path::new(flagstat_id).file_name() {
            Some(name) => report_prefix(&name.to_string_lossy()),
            None => DEFAULT_OUT_PREFIX.to_string(),
        },
    };
    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| PipelineError::Other(format!("cannot serialize QC summary: {}", e)))?;
    let summary_path = config.out_dir.join(format!("{}.{}", prefix, QC_JSON_SUFFIX));
    tokio::fs::write(&summary_path, format!("{}\n", json)).await?;
    let link = store.upload(&summary_path).await?;

    info!("QC summary written to {}", link.path.display());
    println!("{}", json);
    Ok(())
}
