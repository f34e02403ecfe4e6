use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};

use crate::config::defs::{PipelineError, COMPLEXITY_HEADERS, METRICS_CLASS_MARKER};


#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(u64),
    Float(f64),
    Pair(QualityCounts),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Pair(counts) => write!(f, "{} + {}", counts.high_quality, counts.low_quality),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}


/// Counts for reads passing and failing the QC/mapping-quality split of an alignment summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityCounts {
    pub high_quality: u64,
    pub low_quality: u64,
}

impl Serialize for QualityCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq([self.high_quality, self.low_quality])
    }
}


/// Picard-style duplicate marking metrics, keyed by lower-cased column header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DuplicationRecord {
    fields: BTreeMap<String, String>,
}

impl DuplicationRecord {
    pub fn get(&self, key: &str) -> Result<&str, PipelineError> {
        self.fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::MissingMetric(format!("duplication report has no `{}`", key)))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, PipelineError> {
        let raw = self.get(key)?;
        raw.trim()
            .parse()
            .map_err(|_| PipelineError::MalformedMetrics(format!("`{}` is not an integer: {:?}", key, raw)))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, PipelineError> {
        let raw = self.get(key)?;
        raw.trim()
            .parse()
            .map_err(|_| PipelineError::MalformedMetrics(format!("`{}` is not a number: {:?}", key, raw)))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> Vec<(&str, MetricValue)> {
        self.iter().map(|(k, v)| (k, MetricValue::Text(v.to_string()))).collect()
    }
}


/// Library complexity from the PBC report line:
/// TotalReadPairs, DistinctReadPairs, OneReadPair, TwoReadPairs,
/// NRF=Distinct/Total, PBC1=OnePair/Distinct, PBC2=OnePair/TwoPair
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComplexityRecord {
    #[serde(rename = "TotalReadPairs")]
    pub total_read_pairs: u64,
    #[serde(rename = "DistinctReadPairs")]
    pub distinct_read_pairs: u64,
    #[serde(rename = "OneReadPair")]
    pub one_read_pair: u64,
    #[serde(rename = "TwoReadPairs")]
    pub two_read_pairs: u64,
    #[serde(rename = "NRF")]
    pub nrf: f64,
    #[serde(rename = "PBC1")]
    pub pbc1: f64,
    #[serde(rename = "PBC2")]
    pub pbc2: f64,
}

impl ComplexityRecord {
    /// Values keyed by the report's column names, in column order.
    pub fn to_map(&self) -> Vec<(&'static str, MetricValue)> {
        let values = [
            MetricValue::Integer(self.total_read_pairs),
            MetricValue::Integer(self.distinct_read_pairs),
            MetricValue::Integer(self.one_read_pair),
            MetricValue::Integer(self.two_read_pairs),
            MetricValue::Float(self.nrf),
            MetricValue::Float(self.pbc1),
            MetricValue::Float(self.pbc2),
        ];
        COMPLEXITY_HEADERS.into_iter().zip(values).collect()
    }
}


/// Categories of a `samtools flagstat` style summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlignmentCategory {
    InTotal,
    Duplicates,
    Mapped,
    PairedInSequencing,
    Read1,
    Read2,
    ProperlyPaired,
    WithSelfMateMapped,
    Singletons,
    MateMappedDifferentChr,
    MateMappedDifferentChrHiQ,
}

impl AlignmentCategory {
    pub const ALL: [AlignmentCategory; 11] = [
        AlignmentCategory::InTotal,
        AlignmentCategory::Duplicates,
        AlignmentCategory::Mapped,
        AlignmentCategory::PairedInSequencing,
        AlignmentCategory::Read1,
        AlignmentCategory::Read2,
        AlignmentCategory::ProperlyPaired,
        AlignmentCategory::WithSelfMateMapped,
        AlignmentCategory::Singletons,
        AlignmentCategory::MateMappedDifferentChr,
        AlignmentCategory::MateMappedDifferentChrHiQ,
    ];

    pub fn key(self) -> &'static str {
        match self {
            AlignmentCategory::InTotal => "in_total",
            AlignmentCategory::Duplicates => "duplicates",
            AlignmentCategory::Mapped => "mapped",
            AlignmentCategory::PairedInSequencing => "paired_in_sequencing",
            AlignmentCategory::Read1 => "read1",
            AlignmentCategory::Read2 => "read2",
            AlignmentCategory::ProperlyPaired => "properly_paired",
            AlignmentCategory::WithSelfMateMapped => "with_self_mate_mapped",
            AlignmentCategory::Singletons => "singletons",
            AlignmentCategory::MateMappedDifferentChr => "mate_mapped_different_chr",
            AlignmentCategory::MateMappedDifferentChrHiQ => "mate_mapped_different_chr_hiQ",
        }
    }

    /// Regular expression locating the category's line; the counts precede the match.
    pub fn pattern(self) -> &'static str {
        match self {
            AlignmentCategory::InTotal => "in total",
            AlignmentCategory::Duplicates => "duplicates",
            AlignmentCategory::Mapped => "mapped",
            AlignmentCategory::PairedInSequencing => "paired in sequencing",
            AlignmentCategory::Read1 => "read1",
            AlignmentCategory::Read2 => "read2",
            AlignmentCategory::ProperlyPaired => "properly paired",
            AlignmentCategory::WithSelfMateMapped => "with itself and mate mapped",
            AlignmentCategory::Singletons => "singletons",
            // end of line, so the mapQ variant below does not match
            AlignmentCategory::MateMappedDifferentChr => "with mate mapped to a different chr$",
            AlignmentCategory::MateMappedDifferentChrHiQ => r"with mate mapped to a different chr \(mapQ>=5\)",
        }
    }

    fn regex(self) -> &'static Regex {
        &CATEGORY_REGEXES[self as usize]
    }
}

lazy_static! {
    static ref CATEGORY_REGEXES: Vec<Regex> = AlignmentCategory::ALL
        .iter()
        .map(|category| Regex::new(category.pattern()).expect("alignment category pattern is valid"))
        .collect();
}


/// Every category of an alignment summary; parsing fails unless all are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentSummaryRecord {
    counts: [QualityCounts; 11],
}

impl AlignmentSummaryRecord {
    pub fn get(&self, category: AlignmentCategory) -> QualityCounts {
        self.counts[category as usize]
    }

    pub fn to_map(&self) -> Vec<(&'static str, MetricValue)> {
        AlignmentCategory::ALL
            .iter()
            .map(|&category| (category.key(), MetricValue::Pair(self.get(category))))
            .collect()
    }
}


/// Parses a duplicate-marking metrics report.
///
/// # Arguments
///
/// * `text` - Whole report. The line after `## METRICS CLASS` is the header and the
///   one after that the single data row, both tab separated.
///
/// # Returns
/// Header -> value, with the leading library-name column dropped.
pub fn parse_duplication_report(text: &str) -> Result<DuplicationRecord, PipelineError> {
    let mut lines = text.lines();
    if !lines.by_ref().any(|line| line.starts_with(METRICS_CLASS_MARKER)) {
        return Err(PipelineError::MalformedMetrics(format!(
            "duplication report has no `{}` line",
            METRICS_CLASS_MARKER
        )));
    }
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::MalformedMetrics("duplication report ends before its header line".to_string()))?;
    let values = lines
        .next()
        .ok_or_else(|| PipelineError::MalformedMetrics("duplication report ends before its data line".to_string()))?;

    let header = header.to_lowercase();
    let headers: Vec<&str> = header.split('\t').collect();
    let metrics: Vec<&str> = values.split('\t').collect();
    if headers.len() != metrics.len() {
        return Err(PipelineError::MalformedMetrics(format!(
            "duplication report has {} header columns but {} values",
            headers.len(),
            metrics.len()
        )));
    }

    let fields = headers
        .into_iter()
        .zip(metrics)
        .skip(1)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(DuplicationRecord { fields })
}


/// Parses the single tab-separated line of a library complexity report.
pub fn parse_complexity_report(text: &str) -> Result<ComplexityRecord, PipelineError> {
    let line = text
        .lines()
        .next()
        .ok_or_else(|| PipelineError::MalformedMetrics("complexity report is empty".to_string()))?;
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != COMPLEXITY_HEADERS.len() {
        return Err(PipelineError::MalformedMetrics(format!(
            "complexity report has {} fields, expected {}",
            fields.len(),
            COMPLEXITY_HEADERS.len()
        )));
    }

    let count = |i: usize| -> Result<u64, PipelineError> {
        fields[i].trim().parse().map_err(|_| {
            PipelineError::MalformedMetrics(format!("{} is not a count: {:?}", COMPLEXITY_HEADERS[i], fields[i]))
        })
    };
    let ratio = |i: usize| -> Result<f64, PipelineError> {
        fields[i].trim().parse().map_err(|_| {
            PipelineError::MalformedMetrics(format!("{} is not a number: {:?}", COMPLEXITY_HEADERS[i], fields[i]))
        })
    };

    Ok(ComplexityRecord {
        total_read_pairs: count(0)?,
        distinct_read_pairs: count(1)?,
        one_read_pair: count(2)?,
        two_read_pairs: count(3)?,
        nrf: ratio(4)?,
        pbc1: ratio(5)?,
        pbc2: ratio(6)?,
    })
}


/// Parses an alignment summary made of `<hiq> + <lowq> <description>` lines.
/// Each category takes the first line its pattern matches.
pub fn parse_alignment_summary(text: &str) -> Result<AlignmentSummaryRecord, PipelineError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut counts = [QualityCounts::default(); 11];

    for category in AlignmentCategory::ALL {
        let regex = category.regex();
        let (line, found) = lines
            .iter()
            .find_map(|line| regex.find(line).map(|m| (*line, m)))
            .ok_or_else(|| {
                PipelineError::MalformedMetrics(format!(
                    "alignment summary has no line for {} (/{}/)",
                    category.key(),
                    category.pattern()
                ))
            })?;

        let prefix = &line[..found.start()];
        let (hiq, lowq) = prefix.split_once(" + ").ok_or_else(|| {
            PipelineError::MalformedMetrics(format!("{} line has no `hiq + lowq` counts: {:?}", category.key(), line))
        })?;
        let parse = |raw: &str| -> Result<u64, PipelineError> {
            raw.trim().parse().map_err(|_| {
                PipelineError::MalformedMetrics(format!("{} count is not an integer: {:?}", category.key(), line))
            })
        };
        counts[category as usize] = QualityCounts {
            high_quality: parse(hiq)?,
            low_quality: parse(lowq)?,
        };
    }

    Ok(AlignmentSummaryRecord { counts })
}


async fn read_report(path: &Path) -> Result<String, PipelineError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::IOError(format!("cannot read {}: {}", path.display(), e)))
}

pub async fn read_duplication_report(path: &Path) -> Result<DuplicationRecord, PipelineError> {
    parse_duplication_report(&read_report(path).await?)
}

pub async fn read_complexity_report(path: &Path) -> Result<ComplexityRecord, PipelineError> {
    parse_complexity_report(&read_report(path).await?)
}

pub async fn read_alignment_summary(path: &Path) -> Result<AlignmentSummaryRecord, PipelineError> {
    parse_alignment_summary(&read_report(path).await?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const DUP_REPORT: &str = "## htsjdk.samtools.metrics.StringHeader\n\
# MarkDuplicates INPUT=sample.filt.srt.bam OUTPUT=sample.dupmark.bam\n\
\n\
## METRICS CLASS\tpicard.sam.DuplicationMetrics\n\
LIBRARY\tUNPAIRED_READS_EXAMINED\tREAD_PAIRS_EXAMINED\tUNMAPPED_READS\tUNPAIRED_READ_DUPLICATES\tREAD_PAIR_DUPLICATES\tREAD_PAIR_OPTICAL_DUPLICATES\tPERCENT_DUPLICATION\tESTIMATED_LIBRARY_SIZE\n\
lib1\t120\t4500\t0\t10\t300\t2\t0.068132\t31044\n\
\n\
## HISTOGRAM\tjava.lang.Double\n\
BIN\tVALUE\n\
1.0\t1.0\n";

    const FLAGSTAT: &str = "1000 + 5 in total (QC-passed reads + QC-failed reads)\n\
0 + 0 secondary\n\
0 + 0 supplementary\n\
40 + 1 duplicates\n\
950 + 4 mapped (95.00% : 80.00%)\n\
1000 + 5 paired in sequencing\n\
500 + 3 read1\n\
500 + 2 read2\n\
900 + 2 properly paired (90.00% : 40.00%)\n\
920 + 3 with itself and mate mapped\n\
30 + 1 singletons (3.00% : 20.00%)\n\
12 + 0 with mate mapped to a different chr\n\
7 + 0 with mate mapped to a different chr (mapQ>=5)\n";

    #[test]
    fn test_parse_duplication_report() -> Result<()> {
        let dup = parse_duplication_report(DUP_REPORT)?;
        assert_eq!(dup.len(), 8);
        assert_eq!(dup.get("read_pairs_examined")?, "4500");
        assert_eq!(dup.get_u64("unpaired_read_duplicates")?, 10);
        assert!((dup.get_f64("percent_duplication")? - 0.068132).abs() < 1e-12);
        assert!(matches!(dup.get("library"), Err(PipelineError::MissingMetric(_))));
        Ok(())
    }

    #[test]
    fn test_duplication_report_without_marker() {
        let text = "LIBRARY\tREAD_PAIRS_EXAMINED\nlib1\t10\n";
        assert!(matches!(parse_duplication_report(text), Err(PipelineError::MalformedMetrics(_))));
    }

    #[test]
    fn test_duplication_report_truncated_or_ragged() {
        let truncated = "## METRICS CLASS\tpicard.sam.DuplicationMetrics\nLIBRARY\tREAD_PAIRS_EXAMINED\n";
        assert!(matches!(parse_duplication_report(truncated), Err(PipelineError::MalformedMetrics(_))));

        let ragged = "## METRICS CLASS\nLIBRARY\tA\tB\nlib1\t1\n";
        assert!(matches!(parse_duplication_report(ragged), Err(PipelineError::MalformedMetrics(_))));
    }

    #[test]
    fn test_duplication_typed_accessor_rejects_text() -> Result<()> {
        let dup = parse_duplication_report("## METRICS CLASS\nLIBRARY\tREAD_PAIRS_EXAMINED\nlib1\tmany\n")?;
        assert!(matches!(dup.get_u64("read_pairs_examined"), Err(PipelineError::MalformedMetrics(_))));
        Ok(())
    }

    #[test]
    fn test_parse_complexity_report() -> Result<()> {
        let pbc = parse_complexity_report("100\t80\t60\t20\t0.80\t0.75\t3.00\n")?;
        assert_eq!(pbc, ComplexityRecord {
            total_read_pairs: 100,
            distinct_read_pairs: 80,
            one_read_pair: 60,
            two_read_pairs: 20,
            nrf: 0.80,
            pbc1: 0.75,
            pbc2: 3.00,
        });
        Ok(())
    }

    #[test]
    fn test_complexity_report_keys_in_order() -> Result<()> {
        let values = [5123u64, 4999, 4870, 120];
        let ratios = [0.975796, 0.974195, 40.583333];
        let line = format!(
            "{}\t{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}\n",
            values[0], values[1], values[2], values[3], ratios[0], ratios[1], ratios[2]
        );
        let map = parse_complexity_report(&line)?.to_map();
        let keys: Vec<&str> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, COMPLEXITY_HEADERS.to_vec());
        for (i, v) in values.iter().enumerate() {
            assert_eq!(map[i].1, MetricValue::Integer(*v));
        }
        for (i, r) in ratios.iter().enumerate() {
            assert_eq!(map[4 + i].1, MetricValue::Float(*r));
        }
        Ok(())
    }

    #[test]
    fn test_complexity_report_field_count() {
        assert!(matches!(parse_complexity_report("100\t80\t60\n"), Err(PipelineError::MalformedMetrics(_))));
        assert!(matches!(parse_complexity_report("1\t1\t1\t1\t1\t1\t1\t1\n"), Err(PipelineError::MalformedMetrics(_))));
        assert!(matches!(parse_complexity_report(""), Err(PipelineError::MalformedMetrics(_))));
        assert!(matches!(parse_complexity_report("a\t80\t60\t20\t0.8\t0.7\t3\n"), Err(PipelineError::MalformedMetrics(_))));
    }

    #[test]
    fn test_parse_alignment_summary() -> Result<()> {
        let summary = parse_alignment_summary(FLAGSTAT)?;
        let expect = [
            (AlignmentCategory::InTotal, 1000, 5),
            (AlignmentCategory::Duplicates, 40, 1),
            (AlignmentCategory::Mapped, 950, 4),
            (AlignmentCategory::PairedInSequencing, 1000, 5),
            (AlignmentCategory::Read1, 500, 3),
            (AlignmentCategory::Read2, 500, 2),
            (AlignmentCategory::ProperlyPaired, 900, 2),
            (AlignmentCategory::WithSelfMateMapped, 920, 3),
            (AlignmentCategory::Singletons, 30, 1),
            (AlignmentCategory::MateMappedDifferentChr, 12, 0),
            (AlignmentCategory::MateMappedDifferentChrHiQ, 7, 0),
        ];
        for (category, hiq, lowq) in expect {
            assert_eq!(
                summary.get(category),
                QualityCounts { high_quality: hiq, low_quality: lowq },
                "{}",
                category.key()
            );
        }
        assert_eq!(summary.to_map().len(), 11);
        Ok(())
    }

    #[test]
    fn test_alignment_summary_missing_category() {
        let without_singletons: String = FLAGSTAT
            .lines()
            .filter(|l| !l.contains("singletons"))
            .map(|l| format!("{}\n", l))
            .collect();
        match parse_alignment_summary(&without_singletons) {
            Err(PipelineError::MalformedMetrics(msg)) => assert!(msg.contains("singletons"), "{}", msg),
            other => panic!("Expected MalformedMetrics, got {:?}", other),
        }
    }

    #[test]
    fn test_alignment_summary_bad_counts() {
        let broken = FLAGSTAT.replace("40 + 1 duplicates", "forty duplicates");
        assert!(matches!(parse_alignment_summary(&broken), Err(PipelineError::MalformedMetrics(_))));
    }

    #[test]
    fn test_quality_counts_serialize_as_pair() -> Result<()> {
        let json = serde_json::to_string(&MetricValue::Pair(QualityCounts { high_quality: 3, low_quality: 1 }))?;
        assert_eq!(json, "[3,1]");
        Ok(())
    }

    #[tokio::test]
    async fn test_read_reports_from_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sample.flagstat.qc");
        tokio::fs::write(&path, FLAGSTAT).await?;
        let summary = read_alignment_summary(&path).await?;
        assert_eq!(summary.get(AlignmentCategory::InTotal).high_quality, 1000);

        let missing = read_complexity_report(&dir.path().join("absent.pbc.qc")).await;
        assert!(matches!(missing, Err(PipelineError::IOError(_))));
        Ok(())
    }
}
