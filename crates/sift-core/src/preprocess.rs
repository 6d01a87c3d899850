//! Preprocessing: raw samples to split partitions.

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::cache::Partition;
use crate::domain::params::PreprocConfig;
use crate::domain::sample::{SampleRecord, Split};

/// Produces the partitions cached under a dataset fingerprint.
///
/// Output must depend only on the fingerprint-participating fields of
/// `PreprocConfig` (and the raw data), otherwise the cache serves wrong data.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, config: &PreprocConfig) -> anyhow::Result<Vec<Partition>>;
}

/// Reads `SampleRecord` JSONL from `config.source` and, when dropout is active,
/// drops each train sample with probability `dropout_rate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropoutPreprocessor;

impl Preprocessor for DropoutPreprocessor {
    fn preprocess(&self, config: &PreprocConfig) -> anyhow::Result<Vec<Partition>> {
        let records = read_jsonl(config)?;
        let total = records.len();

        let kept: Vec<SampleRecord> = if config.dropout_active() {
            let mut rng = ChaCha8Rng::seed_from_u64(config.dropout_seed as u64);
            records
                .into_iter()
                .filter(|r| r.originating_split != Split::Train || rng.gen::<f64>() >= config.dropout_rate)
                .collect()
        } else {
            records
        };

        let partitions = Partition::group(kept);
        let train = partitions
            .iter()
            .find(|p| p.split == Split::Train)
            .map_or(0, |p| p.records.len());
        anyhow::ensure!(
            train > 0,
            "no training samples left in {} (read {total} records)",
            config.source.display()
        );

        debug!(
            dataset = %config.dataset,
            read = total,
            train,
            dropout = config.dropout_active(),
            "preprocessed"
        );
        Ok(partitions)
    }
}

fn read_jsonl(config: &PreprocConfig) -> anyhow::Result<Vec<SampleRecord>> {
    let path = &config.source;
    let file = File::open(path).with_context(|| format!("open source {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SampleRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed sample", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunParameters;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn source(train: usize, eval: usize, test: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let splits = [(Split::Train, train), (Split::Eval, eval), (Split::Test, test)];
        for (split, n) in splits {
            for i in 0..n {
                let record = SampleRecord::new(format!("{split}-{i}"), "a", split)
                    .with_features(vec![i as f32, 1.0]);
                writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
            }
        }
        writeln!(file).unwrap();
        file
    }

    fn config(file: &NamedTempFile, enabled: bool, rate: f64, seed: i64) -> PreprocConfig {
        let mut params = RunParameters::for_dataset("tuab").with_dropout(enabled, rate, seed);
        params.preproc.source = file.path().to_path_buf();
        params.preproc
    }

    fn count(parts: &[Partition], split: Split) -> usize {
        parts.iter().find(|p| p.split == split).unwrap().records.len()
    }

    #[test]
    fn test_without_dropout_keeps_everything() {
        let file = source(50, 10, 5);
        let parts = DropoutPreprocessor.preprocess(&config(&file, false, 0.9, 1)).unwrap();
        assert_eq!(count(&parts, Split::Train), 50);
        assert_eq!(count(&parts, Split::Eval), 10);
        assert_eq!(count(&parts, Split::Test), 5);
    }

    #[test]
    fn test_dropout_only_touches_train() {
        let file = source(400, 30, 20);
        let parts = DropoutPreprocessor.preprocess(&config(&file, true, 0.5, 12)).unwrap();
        let train = count(&parts, Split::Train);
        assert!((150..250).contains(&train), "kept {train}");
        assert_eq!(count(&parts, Split::Eval), 30);
        assert_eq!(count(&parts, Split::Test), 20);
    }

    #[test]
    fn test_dropout_is_seeded() {
        let file = source(200, 0, 0);
        let a = DropoutPreprocessor.preprocess(&config(&file, true, 0.3, 7)).unwrap();
        let b = DropoutPreprocessor.preprocess(&config(&file, true, 0.3, 7)).unwrap();
        let c = DropoutPreprocessor.preprocess(&config(&file, true, 0.3, 8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_malformed_line_reports_location() {
        let mut file = source(2, 0, 0);
        writeln!(file, "{{not json").unwrap();
        let err = DropoutPreprocessor
            .preprocess(&config(&file, false, 0.0, 0))
            .unwrap_err();
        assert!(format!("{err:#}").contains(":4: malformed sample"));
    }

    #[test]
    fn test_everything_dropped_is_an_error() {
        let file = source(20, 5, 0);
        assert!(DropoutPreprocessor.preprocess(&config(&file, true, 1.0, 3)).is_err());
    }
}
