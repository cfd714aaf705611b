//! Composite progress for upload jobs.
//!
//! Compression owns 0..30, the chunked transfers share 30..95 equally
//! per variant, and the catalog commit closes 95..100. The figure is
//! recomputed from stage fractions; callers clamp against the previous
//! value so the reported number never moves backwards.

/// Portion of the bar owned by compression.
pub const COMPRESS_SHARE: f64 = 30.0;
/// Where the transfer stage tops out; the commit owns the rest.
pub const TRANSFER_CEILING: f64 = 95.0;

#[derive(Debug, Clone, PartialEq)]
pub struct StageProgress {
    /// Compression fraction, 0.0 to 1.0.
    pub compress: f64,
    /// Per-variant transfer fractions, 0.0 to 1.0 each.
    pub transfers: Vec<f64>,
    /// Set once the catalog accepted the final URLs.
    pub committed: bool,
}

impl StageProgress {
    pub fn new(variant_count: usize) -> Self {
        Self {
            compress: 0.0,
            transfers: vec![0.0; variant_count],
            committed: false,
        }
    }
}

pub fn composite_percent(stage: &StageProgress) -> u8 {
    if stage.committed {
        return 100;
    }
    let mut overall = COMPRESS_SHARE * stage.compress.clamp(0.0, 1.0);
    if !stage.transfers.is_empty() {
        let share = (TRANSFER_CEILING - COMPRESS_SHARE) / stage.transfers.len() as f64;
        for fraction in &stage.transfers {
            overall += share * fraction.clamp(0.0, 1.0);
        }
    }
    overall.round().clamp(0.0, TRANSFER_CEILING) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_job_reports_zero() {
        let stage = StageProgress::new(3);
        assert_eq!(composite_percent(&stage), 0);
    }

    #[test]
    fn compression_owns_the_first_band() {
        let mut stage = StageProgress::new(3);
        stage.compress = 0.5;
        assert_eq!(composite_percent(&stage), 15);
        stage.compress = 1.0;
        assert_eq!(composite_percent(&stage), 30);
    }

    #[test]
    fn variants_split_the_transfer_band_equally() {
        let mut stage = StageProgress::new(3);
        stage.compress = 1.0;
        stage.transfers[0] = 1.0;
        assert_eq!(composite_percent(&stage), 52);
        stage.transfers[1] = 1.0;
        stage.transfers[2] = 1.0;
        assert_eq!(composite_percent(&stage), 95);
    }

    #[test]
    fn single_variant_takes_the_whole_band() {
        let mut stage = StageProgress::new(1);
        stage.compress = 1.0;
        stage.transfers[0] = 0.5;
        assert_eq!(composite_percent(&stage), 63);
        stage.transfers[0] = 1.0;
        assert_eq!(composite_percent(&stage), 95);
    }

    #[test]
    fn commit_closes_the_bar() {
        let mut stage = StageProgress::new(3);
        stage.compress = 1.0;
        stage.transfers = vec![1.0, 1.0, 1.0];
        stage.committed = true;
        assert_eq!(composite_percent(&stage), 100);
    }

    #[test]
    fn out_of_range_fractions_are_clamped() {
        let mut stage = StageProgress::new(1);
        stage.compress = 4.0;
        stage.transfers[0] = -2.0;
        assert_eq!(composite_percent(&stage), 30);
        stage.transfers[0] = 9.0;
        assert_eq!(composite_percent(&stage), 95);
    }
}
