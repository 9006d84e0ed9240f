use crate::{Error, Result};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// The size classes used when none are configured: 16 KiB, 64 KiB, 256 KiB and 1 MiB.
pub const DEFAULT_CLASS_SIZES: [usize; 4] = [16 * KIB, 64 * KIB, 256 * KIB, MIB];

/// Blocks are page-aligned unless configured otherwise.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// The largest scatter/gather list a gather descriptor holds unless configured otherwise.
pub const DEFAULT_MAX_SEGMENTS: usize = 32;

/// Name used as the prefix of size class names unless configured otherwise.
pub const DEFAULT_POOL_NAME: &str = "rdma_mempool";

/// Configuration of a [`Mempool`][crate::Mempool], fixed at construction time.
///
/// Most callers configure the pool through [`MempoolBuilder`][crate::MempoolBuilder] instead of
/// creating this type directly. It is useful when the configuration is assembled elsewhere and
/// handed to the pool as a unit.
///
/// # Examples
///
/// ```
/// use rdma_mempool::{Mempool, MempoolConfig};
///
/// let mut config = MempoolConfig::default();
/// config.class_sizes = vec![4096, 8192];
///
/// let pool = Mempool::builder().config(config).build().unwrap();
/// assert_eq!(pool.largest_block_size(), 8192);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct MempoolConfig {
    /// Prefix of the diagnostic names given to the size classes.
    pub name: String,

    /// Block sizes of the size classes, in bytes. Must be non-empty, non-zero and strictly
    /// ascending.
    pub class_sizes: Vec<usize>,

    /// Alignment of every block, in bytes. Must be a power of two.
    pub alignment: usize,

    /// Maximum number of segments in one scatter/gather allocation. Must be non-zero.
    pub max_segments: usize,
}

impl MempoolConfig {
    /// Verifies that the configuration describes a usable pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.class_sizes.is_empty() {
            return Err(invalid("at least one size class is required"));
        }

        if self.class_sizes.contains(&0) {
            return Err(invalid("size classes must have a non-zero block size"));
        }

        if let Some(pair) = self
            .class_sizes
            .windows(2)
            .find(|pair| matches!(pair, [smaller, larger] if smaller >= larger))
        {
            return Err(invalid(format!(
                "size classes must be strictly ascending but {pair:?} is not"
            )));
        }

        if !self.alignment.is_power_of_two() {
            return Err(invalid(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }

        if self.max_segments == 0 {
            return Err(invalid("scatter/gather requests must allow at least one segment"));
        }

        Ok(())
    }
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_POOL_NAME.to_owned(),
            class_sizes: DEFAULT_CLASS_SIZES.to_vec(),
            alignment: DEFAULT_ALIGNMENT,
            max_segments: DEFAULT_MAX_SEGMENTS,
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfig {
        reason: reason.into(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn with_sizes(sizes: &[usize]) -> MempoolConfig {
        MempoolConfig {
            class_sizes: sizes.to_vec(),
            ..MempoolConfig::default()
        }
    }

    #[test]
    fn default_is_valid() {
        MempoolConfig::default().validate().unwrap();
    }

    #[test]
    fn default_matches_rdma_classes() {
        let config = MempoolConfig::default();

        assert_eq!(config.class_sizes, vec![16_384, 65_536, 262_144, 1_048_576]);
        assert_eq!(config.alignment, 4096);
        assert_eq!(config.name, "rdma_mempool");
    }

    #[test]
    fn empty_class_list_is_rejected() {
        assert!(matches!(
            with_sizes(&[]).validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(matches!(
            with_sizes(&[0, 4096]).validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn descending_sizes_are_rejected() {
        assert!(matches!(
            with_sizes(&[8192, 4096]).validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn duplicate_sizes_are_rejected() {
        assert!(matches!(
            with_sizes(&[4096, 4096]).validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn single_class_is_valid() {
        with_sizes(&[1]).validate().unwrap();
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        let config = MempoolConfig {
            alignment: 3000,
            ..MempoolConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn zero_max_segments_is_rejected() {
        let config = MempoolConfig {
            max_segments: 0,
            ..MempoolConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
