use crate::commitlog::index::ENTRY_WIDTH;
use std::convert::TryFrom;

/// User facing segment limits. Unset fields fall back to defaults.
#[derive(Clone, Debug, Default)]
pub struct SegmentOptions {
    pub max_store_bytes: Option<u64>,
    pub max_index_bytes: Option<u64>,
    pub initial_offset: Option<u64>,
}

/// Validated segment limits used by the log and each of its segments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentConfig {
    pub max_store_bytes: u64,
    pub max_index_bytes: u64,
    pub initial_offset: u64,
}

impl SegmentConfig {
    pub fn with_initial_offset(self, initial_offset: u64) -> Self {
        SegmentConfig {
            initial_offset,
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.max_store_bytes == 0 {
            return Err("Max store bytes must be non-zero");
        }
        if self.max_index_bytes < ENTRY_WIDTH {
            return Err("Max index bytes must fit at least one index entry");
        }
        if self.max_index_bytes / ENTRY_WIDTH > u32::MAX as u64 {
            return Err("Max index bytes allows more entries than a relative offset can address");
        }

        Ok(())
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            max_store_bytes: 1024 * 1024,
            max_index_bytes: 1024 * 1024,
            initial_offset: 0,
        }
    }
}

impl TryFrom<SegmentOptions> for SegmentConfig {
    type Error = &'static str;

    fn try_from(options: SegmentOptions) -> Result<Self, Self::Error> {
        let defaults = SegmentConfig::default();
        let config = SegmentConfig {
            max_store_bytes: options.max_store_bytes.unwrap_or(defaults.max_store_bytes),
            max_index_bytes: options.max_index_bytes.unwrap_or(defaults.max_index_bytes),
            initial_offset: options.initial_offset.unwrap_or(defaults.initial_offset),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = SegmentConfig::try_from(SegmentOptions {
            initial_offset: Some(16),
            ..SegmentOptions::default()
        })
        .unwrap();

        assert_eq!(config.initial_offset, 16);
        assert_eq!(config.max_store_bytes, SegmentConfig::default().max_store_bytes);
    }

    #[test]
    fn index_must_hold_an_entry() {
        let result = SegmentConfig::try_from(SegmentOptions {
            max_index_bytes: Some(ENTRY_WIDTH - 1),
            ..SegmentOptions::default()
        });

        assert!(result.is_err());
    }
}
