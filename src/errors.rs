//! Sampling error words.
//!
//! Errors raised inside worker threads are never propagated as control flow
//! across thread boundaries. Each raster handle, point sample, and request
//! carries a `u32` error word; workers OR bits into their own word and the
//! controller folds those words upward when results are harvested.

/// No errors recorded.
pub const NO_ERRORS: u32 = 0;

/// The vector index file was missing, unreadable, or empty.
pub const INDEX_FILE_ERROR: u32 = 0x0000_0001;

/// The request required more concurrent readers than the configured cap.
pub const THREADS_LIMIT_ERROR: u32 = 0x0000_0002;

/// Worker thread creation failed.
pub const RESOURCE_LIMIT_ERROR: u32 = 0x0000_0004;

/// The point could not be transformed into the raster CRS.
pub const CRS_TRANSFORM_ERROR: u32 = 0x0000_0010;

/// A pixel window fell outside the raster during a read.
pub const OUT_OF_BOUNDS_ERROR: u32 = 0x0000_0020;

/// A block read failed after the retry.
pub const READ_ERROR: u32 = 0x0000_0040;

/// The sampled pixel was NaN or matched the band's no-data value.
pub const NODATA_ERROR: u32 = 0x0000_0080;

/// Render an error word for log messages.
pub fn describe(word: u32) -> String {
    if word == NO_ERRORS {
        return "none".to_string();
    }

    let mut parts = Vec::new();
    for (bit, name) in [
        (INDEX_FILE_ERROR, "index-file"),
        (THREADS_LIMIT_ERROR, "threads-limit"),
        (RESOURCE_LIMIT_ERROR, "resource-limit"),
        (CRS_TRANSFORM_ERROR, "crs-transform"),
        (OUT_OF_BOUNDS_ERROR, "out-of-bounds"),
        (READ_ERROR, "read"),
        (NODATA_ERROR, "nodata"),
    ] {
        if word & bit != 0 {
            parts.push(name);
        }
    }
    parts.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let bits = [
            INDEX_FILE_ERROR,
            THREADS_LIMIT_ERROR,
            RESOURCE_LIMIT_ERROR,
            CRS_TRANSFORM_ERROR,
            OUT_OF_BOUNDS_ERROR,
            READ_ERROR,
            NODATA_ERROR,
        ];
        let mut acc = 0u32;
        for bit in bits {
            assert_eq!(acc & bit, 0, "bit {bit:#x} overlaps");
            acc |= bit;
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(NO_ERRORS), "none");
        assert_eq!(describe(INDEX_FILE_ERROR), "index-file");
        assert_eq!(
            describe(READ_ERROR | NODATA_ERROR),
            "read|nodata"
        );
    }
}
