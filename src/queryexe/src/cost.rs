//! Constants and formulas of the page-based cost model.

/// Cost of reading one page sequentially.
pub const COST_DISK_READ_PAGE: f64 = 1.0;
/// Extra cost of positioning the head before a random page read.
pub const COST_DISK_SEEK_PAGE: f64 = 0.5;
/// Cost of moving one byte between nodes.
pub const COST_NET_XFER_BYTE: f64 = 0.0025;
/// Selectivity of an equality predicate without better statistics.
pub const SELECTIVITY_EQ: f64 = 0.1;
/// Selectivity of a greater-than predicate.
pub const SELECTIVITY_GT: f64 = 0.4;
/// Pages the buffer pool is assumed to hold.
pub const BUFFER_PAGES: f64 = 32.0 * 1024.0;

/// Arena budget of a block join batch.
pub const NBJOIN_BUFSIZE: usize = 65536;
/// A batch stops filling once less than this is left in the arena.
pub const NBJOIN_SLACK: usize = 512;
/// Budget of a materialized result.
pub const MATERIAL_BUFSIZE: usize = 2 * 1024 * 1024;

/// Expected number of page fetches when `x` lookups each touch `d` records of a
/// `t`-page file through a buffer of `BUFFER_PAGES` pages (Mackert and Lohman).
///
/// # Arguments
///
/// * `t` - Pages in the file.
/// * `d` - Records touched per lookup.
/// * `x` - Number of lookups.
pub fn mackert_lohman(t: f64, d: f64, x: f64) -> f64 {
    if t <= 0.0 {
        return 0.0;
    }
    let b = BUFFER_PAGES;
    let dx = d * x;
    if t <= b {
        (2.0 * t * dx / (2.0 * t + dx)).min(t)
    } else {
        let l = 2.0 * t * b / (2.0 * t - b);
        if dx <= l {
            2.0 * t * dx / (2.0 * t + dx)
        } else {
            b + (dx - l) * (t - b) / t
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mackert_lohman() {
        assert_eq!(0.0, mackert_lohman(0.0, 3.0, 1.0));
        // One lookup of one record in a small file touches about one page.
        let one = mackert_lohman(100.0, 1.0, 1.0);
        assert!(one > 0.99 && one <= 1.0);
        // Never more pages than the file has while it fits the buffer.
        assert_eq!(100.0, mackert_lohman(100.0, 1.0e6, 1.0));
        // Past the buffer size the curve keeps growing linearly.
        let big = 100_000.0;
        assert!(mackert_lohman(big, 1.0e6, 1.0) > mackert_lohman(big, 1.0e5, 1.0));
        assert!(mackert_lohman(big, 1.0e6, 1.0) > BUFFER_PAGES);
    }
}
