//! Post-filters applied to a request's group ordering.
//!
//! These run on the controller thread after the finder merge. The temporal
//! window `[start, stop]` is not applied here; it is applied inside vector
//! index load, so out-of-window groups are never materialized.

use crate::config::FilterConfig;
use crate::index::GroupOrdering;
use crate::time;

/// Apply the URL-substring, day-of-year, and closest-time filters in order.
///
/// `gps` is the caller's per-point target time in GPS seconds; when zero,
/// the per-request `closest_time` from the filter config is used instead.
pub fn apply(ordering: &mut GroupOrdering, filters: &FilterConfig, gps: i64) {
    apply_url_substring(ordering, filters);
    apply_doy_range(ordering, filters);
    apply_closest_time(ordering, filters, gps);
}

fn apply_url_substring(ordering: &mut GroupOrdering, filters: &FilterConfig) {
    let Some(substring) = filters.url_substring.as_deref() else {
        return;
    };
    if substring.is_empty() {
        return;
    }

    ordering.retain(|group| group.descriptors.iter().all(|d| d.path.contains(substring)));
}

fn apply_doy_range(ordering: &mut GroupOrdering, filters: &FilterConfig) {
    let Some(range) = &filters.doy_range else {
        return;
    };

    ordering.retain(|group| {
        let doy = time::day_of_year(&group.date);
        let inrange = time::doy_in_range(doy, range.start, range.end);
        inrange == range.keep_inrange
    });
}

fn apply_closest_time(ordering: &mut GroupOrdering, filters: &FilterConfig, gps: i64) {
    // A caller-provided time wins over the request parameter
    let target = if gps > 0 {
        gps
    } else if let Some(closest) = &filters.closest_time {
        time::gps_from_datetime(closest)
    } else {
        return;
    };

    let Some(min_delta) = ordering
        .iter()
        .map(|(_, g)| (g.gps_time - target).abs())
        .min()
    else {
        return;
    };

    // Groups tied at the minimum delta are all retained
    ordering.retain(|group| (group.gps_time - target).abs() == min_delta);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DoyRange;
    use crate::index::{RasterDescriptor, RasterGroup, RasterTag};
    use crate::time::datetime_from_gps;
    use chrono::{TimeZone, Utc};

    fn make_group(path: &str, gps: i64) -> RasterGroup {
        RasterGroup {
            id: path.to_string(),
            descriptors: vec![RasterDescriptor::new(
                path.to_string(),
                RasterTag::Value,
                true,
            )],
            date: datetime_from_gps(gps),
            gps_time: gps,
        }
    }

    fn ids(ordering: &GroupOrdering) -> Vec<String> {
        ordering.iter().map(|(_, g)| g.id.clone()).collect()
    }

    #[test]
    fn test_url_substring_filter() {
        let mut ordering = GroupOrdering::new();
        ordering.push(make_group("/data/arcticdem/a_dem.tif", 1));
        ordering.push(make_group("/data/rema/b_dem.tif", 2));

        let filters = FilterConfig {
            url_substring: Some("arcticdem".to_string()),
            ..FilterConfig::default()
        };
        apply(&mut ordering, &filters, 0);

        assert_eq!(ids(&ordering), vec!["/data/arcticdem/a_dem.tif"]);
    }

    #[test]
    fn test_empty_url_substring_is_disabled() {
        let mut ordering = GroupOrdering::new();
        ordering.push(make_group("/data/a_dem.tif", 1));
        ordering.push(make_group("/data/b_dem.tif", 2));

        let filters = FilterConfig {
            url_substring: Some(String::new()),
            ..FilterConfig::default()
        };
        apply(&mut ordering, &filters, 0);

        assert_eq!(ordering.len(), 2);
    }

    #[test]
    fn test_doy_keep_inrange() {
        let summer = Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap();
        let winter = Utc.with_ymd_and_hms(2021, 1, 15, 0, 0, 0).unwrap();

        let mut ordering = GroupOrdering::new();
        let mut a = make_group("summer", 1);
        a.date = summer;
        let mut b = make_group("winter", 2);
        b.date = winter;
        ordering.push(a);
        ordering.push(b);

        let filters = FilterConfig {
            doy_range: Some(DoyRange {
                start: 152,
                end: 244,
                keep_inrange: true,
            }),
            ..FilterConfig::default()
        };
        apply(&mut ordering, &filters, 0);
        assert_eq!(ids(&ordering), vec!["summer"]);
    }

    #[test]
    fn test_doy_exclude_inrange() {
        let summer = Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap();
        let winter = Utc.with_ymd_and_hms(2021, 1, 15, 0, 0, 0).unwrap();

        let mut ordering = GroupOrdering::new();
        let mut a = make_group("summer", 1);
        a.date = summer;
        let mut b = make_group("winter", 2);
        b.date = winter;
        ordering.push(a);
        ordering.push(b);

        let filters = FilterConfig {
            doy_range: Some(DoyRange {
                start: 152,
                end: 244,
                keep_inrange: false,
            }),
            ..FilterConfig::default()
        };
        apply(&mut ordering, &filters, 0);
        assert_eq!(ids(&ordering), vec!["winter"]);
    }

    #[test]
    fn test_closest_time_retains_ties() {
        let mut ordering = GroupOrdering::new();
        ordering.push(make_group("a", 900));
        ordering.push(make_group("b", 1100));
        ordering.push(make_group("c", 1100));

        apply(&mut ordering, &FilterConfig::default(), 1000);

        // All three tie at |delta| = 100
        assert_eq!(ordering.len(), 3);
    }

    #[test]
    fn test_closest_time_removes_farther_groups() {
        let mut ordering = GroupOrdering::new();
        ordering.push(make_group("a", 800));
        ordering.push(make_group("b", 1100));
        ordering.push(make_group("c", 1100));

        apply(&mut ordering, &FilterConfig::default(), 1000);

        assert_eq!(ids(&ordering), vec!["b", "c"]);
    }

    #[test]
    fn test_closest_time_from_request_parameter() {
        let mut ordering = GroupOrdering::new();
        ordering.push(make_group("a", 1000));
        ordering.push(make_group("b", 5000));

        let filters = FilterConfig {
            closest_time: Some(datetime_from_gps(1010)),
            ..FilterConfig::default()
        };
        // No per-point time: the request parameter applies
        apply(&mut ordering, &filters, 0);
        assert_eq!(ids(&ordering), vec!["a"]);
    }

    #[test]
    fn test_no_filters_keeps_everything() {
        let mut ordering = GroupOrdering::new();
        ordering.push(make_group("a", 1));
        ordering.push(make_group("b", 2));

        apply(&mut ordering, &FilterConfig::default(), 0);
        assert_eq!(ordering.len(), 2);
    }
}
