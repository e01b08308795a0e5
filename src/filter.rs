//! Group filtering.
//!
//! Runs between group building and sampling. Three tests apply, in
//! order: a path-substring test and a day-of-year window (a group is
//! dropped whole if any of its rasters fails), then a closest-in-time
//! reduction that keeps only the group(s) with the smallest time
//! delta to the query time. Groups removed here are never opened.

use crate::config::SamplingConfig;
use crate::dictionary::FileDictionary;
use crate::groups::GroupList;
use crate::time::GpsTime;

/// Apply the configured filters to `groups` in place. `gps` is the
/// query's own timestamp; when set it overrides the configured
/// `closest_time`. Returns false when no group survives.
pub fn apply(
    config: &SamplingConfig,
    gps: GpsTime,
    groups: &mut GroupList,
    dict: &FileDictionary,
) -> bool {
    if config.substr.is_some() || config.doy_range.is_some() {
        for key in groups.keys() {
            let remove = groups.get(key).map_or(false, |group| {
                group.rasters.iter().any(|rinfo| {
                    if let Some(substr) = &config.substr {
                        let matches = dict
                            .path(rinfo.file_id)
                            .map_or(false, |path| path.contains(substr.as_str()));
                        if !matches {
                            return true;
                        }
                    }
                    if let Some(doy) = &config.doy_range {
                        if !doy.keeps_opt(group.date.as_ref()) {
                            return true;
                        }
                    }
                    false
                })
            });
            if remove {
                groups.remove(key);
            }
        }
    }

    // Closest-time comparisons use the group time, not the times of
    // individual rasters.
    let target = if gps.is_set() {
        Some(gps)
    } else {
        config.closest_time.map(|t| GpsTime::from_utc(&t.0))
    };

    if let Some(target) = target {
        let target = target.millis();
        let min_delta = groups
            .iter()
            .map(|g| (target - g.gps.millis()).abs())
            .min();
        if let Some(min_delta) = min_delta {
            for key in groups.keys() {
                let too_far = groups
                    .get(key)
                    .map_or(false, |g| (target - g.gps.millis()).abs() > min_delta);
                if too_far {
                    groups.remove(key);
                }
            }
        }
    }

    !groups.is_empty()
}
