//! Picks the cheapest instance size satisfying an app's minimums.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::App;
use crate::provider::Size;

/// Minimum hardware requirements for a deployment.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Specs {
    /// Minimum virtual CPU count.
    pub cpus: u32,
    /// Minimum memory in megabytes.
    pub memory_mb: u64,
    /// Minimum disk in gigabytes; zero disables the disk filter.
    pub disk_gb: u32,
}

impl Specs {
    /// Derives specs from an app's minimums, applying optional user
    /// overrides. Overrides may raise a minimum but never lower it.
    #[must_use]
    pub fn for_app(app: &App, overrides: Option<&Self>) -> Self {
        let base = Self {
            cpus: app.min_cpus,
            memory_mb: app.min_memory_mb,
            disk_gb: app.min_disk_gb.unwrap_or(0),
        };
        overrides.map_or(base, |extra| Self {
            cpus: base.cpus.max(extra.cpus),
            memory_mb: base.memory_mb.max(extra.memory_mb),
            disk_gb: base.disk_gb.max(extra.disk_gb),
        })
    }

    /// Returns `true` when `size` meets every minimum.
    #[must_use]
    pub const fn accepts(&self, size: &Size) -> bool {
        size.vcpus >= self.cpus
            && size.memory_mb >= self.memory_mb
            && (self.disk_gb == 0 || size.disk_gb >= self.disk_gb)
    }
}

impl fmt::Display for Specs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vCPU, {} MB memory", self.cpus, self.memory_mb)?;
        if self.disk_gb > 0 {
            write!(f, ", {} GB disk", self.disk_gb)?;
        }
        Ok(())
    }
}

/// Chooses the best size for `specs`.
///
/// Candidates are the sizes meeting every minimum. When any candidate has a
/// known monthly price, the cheapest priced candidate wins and unpriced ones
/// are ignored. Otherwise the smallest candidate by vCPUs, then memory, then
/// disk wins. Ties keep the earliest entry, so the result depends only on the
/// input order. Returns `None` when nothing qualifies.
///
/// # Examples
///
/// ```
/// use hangar::provider::Size;
/// use hangar::selector::{pick_best_size_for_specs, Specs};
///
/// let size = |slug: &str, vcpus, price| Size {
///     slug: slug.to_owned(),
///     memory_mb: 2048,
///     vcpus,
///     disk_gb: 50,
///     transfer_tb: None,
///     price_monthly: price,
///     price_hourly: None,
///     regions: Vec::new(),
/// };
/// let sizes = vec![size("a", 2, Some(12.0)), size("b", 2, Some(10.0)), size("c", 4, Some(20.0))];
/// let specs = Specs { cpus: 2, memory_mb: 2048, disk_gb: 0 };
///
/// assert_eq!(pick_best_size_for_specs(&sizes, &specs).map(|s| s.slug.as_str()), Some("b"));
/// ```
#[must_use]
pub fn pick_best_size_for_specs<'a>(sizes: &'a [Size], specs: &Specs) -> Option<&'a Size> {
    let candidates: Vec<&Size> = sizes.iter().filter(|size| specs.accepts(size)).collect();

    let cheapest = candidates
        .iter()
        .filter_map(|size| size.known_monthly_price().map(|price| (*size, price)))
        .reduce(|best, next| if next.1 < best.1 { next } else { best })
        .map(|(size, _)| size);

    cheapest.or_else(|| {
        candidates
            .into_iter()
            .reduce(|best, next| if footprint(next) < footprint(best) { next } else { best })
    })
}

/// Picks the best size among those offered in `region`.
#[must_use]
pub fn pick_for_region<'a>(sizes: &'a [Size], specs: &Specs, region: &str) -> Option<&'a Size> {
    let offered: Vec<Size> = sizes
        .iter()
        .filter(|size| size.offered_in(region))
        .cloned()
        .collect();
    let slug = pick_best_size_for_specs(&offered, specs)?.slug.clone();
    sizes.iter().find(|size| size.slug == slug)
}

const fn footprint(size: &Size) -> (u32, u64, u32) {
    (size.vcpus, size.memory_mb, size.disk_gb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn size(slug: &str, vcpus: u32, memory_mb: u64, disk_gb: u32, price: Option<f64>) -> Size {
        Size {
            slug: slug.to_owned(),
            memory_mb,
            vcpus,
            disk_gb,
            transfer_tb: None,
            price_monthly: price,
            price_hourly: None,
            regions: Vec::new(),
        }
    }

    #[fixture]
    fn specs() -> Specs {
        Specs {
            cpus: 2,
            memory_mb: 2048,
            disk_gb: 0,
        }
    }

    fn pick<'a>(sizes: &'a [Size], specs: &Specs) -> Option<&'a str> {
        pick_best_size_for_specs(sizes, specs).map(|size| size.slug.as_str())
    }

    #[rstest]
    fn picks_cheapest_priced_candidate(specs: Specs) {
        let sizes = vec![
            size("a", 2, 2048, 50, Some(12.0)),
            size("b", 2, 2048, 50, Some(10.0)),
            size("c", 4, 4096, 80, Some(20.0)),
        ];
        assert_eq!(pick(&sizes, &specs), Some("b"));
    }

    #[rstest]
    fn zero_price_counts_as_unknown(specs: Specs) {
        let sizes = vec![
            size("one", 1, 1024, 25, Some(5.0)),
            size("free", 2, 2048, 50, Some(0.0)),
            size("paid", 2, 2048, 50, Some(10.0)),
        ];
        assert_eq!(pick(&sizes, &specs), Some("paid"));
    }

    #[rstest]
    fn priced_candidates_beat_smaller_unpriced_ones(specs: Specs) {
        let sizes = vec![
            size("a", 2, 2048, 50, None),
            size("b", 4, 4096, 80, Some(0.0)),
            size("c", 8, 8192, 160, Some(40.0)),
        ];
        assert_eq!(pick(&sizes, &specs), Some("c"));
    }

    #[rstest]
    fn falls_back_to_smallest_footprint_without_prices(specs: Specs) {
        let sizes = vec![
            size("big", 4, 8192, 80, None),
            size("small", 2, 4096, 80, None),
            size("smaller", 2, 2048, 160, Some(0.0)),
            size("smaller-disk", 2, 2048, 40, None),
        ];
        assert_eq!(pick(&sizes, &specs), Some("smaller-disk"));
    }

    #[rstest]
    fn equal_prices_keep_first_entry(specs: Specs) {
        let sizes = vec![
            size("first", 4, 4096, 80, Some(10.0)),
            size("second", 2, 2048, 50, Some(10.0)),
        ];
        assert_eq!(pick(&sizes, &specs), Some("first"));
    }

    #[rstest]
    fn equal_footprints_keep_first_entry(specs: Specs) {
        let sizes = vec![
            size("first", 2, 2048, 50, None),
            size("second", 2, 2048, 50, None),
        ];
        assert_eq!(pick(&sizes, &specs), Some("first"));
    }

    #[rstest]
    fn empty_or_insufficient_inputs_find_nothing(specs: Specs) {
        assert_eq!(pick(&[], &specs), None);
        let sizes = vec![size("tiny", 1, 512, 10, Some(4.0))];
        assert_eq!(pick(&sizes, &specs), None);
    }

    #[test]
    fn disk_filter_applies_only_when_set() {
        let sizes = vec![size("a", 1, 1024, 10, Some(5.0))];
        let mut specs = Specs {
            cpus: 1,
            memory_mb: 1024,
            disk_gb: 0,
        };
        assert_eq!(pick(&sizes, &specs), Some("a"));
        specs.disk_gb = 20;
        assert_eq!(pick(&sizes, &specs), None);
    }

    #[rstest]
    fn selection_result_always_meets_specs(specs: Specs) {
        let sizes: Vec<Size> = (1..=6_u32)
            .map(|step| {
                let price = step.is_multiple_of(2).then(|| f64::from(step));
                size(&format!("s{step}"), step, u64::from(step) * 1024, step * 10, price)
            })
            .collect();
        let chosen = pick_best_size_for_specs(&sizes, &specs)
            .unwrap_or_else(|| panic!("a candidate exists"));

        assert!(specs.accepts(chosen));
        assert!(chosen.known_monthly_price().is_some());
        assert_eq!(chosen.slug, "s2");
    }

    #[rstest]
    fn region_filter_skips_sizes_missing_from_region(specs: Specs) {
        let mut cheap = size("cheap", 2, 2048, 50, Some(5.0));
        cheap.regions = vec![String::from("fra1")];
        let mut other = size("other", 2, 2048, 50, Some(6.0));
        other.regions = vec![String::from("nyc1")];
        let sizes = vec![cheap, other];

        let chosen = pick_for_region(&sizes, &specs, "nyc1").map(|size| size.slug.as_str());
        assert_eq!(chosen, Some("other"));
    }
}
