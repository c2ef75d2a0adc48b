//! Field-level comparison primitives shared by the per-kind evaluators
//!
//! Evaluators are chains of checks that stop at the first difference. Each
//! check returns an [`Evaluation`], so a chain reads as a sequence of `?`.

use std::collections::BTreeMap;
use std::fmt;

/// The first property found to differ between a desired and an observed object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drift {
    /// Name of the differing property (e.g. `podAnnotations`)
    pub property: &'static str,
    /// Debug rendering of the desired value
    pub desired: String,
    /// Debug rendering of the observed value
    pub actual: String,
}

impl Drift {
    /// Record a difference in `property`
    pub fn new(property: &'static str, desired: &impl fmt::Debug, actual: &impl fmt::Debug) -> Self {
        Self {
            property,
            desired: format!("{desired:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} differs", self.property)
    }
}

/// Outcome of comparing a desired object against the observed one
pub type Evaluation = Result<(), Drift>;

/// Every desired entry is present in `actual` with the same value.
///
/// Extra observed entries are tolerated; an absent map is treated as empty.
pub fn map_subset(
    desired: Option<&BTreeMap<String, String>>,
    actual: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired else {
        return true;
    };
    desired
        .iter()
        .all(|(k, v)| actual.and_then(|a| a.get(k)) == Some(v))
}

/// Subset check for a label or annotation map
pub fn expect_subset(
    property: &'static str,
    desired: Option<&BTreeMap<String, String>>,
    actual: Option<&BTreeMap<String, String>>,
) -> Evaluation {
    if map_subset(desired, actual) {
        Ok(())
    } else {
        Err(Drift::new(property, &desired, &actual))
    }
}

/// Exact structural equality
pub fn expect_eq<T>(property: &'static str, desired: &T, actual: &T) -> Evaluation
where
    T: PartialEq + fmt::Debug + ?Sized,
{
    if desired == actual {
        Ok(())
    } else {
        Err(Drift::new(property, &desired, &actual))
    }
}

/// Every desired element has a match somewhere in `actual`, in any order.
///
/// One-directional: extra observed elements are tolerated.
pub fn expect_each_matched<T, F>(
    property: &'static str,
    desired: &[T],
    actual: &[T],
    matches: F,
) -> Evaluation
where
    T: fmt::Debug,
    F: Fn(&T, &T) -> bool,
{
    if desired.iter().all(|d| actual.iter().any(|a| matches(d, a))) {
        Ok(())
    } else {
        Err(Drift::new(property, &desired, &actual))
    }
}
