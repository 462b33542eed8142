//! Property-based tests for pin placement using proptest.
//!
//! Random pin assignments over a small tree must always settle with exactly
//! one authority per directory, and every explicit pin to an existing rank
//! must be honored.

mod common;

use arborfs_meta::{LocalCluster, PinKind};
use common::{owner, TestConfig};
use proptest::prelude::*;

const DIRS: [&str; 7] = ["/a", "/a/b", "/a/b/c", "/a/g", "/d", "/d/e", "/f"];

/// Pin values from inherit up to one rank past the active set.
fn any_pins() -> impl Strategy<Value = Vec<i32>> {
    proptest::collection::vec(-1i32..=3, DIRS.len())
}

fn start() -> LocalCluster {
    let mut c = TestConfig {
        max_active: 3,
        standby_count: 1,
        ..TestConfig::default()
    }
    .start();
    for d in ["/a/b/c", "/a/g", "/d/e", "/f"] {
        c.mkdir_p(d).unwrap();
    }
    c
}

fn apply(c: &mut LocalCluster, pins: &[i32]) {
    for (dir, value) in DIRS.iter().zip(pins) {
        c.set_pin(dir, PinKind::Export, &value.to_string()).unwrap();
    }
    c.settle().unwrap();
    c.check_single_authority().unwrap();
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Rank of the nearest pin to an active rank at or above `path`.
fn placement(pins: &[i32], path: &str) -> u32 {
    let mut current = path;
    loop {
        if current == "/" {
            return 0;
        }
        if let Some(i) = DIRS.iter().position(|d| *d == current) {
            if (0..3).contains(&pins[i]) {
                return pins[i] as u32;
            }
        }
        current = parent(current);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Test: From a fresh cluster every directory lands on its nearest
    /// active pin, and the root stays on rank 0.
    #[test]
    fn test_fresh_pins_place_every_directory(pins in any_pins()) {
        let mut c = start();
        apply(&mut c, &pins);

        prop_assert_eq!(owner(&c, "/"), Some(0));
        for dir in DIRS {
            prop_assert_eq!(owner(&c, dir), Some(placement(&pins, dir)), "{}", dir);
        }
    }

    /// Test: Re-pinning keeps a single authority and honors explicit pins.
    #[test]
    fn test_repinning_keeps_single_authority(
        first in any_pins(),
        second in any_pins(),
    ) {
        let mut c = start();
        apply(&mut c, &first);
        apply(&mut c, &second);

        for (dir, value) in DIRS.iter().zip(&second) {
            let found = owner(&c, dir);
            prop_assert!(found.is_some(), "{} has no authority", dir);
            if (0..3).contains(value) {
                prop_assert_eq!(found, Some(*value as u32), "{}", dir);
            }
        }
        prop_assert!(c.crashes().is_empty());
    }
}

#[test]
fn test_placement_helper() {
    let pins = [1, -1, 2, 3, -1, 0, 3];
    assert_eq!(placement(&pins, "/a/b"), 1);
    assert_eq!(placement(&pins, "/a/b/c"), 2);
    assert_eq!(placement(&pins, "/a/g"), 1);
    assert_eq!(placement(&pins, "/d/e"), 0);
    assert_eq!(placement(&pins, "/f"), 0);
}

/// Rank 0 moves /a to rank 1 while rank 1 moves the nested /a/g to rank 0.
#[test]
fn test_crossing_repins_settle() {
    let mut c = start();
    apply(&mut c, &[3, 0, 0, 1, 0, 0, 0]);
    assert_eq!(owner(&c, "/a/g"), Some(1));

    apply(&mut c, &[1, 0, 0, 0, 0, 0, 0]);
    assert_eq!(owner(&c, "/a"), Some(1));
    assert_eq!(owner(&c, "/a/g"), Some(0));
    assert_eq!(owner(&c, "/a/b"), Some(0));
    assert!(c.crashes().is_empty());
}
