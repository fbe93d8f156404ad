use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Run a fallible action up to `tries` times, returning the first success.
/// Intermediate failures are logged; the last error propagates unchanged.
pub fn attempt<T, E, F>(tries: usize, mut body: F) -> std::result::Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> std::result::Result<T, E>,
{
    assert!(tries > 0, "attempt: at least one try is required");
    let mut i = 1;
    loop {
        match body() {
            Ok(v) => return Ok(v),
            Err(e) if i < tries => {
                log::warn!("attempt: operation failed ({e}), retrying ({i}/{tries})");
                i += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shuffle a slice by swapping each element with a draw over the full range,
/// using a PRNG seeded with `seed`. The same seed always yields the same
/// order, which keeps the chunk permutation identical across feature streams
/// and reproducible across reruns of a sweep.
pub(crate) fn seeded_shuffle<T>(v: &mut [T], seed: u64) {
    if v.is_empty() {
        return;
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    for i in 0..v.len() {
        let j = rng.gen_range(0..v.len());
        if j != i {
            v.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_retries_then_succeeds() {
        let mut left = 2;
        let res: Result<u32, String> = attempt(5, || {
            if left > 0 {
                left -= 1;
                Err("transient".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(res.unwrap(), 7);
    }

    #[test]
    fn attempt_propagates_after_exhaustion() {
        let mut calls = 0;
        let res: Result<(), String> = attempt(3, || {
            calls += 1;
            Err("nope".to_string())
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn seeded_shuffle_is_deterministic() {
        let mut a: Vec<usize> = (0..100).collect();
        let mut b: Vec<usize> = (0..100).collect();
        seeded_shuffle(&mut a, 42);
        seeded_shuffle(&mut b, 42);
        assert_eq!(a, b);
        let mut c: Vec<usize> = (0..100).collect();
        seeded_shuffle(&mut c, 43);
        assert_ne!(a, c);
        a.sort_unstable();
        assert_eq!(a, (0..100).collect::<Vec<_>>());
    }
}
