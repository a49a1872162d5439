//! Shared randomness for game outcomes.
//!
//! A single task owns the generator and serves draws over a channel, so every
//! value is handed to exactly one caller and no caller holds a lock. The
//! generator is seeded once from OS entropy.

use crate::error::{Result, ServerError};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};

/// Fixed-point scale for percentage chances: 100% == `CHANCE_RANGE`.
const CHANCE_DIVISOR: f64 = 10_000_000.0;
const CHANCE_RANGE: i32 = 1_000_000_000;

enum RandomRequest {
    Integer {
        min: i32,
        max: i32,
        reply: oneshot::Sender<i32>,
    },
    Rate {
        range: f64,
        reply: oneshot::Sender<f64>,
    },
    Bytes {
        len: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Cloneable handle to the randomness task.
#[derive(Debug, Clone)]
pub struct RandomnessService {
    tx: mpsc::Sender<RandomRequest>,
}

impl RandomnessService {
    /// Spawns the owning task on the current runtime.
    pub fn spawn(buffer: usize) -> Self {
        Self::spawn_with(StdRng::from_entropy(), buffer)
    }

    /// Deterministic sequence, for tests and replays.
    pub fn with_seed(seed: u64, buffer: usize) -> Self {
        Self::spawn_with(StdRng::seed_from_u64(seed), buffer)
    }

    fn spawn_with(mut rng: StdRng, buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RandomRequest>(buffer);

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                // A dropped reply means the caller went away; the draw is discarded.
                match request {
                    RandomRequest::Integer { min, max, reply } => {
                        let _ = reply.send(rng.gen_range(min..max));
                    }
                    RandomRequest::Rate { range, reply } => {
                        let _ = reply.send(rng.gen_range(0.0..range));
                    }
                    RandomRequest::Bytes { len, reply } => {
                        let mut bytes = vec![0u8; len];
                        rng.fill_bytes(&mut bytes);
                        let _ = reply.send(bytes);
                    }
                }
            }
            debug!("Randomness service stopped");
        });

        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RandomRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ServerError::RandomnessUnavailable)?;
        response.await.map_err(|_| ServerError::RandomnessUnavailable)
    }

    /// Uniform integer in `[min, max)`. `min == max` yields `min`.
    pub async fn next_int(&self, min: i32, max: i32) -> Result<i32> {
        if min > max {
            return Err(ServerError::InvalidRange(format!("[{}, {})", min, max)));
        }
        if min == max {
            return Ok(min);
        }
        self.request(|reply| RandomRequest::Integer { min, max, reply }).await
    }

    /// Uniform integer in `[0, max)`.
    pub async fn next(&self, max: i32) -> Result<i32> {
        self.next_int(0, max).await
    }

    /// Uniform real in `[0, range)`.
    pub async fn next_rate(&self, range: f64) -> Result<f64> {
        if !range.is_finite() || range < 0.0 {
            return Err(ServerError::InvalidRange(format!("[0, {})", range)));
        }
        if range == 0.0 {
            return Ok(0.0);
        }
        self.request(|reply| RandomRequest::Rate { range, reply }).await
    }

    pub async fn next_bytes(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let len = buffer.len();
        let bytes = self.request(|reply| RandomRequest::Bytes { len, reply }).await?;
        buffer.copy_from_slice(&bytes);
        Ok(())
    }

    /// Succeeds with probability `percent`/100, compared in fixed point.
    pub async fn chance_calc(&self, percent: f64) -> Result<bool> {
        // NaN clamps to NaN and casts to 0: never succeeds.
        let threshold = (percent.clamp(0.0, 100.0) * CHANCE_DIVISOR).round() as i32;
        Ok(self.next_int(0, CHANCE_RANGE).await? < threshold)
    }

    /// Succeeds with probability `chance`/`out_of`.
    pub async fn chance_of(&self, chance: i32, out_of: i32) -> Result<bool> {
        if out_of <= 0 {
            return Err(ServerError::InvalidRange(format!("[0, {})", out_of)));
        }
        Ok(self.next(out_of).await? < chance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_next_int_stays_in_range() {
        let random = RandomnessService::with_seed(7, 64);
        for _ in 0..5_000 {
            let value = assert_ok!(random.next_int(-3, 4).await);
            assert!((-3..4).contains(&value));
        }
    }

    #[tokio::test]
    async fn test_degenerate_and_invalid_ranges() {
        let random = RandomnessService::with_seed(7, 8);
        assert_eq!(assert_ok!(random.next_int(5, 5).await), 5);
        assert_err!(random.next_int(6, 5).await);
        assert_eq!(assert_ok!(random.next_rate(0.0).await), 0.0);
        assert_err!(random.next_rate(-1.0).await);
        assert_err!(random.next_rate(f64::NAN).await);
        assert_err!(random.chance_of(1, 0).await);
    }

    #[tokio::test]
    async fn test_same_seed_same_sequence() {
        let a = RandomnessService::with_seed(42, 8);
        let b = RandomnessService::with_seed(42, 8);
        for _ in 0..100 {
            assert_eq!(
                assert_ok!(a.next_int(0, 1_000_000).await),
                assert_ok!(b.next_int(0, 1_000_000).await)
            );
        }
    }

    #[tokio::test]
    async fn test_next_int_is_roughly_uniform() {
        const BUCKETS: usize = 10;
        const SAMPLES: usize = 100_000;

        let random = RandomnessService::with_seed(1234, 256);
        let mut counts = [0usize; BUCKETS];
        for _ in 0..SAMPLES {
            let value = assert_ok!(random.next(BUCKETS as i32).await);
            counts[value as usize] += 1;
        }

        let expected = SAMPLES as f64 / BUCKETS as f64;
        let chi_square: f64 = counts
            .iter()
            .map(|&observed| {
                let diff = observed as f64 - expected;
                diff * diff / expected
            })
            .sum();

        // 9 degrees of freedom; p = 0.001 critical value is 27.88.
        assert!(chi_square < 27.88, "chi-square {} counts {:?}", chi_square, counts);
    }

    #[tokio::test]
    async fn test_next_rate_bounds_and_mean() {
        let random = RandomnessService::with_seed(99, 64);
        let mut sum = 0.0;
        for _ in 0..10_000 {
            let value = assert_ok!(random.next_rate(2.5).await);
            assert!((0.0..2.5).contains(&value));
            sum += value;
        }
        assert_approx_eq!(sum / 10_000.0, 1.25, 0.05);
    }

    #[tokio::test]
    async fn test_next_bytes_fills_buffer() {
        let random = RandomnessService::with_seed(3, 8);
        let mut buffer = [0u8; 64];
        assert_ok!(random.next_bytes(&mut buffer).await);
        assert!(buffer.iter().any(|&b| b != 0));

        let mut empty: [u8; 0] = [];
        assert_ok!(random.next_bytes(&mut empty).await);
    }

    #[tokio::test]
    async fn test_chance_boundaries() {
        let random = RandomnessService::with_seed(5, 64);
        for _ in 0..10_000 {
            assert!(!assert_ok!(random.chance_calc(0.0).await));
            assert!(assert_ok!(random.chance_calc(100.0).await));
        }
        assert!(!assert_ok!(random.chance_calc(-5.0).await));
        assert!(assert_ok!(random.chance_calc(250.0).await));
        assert!(!assert_ok!(random.chance_calc(f64::NAN).await));
    }

    #[tokio::test]
    async fn test_chance_half() {
        let random = RandomnessService::with_seed(11, 64);
        let trials = 20_000;
        let mut hits = 0;
        for _ in 0..trials {
            if assert_ok!(random.chance_calc(50.0).await) {
                hits += 1;
            }
        }
        assert_approx_eq!(hits as f64 / trials as f64, 0.5, 0.02);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_share_a_draw() {
        let random = RandomnessService::spawn(128);
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let random = random.clone();
            tasks.push(tokio::spawn(async move {
                let mut drawn = Vec::new();
                for _ in 0..500 {
                    let mut buffer = [0u8; 16];
                    random.next_bytes(&mut buffer).await.unwrap();
                    drawn.push(u128::from_le_bytes(buffer));
                }
                drawn
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for value in assert_ok!(task.await) {
                assert!(seen.insert(value), "duplicate draw observed");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
