use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::time::Duration;

/// Waiting times between the events of a Poisson process with the given rate (per second).
pub struct Poisson<R: Rng + ?Sized> {
    pub rng: Box<R>,
    pub rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: &[u8; 32]) -> Self {
        Self {
            rng: Box::new(SmallRng::from_seed(*seed)),
            rate,
        }
    }

    pub fn from_entropy(rate: f64) -> Self {
        Self::new(rate, &rand::random())
    }
}

impl<R: Rng + ?Sized> Poisson<R> {
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    pub fn next_delay(&mut self) -> Duration {
        Duration::from_secs_f64(self.time_for_next_event())
    }
}
