use rand::RngCore;

/// Source of the seed installed with every forward pass.
pub trait SeedSource {
    fn next_seed(&mut self) -> u64;
}

impl<R: RngCore> SeedSource for R {
    fn next_seed(&mut self) -> u64 {
        self.next_u64()
    }
}

/// Draws seeds from the thread-local generator of `rand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSeeds;

impl SeedSource for ThreadSeeds {
    fn next_seed(&mut self) -> u64 {
        rand::rng().next_u64()
    }
}
