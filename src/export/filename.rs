use std::{collections::HashSet, path::Path};

use rand::{rngs::StdRng, RngCore, SeedableRng};

/// Random bytes per name, rendered as twice as many hex characters.
pub const NUM_RANDOM_BYTES: usize = 5;

/// Hands out `<10 hex chars>.png` names.
///
/// Names are random, but never repeat within one generator and never
/// collide with a file already present in the target directory.
pub struct FilenameGenerator<R = StdRng> {
    rng: R,
    issued: HashSet<String>,
}

impl FilenameGenerator<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for FilenameGenerator<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> FilenameGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            issued: HashSet::new(),
        }
    }

    /// A fresh name for a file in `dir`.
    pub fn next_in(&mut self, dir: &Path) -> String {
        loop {
            let name = self.draw();
            if !self.issued.contains(&name) && !dir.join(&name).exists() {
                self.issued.insert(name.clone());
                return name;
            }
            tracing::debug!("Filename {name} already taken, drawing again");
        }
    }

    fn draw(&mut self) -> String {
        let mut bytes = [0u8; NUM_RANDOM_BYTES];
        self.rng.fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("{hex}.png")
    }
}
