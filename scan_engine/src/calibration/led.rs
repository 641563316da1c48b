//! LED exposure search.
//!
//! Scales each channel's exposure towards the middle of the target band
//! until every channel reads inside it.

use hardware::command_set::LedTuning;

/// What the controller should do after a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedAction {
    /// Scan again with [`LedSearch::exposure`]
    Scan,
    Done {
        exposure: [u16; 3],
        converged: bool,
        iterations: u32,
    },
}

#[derive(Debug, Clone)]
pub struct LedSearch {
    tuning: LedTuning,
    channels: Vec<usize>,
    exposure: [u16; 3],
    max_exposure: u16,
    /// Exposure with the reading nearest the band middle, per channel
    best: [Option<(u16, f64)>; 3],
    iterations: u32,
}

impl LedSearch {
    /// Start from `start` on the sensor channels listed in `channels`.
    pub fn new(tuning: LedTuning, channels: &[usize], start: [u16; 3], line_period: u32) -> Self {
        let max_exposure = line_period.clamp(1, u32::from(u16::MAX)) as u16;
        let min_exposure = tuning.min_exposure.min(max_exposure);
        Self {
            exposure: start.map(|e| e.clamp(min_exposure, max_exposure)),
            tuning,
            channels: channels.to_vec(),
            max_exposure,
            best: [None; 3],
            iterations: 0,
        }
    }

    /// Exposure to scan with next.
    pub fn exposure(&self) -> [u16; 3] {
        self.exposure
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn target(&self) -> f64 {
        (f64::from(self.tuning.target_low) + f64::from(self.tuning.target_high)) / 2.0
    }

    fn in_band(&self, level: f64) -> bool {
        level >= f64::from(self.tuning.target_low) && level <= f64::from(self.tuning.target_high)
    }

    fn best_exposure(&self) -> [u16; 3] {
        let mut exposure = self.exposure;
        for &c in &self.channels {
            if let Some((e, _)) = self.best[c] {
                exposure[c] = e;
            }
        }
        exposure
    }

    /// Consume the channel averages of the last scan, indexed by sensor channel.
    pub fn step(&mut self, levels: &[f64; 3]) -> LedAction {
        self.iterations += 1;
        let target = self.target();
        let min_exposure = self.tuning.min_exposure.min(self.max_exposure);

        let mut next = self.exposure;
        let mut all_in_band = true;
        for &c in &self.channels {
            let level = levels[c];
            let distance = (level - target).abs();
            if self.best[c].map_or(true, |(_, d)| distance < d) {
                self.best[c] = Some((self.exposure[c], distance));
            }

            if self.in_band(level) {
                continue;
            }
            all_in_band = false;

            let current = f64::from(self.exposure[c]);
            let scaled = if level <= 0.0 {
                current * 2.0
            } else {
                current * target / level
            };
            next[c] = scaled
                .round()
                .clamp(f64::from(min_exposure), f64::from(self.max_exposure)) as u16;
        }

        if all_in_band {
            return LedAction::Done {
                exposure: self.exposure,
                converged: true,
                iterations: self.iterations,
            };
        }

        // Stuck against a clamp or out of iterations: keep the best seen.
        if next == self.exposure || self.iterations >= self.tuning.max_iterations {
            return LedAction::Done {
                exposure: self.best_exposure(),
                converged: false,
                iterations: self.iterations,
            };
        }

        self.exposure = next;
        LedAction::Scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> LedTuning {
        LedTuning {
            target_low: 40_000,
            target_high: 48_000,
            max_iterations: 100,
            min_exposure: 200,
        }
    }

    /// Linear sensor: level = exposure * response per channel.
    fn run(search: &mut LedSearch, response: [f64; 3]) -> LedAction {
        loop {
            let exposure = search.exposure();
            let levels = [0, 1, 2].map(|c| f64::from(exposure[c]) * response[c]);
            match search.step(&levels) {
                LedAction::Scan => continue,
                done => return done,
            }
        }
    }

    #[test]
    fn test_converges_on_linear_response() {
        let mut search = LedSearch::new(tuning(), &[0, 1, 2], [1000; 3], 10_000);
        let LedAction::Done {
            exposure,
            converged,
            iterations,
        } = run(&mut search, [20.0, 30.0, 10.0])
        else {
            panic!("search did not finish");
        };

        assert!(converged);
        assert_eq!(iterations, 2);
        assert_eq!(exposure, [2200, 1467, 4400]);
    }

    #[test]
    fn test_in_band_channel_untouched() {
        let mut search = LedSearch::new(tuning(), &[0, 1, 2], [1000; 3], 10_000);
        let action = search.step(&[44_000.0, 20_000.0, 44_000.0]);
        assert_eq!(action, LedAction::Scan);
        assert_eq!(search.exposure(), [1000, 2200, 1000]);
    }

    #[test]
    fn test_zero_reading_doubles() {
        let mut search = LedSearch::new(tuning(), &[1], [1000; 3], 10_000);
        search.step(&[0.0, 0.0, 0.0]);
        assert_eq!(search.exposure(), [1000, 2000, 1000]);
    }

    #[test]
    fn test_dim_channel_stops_at_line_period() {
        let mut search = LedSearch::new(tuning(), &[0, 1, 2], [1000; 3], 4000);
        let LedAction::Done {
            exposure,
            converged,
            ..
        } = run(&mut search, [20.0, 20.0, 1.0])
        else {
            panic!("search did not finish");
        };

        assert!(!converged);
        assert_eq!(exposure[2], 4000);
        assert_eq!(exposure[0], 2200);
    }

    #[test]
    fn test_iteration_cap_keeps_best() {
        let mut tuning = tuning();
        tuning.max_iterations = 3;
        let mut search = LedSearch::new(tuning, &[0], [1000; 3], 60_000);

        // Oscillating sensor: never lands in the band.
        let readings = [60_000.0, 30_000.0, 70_000.0];
        let mut last = LedAction::Scan;
        for r in readings {
            last = search.step(&[r, 0.0, 0.0]);
        }
        let LedAction::Done {
            exposure,
            converged,
            iterations,
        } = last
        else {
            panic!("cap not applied");
        };
        assert!(!converged);
        assert_eq!(iterations, 3);
        // 30000 was nearest the middle, measured at the second exposure
        assert_eq!(exposure[0], 733);
    }
}
