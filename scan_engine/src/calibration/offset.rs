//! Black level (AFE offset) bisection.

use hardware::command_set::OffsetTuning;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetAction {
    /// Scan again with [`OffsetSearch::codes`]
    Scan,
    Done {
        offset: [u8; 3],
        converged: bool,
        passes: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct Bracket {
    low: u8,
    high: u8,
    /// Measured code with the reading nearest the dark target
    best: Option<(u8, f64)>,
}

impl Bracket {
    fn midpoint(&self) -> u8 {
        ((u16::from(self.low) + u16::from(self.high)) / 2) as u8
    }

    fn resolved(&self) -> bool {
        self.high.saturating_sub(self.low) <= 1
    }
}

/// Bisects every channel's offset code at once, one scan per pass.
#[derive(Debug, Clone)]
pub struct OffsetSearch {
    tuning: OffsetTuning,
    channels: Vec<usize>,
    current: [u8; 3],
    brackets: [Bracket; 3],
    passes: u32,
}

impl OffsetSearch {
    pub fn new(tuning: OffsetTuning, channels: &[usize], current: [u8; 3]) -> Self {
        let bracket = Bracket {
            low: tuning.search_low.min(tuning.search_high),
            high: tuning.search_high.max(tuning.search_low),
            best: None,
        };
        Self {
            tuning,
            channels: channels.to_vec(),
            current,
            brackets: [bracket; 3],
            passes: 0,
        }
    }

    /// Offset codes for the next diagnostic scan.
    pub fn codes(&self) -> [u8; 3] {
        let mut codes = self.current;
        for &c in &self.channels {
            codes[c] = self.brackets[c].midpoint();
        }
        codes
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    fn committed(&self) -> [u8; 3] {
        let mut codes = self.current;
        for &c in &self.channels {
            let bracket = &self.brackets[c];
            codes[c] = bracket.best.map_or(bracket.midpoint(), |(code, _)| code);
        }
        codes
    }

    /// Consume the dark averages measured at [`OffsetSearch::codes`].
    pub fn step(&mut self, levels: &[f64; 3]) -> OffsetAction {
        self.passes += 1;
        let target = f64::from(self.tuning.dark_target);

        for &c in &self.channels {
            let bracket = &mut self.brackets[c];
            if bracket.resolved() {
                continue;
            }
            let mid = bracket.midpoint();
            let level = levels[c];
            let distance = (level - target).abs();
            if bracket.best.map_or(true, |(_, d)| distance <= d) {
                bracket.best = Some((mid, distance));
            }

            if level < target {
                bracket.low = mid;
            } else {
                bracket.high = mid;
            }
        }

        let converged = self.channels.iter().all(|&c| self.brackets[c].resolved());
        if converged || self.passes >= self.tuning.max_passes {
            return OffsetAction::Done {
                offset: self.committed(),
                converged,
                passes: self.passes,
            };
        }
        OffsetAction::Scan
    }
}
