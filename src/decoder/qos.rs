// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame dropping driven by QoS feedback.

use log::debug;

use crate::backend::SkipFrames;

const NO_DROP_THRESHOLD_NS: i64 = 10_000_000;
const DROP_B_THRESHOLD_NS: i64 = 200_000_000;
const AGGRESSIVE_THRESHOLD_NS: i64 = 2_000_000_000;

/// How much the decoder sheds load, by increasing order of aggressiveness.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkipMode {
    #[default]
    None,
    /// The engine skips B pictures.
    DropB,
    /// The engine skips B and P pictures.
    DropBP,
    /// First aggressive level: the engine skips B pictures and one out of four pictures is
    /// dropped before display.
    Aggressive,
    /// Second aggressive level: the engine skips B and P pictures and every other picture is
    /// dropped before display.
    VeryAggressive,
}

impl SkipMode {
    pub fn is_aggressive(&self) -> bool {
        matches!(self, SkipMode::Aggressive | SkipMode::VeryAggressive)
    }
}

#[derive(Debug, Default)]
pub struct QosController {
    mode: SkipMode,
}

impl QosController {
    pub fn mode(&self) -> SkipMode {
        self.mode
    }

    pub fn reset(&mut self) {
        self.mode = SkipMode::None;
    }

    /// Updates the skip mode from the lateness reported by the pipeline.
    pub fn update(&mut self, lateness_ns: i64) -> SkipMode {
        let mode = if lateness_ns <= NO_DROP_THRESHOLD_NS {
            SkipMode::None
        } else if lateness_ns <= DROP_B_THRESHOLD_NS {
            // Coming back from an aggressive level, keep skipping P pictures until caught up.
            if self.mode.is_aggressive() || self.mode == SkipMode::DropBP {
                SkipMode::DropBP
            } else {
                SkipMode::DropB
            }
        } else if lateness_ns <= AGGRESSIVE_THRESHOLD_NS {
            SkipMode::Aggressive
        } else {
            SkipMode::VeryAggressive
        };

        if mode != self.mode {
            debug!(
                "QoS: lateness {} ms, skip mode {:?} -> {:?}",
                lateness_ns / 1_000_000,
                self.mode,
                mode
            );
            self.mode = mode;
        }
        mode
    }

    /// Pictures the engine should skip.
    pub fn skip_frames(&self) -> SkipFrames {
        match self.mode {
            SkipMode::None => SkipFrames::None,
            SkipMode::DropB | SkipMode::Aggressive => SkipFrames::B,
            SkipMode::DropBP | SkipMode::VeryAggressive => SkipFrames::BAndP,
        }
    }

    /// Whether the picture with frame counter `counter` must be dropped before display.
    pub fn should_drop(&self, counter: u64) -> bool {
        match self.mode {
            SkipMode::Aggressive => counter & 3 == 3,
            SkipMode::VeryAggressive => counter & 1 == 1,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation() {
        let mut qos = QosController::default();
        assert_eq!(qos.update(5_000_000), SkipMode::None);
        assert_eq!(qos.update(50_000_000), SkipMode::DropB);
        assert_eq!(qos.skip_frames(), SkipFrames::B);
        assert_eq!(qos.update(250_000_000), SkipMode::Aggressive);
        assert_eq!(qos.update(3_000_000_000), SkipMode::VeryAggressive);
        assert_eq!(qos.skip_frames(), SkipFrames::BAndP);
    }

    #[test]
    fn de_escalation_goes_through_drop_bp() {
        let mut qos = QosController::default();
        qos.update(250_000_000);
        assert_eq!(qos.update(100_000_000), SkipMode::DropBP);
        assert_eq!(qos.update(100_000_000), SkipMode::DropBP);
        assert_eq!(qos.update(-5_000_000), SkipMode::None);
    }

    #[test]
    fn drop_patterns() {
        let mut qos = QosController::default();
        qos.update(250_000_000);
        let dropped = (0..8u64).filter(|&c| qos.should_drop(c)).collect::<Vec<_>>();
        assert_eq!(dropped, vec![3, 7]);

        qos.update(2_500_000_000);
        let dropped = (0..8u64).filter(|&c| qos.should_drop(c)).collect::<Vec<_>>();
        assert_eq!(dropped, vec![1, 3, 5, 7]);

        qos.reset();
        assert!(!qos.should_drop(3));
    }
}
