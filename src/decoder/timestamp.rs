// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping of input timestamps to display order.
//!
//! One timestamp is received for every access unit the engine starts consuming and one is
//! dequeued for every picture the engine outputs for display, whether that picture is rendered or
//! dropped. Pictures come out in display order, which is not the input order for codecs with
//! B-frames; the [`TimestampMode`] decides how to recover the right timestamp.

use std::collections::VecDeque;

use log::debug;
use log::warn;

/// Maximum number of timestamps waiting for their picture.
const MAX_PENDING: usize = 64;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TimestampMode {
    /// Input timestamps are in decode order and display order is ascending: the smallest pending
    /// timestamp belongs to the next displayed picture. Used for normal-rate playback.
    #[default]
    Ascending,
    /// Timestamps are returned in the order they were received. Used for trick modes, where
    /// ascending order does not hold.
    StrictFifo,
}

#[derive(Debug)]
pub struct TimestampManager {
    mode: TimestampMode,
    pending: VecDeque<Option<u64>>,
    base: Option<u64>,
    last_output: Option<u64>,
    frame_duration: Option<u64>,
    received: u64,
    dequeued: u64,
}

impl Default for TimestampManager {
    fn default() -> Self {
        Self::new(TimestampMode::default())
    }
}

impl TimestampManager {
    pub fn new(mode: TimestampMode) -> Self {
        Self {
            mode,
            pending: VecDeque::with_capacity(MAX_PENDING),
            base: None,
            last_output: None,
            frame_duration: None,
            received: 0,
            dequeued: 0,
        }
    }

    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    /// Sets the duration used to interpolate missing timestamps.
    pub fn set_frame_duration(&mut self, duration: Option<u64>) {
        self.frame_duration = duration;
    }

    /// Drops all pending timestamps and restarts from `base`.
    pub fn resync(&mut self, base: Option<u64>, mode: TimestampMode) {
        debug!(
            "timestamp resync: base {:?}, mode {:?}, {} pending dropped",
            base,
            mode,
            self.pending.len()
        );
        self.dequeued += self.pending.len() as u64;
        self.pending.clear();
        self.mode = mode;
        self.base = base;
        self.last_output = None;
    }

    /// Records the timestamp of an access unit the engine started consuming.
    pub fn receive(&mut self, timestamp: Option<u64>) {
        if self.pending.len() >= MAX_PENDING {
            warn!("too many pending timestamps, dropping the oldest");
            self.pending.pop_front();
            self.dequeued += 1;
        }
        self.pending.push_back(timestamp);
        self.received += 1;
    }

    /// Returns the timestamp of the next picture output for display.
    ///
    /// If no timestamp is pending or the pending one is unknown, a timestamp is interpolated from
    /// the previous one.
    pub fn dequeue_for_display(&mut self) -> Option<u64> {
        let popped = match self.mode {
            TimestampMode::StrictFifo => self.pending.pop_front(),
            TimestampMode::Ascending => {
                let min = self
                    .pending
                    .iter()
                    .enumerate()
                    .filter_map(|(i, ts)| ts.map(|ts| (i, ts)))
                    .min_by_key(|&(_, ts)| ts)
                    .map(|(i, _)| i);
                match min {
                    Some(i) => self.pending.remove(i),
                    None => self.pending.pop_front(),
                }
            }
        };

        if popped.is_some() {
            self.dequeued += 1;
        }

        let timestamp = match popped.flatten() {
            Some(ts) => Some(ts),
            None => self.interpolate(),
        };
        if timestamp.is_some() {
            self.last_output = timestamp;
        }
        timestamp
    }

    fn interpolate(&self) -> Option<u64> {
        match (self.last_output, self.frame_duration) {
            (Some(last), Some(duration)) => Some(last + duration),
            (Some(last), None) => Some(last),
            (None, _) => self.base,
        }
    }

    /// Discards the timestamps left once the stream has been fully drained. Returns how many
    /// there were.
    pub fn drain_remaining(&mut self) -> usize {
        let remaining = self.pending.len();
        if remaining > 0 {
            debug!("{remaining} timestamps left without a picture at end of stream");
        }
        self.dequeued += remaining as u64;
        self.pending.clear();
        remaining
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of timestamps received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Number of timestamps consumed so far, by display, drop or resync.
    pub fn dequeued(&self) -> u64 {
        self.dequeued
    }
}
