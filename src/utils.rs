// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up<T>(value: T, alignment: T) -> T
where
    T: Copy
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::BitAnd<Output = T>
        + std::ops::Not<Output = T>
        + From<u8>,
{
    let one = T::from(1u8);
    (value + alignment - one) & !(alignment - one)
}

/// Greatest common divisor.
pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Locks `mutex`, recovering the guard if another thread panicked while holding it.
///
/// All the state protected by the mutexes of this crate is left consistent between calls, so a
/// poisoned lock carries no more risk than a healthy one.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the offset of the first `00 00 01` start code in `data` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    (from..data.len() - 2).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

/// How a bitstream unit (the bytes following a start code) relates to access unit boundaries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitKind {
    /// Sequence or picture level header that belongs to the next picture.
    Header,
    /// First unit of a coded picture.
    Picture,
    /// Further slice of the current picture.
    PictureContinuation,
    /// Anything else, attached to the current access unit.
    Other,
}

/// Iterator over access units of a start-code delimited elementary stream.
///
/// Units are accumulated until a picture has been seen, after which the next header or new
/// picture starts the following access unit. The classification of each unit is codec specific
/// and provided by the caller.
pub struct AccessUnitIterator<'a, F: Fn(&[u8]) -> UnitKind> {
    data: &'a [u8],
    pos: usize,
    classify: F,
}

impl<'a, F: Fn(&[u8]) -> UnitKind> AccessUnitIterator<'a, F> {
    pub fn new(data: &'a [u8], classify: F) -> Self {
        Self {
            data,
            pos: 0,
            classify,
        }
    }

    /// Start of the unit whose `00 00 01` is at `sc`, including a leading zero byte if any.
    fn unit_start(&self, sc: usize, floor: usize) -> usize {
        if sc > floor && self.data[sc - 1] == 0 {
            sc - 1
        } else {
            sc
        }
    }
}

impl<'a, F: Fn(&[u8]) -> UnitKind> Iterator for AccessUnitIterator<'a, F> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let start = self.pos;
        let mut picture_started = false;
        let mut search = start;

        while let Some(sc) = find_start_code(self.data, search) {
            let unit_start = self.unit_start(sc, start);
            let kind = (self.classify)(&self.data[sc + 3..]);

            if picture_started && matches!(kind, UnitKind::Header | UnitKind::Picture) {
                self.pos = unit_start;
                return Some(&self.data[start..unit_start]);
            }
            if kind == UnitKind::Picture {
                picture_started = true;
            }
            search = sc + 3;
        }

        // Whatever is left forms the last access unit, even if no picture was identified.
        self.pos = self.data.len();
        Some(&self.data[start..])
    }
}
