// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer pool shared with a capture source.
//!
//! The pool is a fixed set of regions mapped once at [`BufferPool::initialize`]
//! and unmapped at [`BufferPool::teardown`]. Each region is owned either by
//! the source (queued for filling) or by the application (dequeued, readable
//! up to its valid length). Ownership changes only through
//! [`BufferPool::acquire_ready`] and [`BufferPool::release`].
//!
//! ```text
//!             initialize             acquire_ready
//!   (mapped) -----------> Source ------------------> Application
//!                           ^                             |
//!                           +---------- release ----------+
//! ```
//!
//! An acquired buffer is represented by an [`Acquired`] token. The token is
//! not `Clone` and [`BufferPool::release`] consumes it, so every acquire is
//! matched by at most one release. Its contents are borrowed from the pool
//! with [`BufferPool::data`]; the borrow must end before the token can be
//! released.

use crate::{
    error::{Error, Result},
    source::{CaptureSource, IoMethod, Wait},
};
use tracing::{debug, info, warn};
use unix_ts::Timestamp;

/// Which side currently holds a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Source,
    Application,
}

/// Snapshot of one buffer's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub capacity: usize,
    pub valid_length: usize,
    pub owner: Owner,
}

#[derive(Debug)]
struct Slot {
    capacity: usize,
    valid_length: usize,
    owner: Owner,
}

/// A filled buffer held by the application.
#[derive(Debug)]
pub struct Acquired {
    index: u32,
    valid_length: usize,
    sequence: u32,
    timestamp: Timestamp,
}

impl Acquired {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes filled by the source.
    pub fn len(&self) -> usize {
        self.valid_length
    }

    pub fn is_empty(&self) -> bool {
        self.valid_length == 0
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Outcome of [`BufferPool::acquire_ready`].
#[derive(Debug)]
pub enum Acquire {
    Ready(Acquired),
    /// The source has nothing ready yet; wait and try again.
    Retry,
}

pub struct BufferPool<S: CaptureSource> {
    source: S,
    method: IoMethod,
    slots: Vec<Slot>,
    torn_down: bool,
}

impl<S: CaptureSource> BufferPool<S> {
    /// Map `count` buffers from `source`, hand them all to it and start
    /// streaming.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] for any I/O method other than
    ///   [`IoMethod::Mmap`]
    /// - [`Error::InsufficientBuffers`] if the source grants fewer than two
    ///   buffers
    /// - [`Error::AllocationFailed`] if a buffer cannot be mapped
    /// - any error from enqueueing or starting the stream
    pub fn initialize(mut source: S, method: IoMethod, count: u32) -> Result<Self> {
        if method != IoMethod::Mmap {
            return Err(Error::Unsupported(method));
        }

        let granted = source.request_buffers(count)?;
        if granted < 2 {
            if let Err(err) = source.release_buffers() {
                warn!("{}: {}", source.name(), err);
            }
            return Err(Error::InsufficientBuffers {
                requested: count,
                granted,
            });
        }

        let slots = (0..granted)
            .map(|index| Slot {
                capacity: source.region(index).map_or(0, <[u8]>::len),
                valid_length: 0,
                owner: Owner::Source,
            })
            .collect();
        let mut pool = Self {
            source,
            method,
            slots,
            torn_down: false,
        };

        for index in 0..granted {
            pool.source.enqueue(index)?;
        }
        pool.source.start()?;

        info!(
            "{}: {} {} buffers of {} bytes",
            pool.source.name(),
            granted,
            method,
            pool.slots.first().map_or(0, |slot| slot.capacity)
        );
        Ok(pool)
    }

    /// Take the next buffer the source has filled.
    ///
    /// Returns [`Acquire::Retry`] when the source is not ready. Any other
    /// source failure is returned as an error.
    pub fn acquire_ready(&mut self) -> Result<Acquire> {
        if self.torn_down {
            return Err(Error::Protocol("acquire after teardown".to_string()));
        }

        let Some(filled) = self.source.dequeue()? else {
            return Ok(Acquire::Retry);
        };

        let slot = self.slots.get_mut(filled.index as usize).ok_or_else(|| {
            Error::Protocol(format!("source returned unknown buffer {}", filled.index))
        })?;
        if slot.owner != Owner::Source {
            return Err(Error::Protocol(format!(
                "buffer {} dequeued while held by the application",
                filled.index
            )));
        }

        let valid_length = if filled.bytes_used > slot.capacity {
            debug!(
                "buffer {} reports {} bytes used but holds {}, clamping",
                filled.index, filled.bytes_used, slot.capacity
            );
            slot.capacity
        } else {
            filled.bytes_used
        };

        slot.owner = Owner::Application;
        slot.valid_length = valid_length;
        Ok(Acquire::Ready(Acquired {
            index: filled.index,
            valid_length,
            sequence: filled.sequence,
            timestamp: filled.timestamp,
        }))
    }

    /// Block until the source has a buffer ready.
    pub fn wait_ready(&mut self) -> Result<Wait> {
        if self.torn_down {
            return Err(Error::Protocol("wait after teardown".to_string()));
        }
        self.source.wait_ready()
    }

    /// The filled bytes of an acquired buffer.
    pub fn data(&self, acquired: &Acquired) -> &[u8] {
        self.source
            .region(acquired.index)
            .and_then(|region| region.get(..acquired.valid_length))
            .unwrap_or(&[])
    }

    /// Return an acquired buffer to the source for refilling.
    ///
    /// If the source refuses the buffer it stays with the application and
    /// the error is returned.
    pub fn release(&mut self, acquired: Acquired) -> Result<()> {
        if self.torn_down {
            debug!("buffer {} released after teardown", acquired.index);
            return Ok(());
        }

        let slot = self
            .slots
            .get_mut(acquired.index as usize)
            .ok_or_else(|| {
                Error::Protocol(format!("release of unknown buffer {}", acquired.index))
            })?;
        if slot.owner != Owner::Application {
            return Err(Error::Protocol(format!(
                "release of buffer {} not held by the application",
                acquired.index
            )));
        }

        self.source.enqueue(acquired.index)?;
        slot.owner = Owner::Source;
        slot.valid_length = 0;
        Ok(())
    }

    /// Stop streaming and unmap every buffer, whoever holds it.
    ///
    /// Calling it again does nothing.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let stopped = self.source.stop();
        let released = self.source.release_buffers();
        let held = self
            .slots
            .iter()
            .filter(|slot| slot.owner == Owner::Application)
            .count();
        self.slots.clear();
        info!(
            "{}: buffers released ({} held by application)",
            self.source.name(),
            held
        );
        stopped.and(released)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn io_method(&self) -> IoMethod {
        self.method
    }

    pub fn owner(&self, index: u32) -> Option<Owner> {
        self.slots.get(index as usize).map(|slot| slot.owner)
    }

    pub fn buffers(&self) -> Vec<BufferInfo> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| BufferInfo {
                index: index as u32,
                capacity: slot.capacity,
                valid_length: slot.valid_length,
                owner: slot.owner,
            })
            .collect()
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: CaptureSource> Drop for BufferPool<S> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!("{}: teardown failed: {}", self.source.name(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{Event, SyntheticSource};
    use std::collections::BTreeSet;

    fn pool(count: u32) -> BufferPool<SyntheticSource> {
        let source = SyntheticSource::new("stub://pool").with_capacity(8192);
        BufferPool::initialize(source, IoMethod::Mmap, count).unwrap()
    }

    fn ready(pool: &mut BufferPool<SyntheticSource>) -> Acquired {
        match pool.acquire_ready().unwrap() {
            Acquire::Ready(acquired) => acquired,
            Acquire::Retry => panic!("source not ready"),
        }
    }

    /// Every buffer is either queued at the source or held by the
    /// application, never both and never neither.
    fn assert_exclusive(pool: &BufferPool<SyntheticSource>) {
        let queued: BTreeSet<u32> = pool.source().queued().into_iter().collect();
        for info in pool.buffers() {
            match info.owner {
                Owner::Source => assert!(queued.contains(&info.index), "{info:?} not queued"),
                Owner::Application => {
                    assert!(!queued.contains(&info.index), "{info:?} also queued")
                }
            }
        }
        let source_owned = pool
            .buffers()
            .iter()
            .filter(|info| info.owner == Owner::Source)
            .count();
        assert_eq!(source_owned, queued.len());
    }

    #[test]
    fn initialize_hands_every_buffer_to_source() {
        let pool = pool(4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.source().queued(), vec![0, 1, 2, 3]);
        assert!(pool.source().is_streaming());
        assert!(pool
            .buffers()
            .iter()
            .all(|info| info.owner == Owner::Source && info.capacity == 8192));
    }

    #[test]
    fn fewer_than_two_buffers_is_fatal() {
        let source = SyntheticSource::new("stub://one").with_max_buffers(1);
        match BufferPool::initialize(source, IoMethod::Mmap, 4) {
            Err(Error::InsufficientBuffers { requested, granted }) => {
                assert_eq!((requested, granted), (4, 1));
            }
            other => panic!("unexpected {:?}", other.map(|pool| pool.len())),
        }
    }

    #[test]
    fn mapping_failure_is_fatal() {
        let source = SyntheticSource::new("stub://map").with_map_failure(2);
        let err = BufferPool::initialize(source, IoMethod::Mmap, 4).err().unwrap();
        assert!(matches!(err, Error::AllocationFailed { index: 2, .. }));
    }

    #[test]
    fn only_mmap_is_implemented() {
        for method in [IoMethod::Read, IoMethod::UserPtr] {
            let source = SyntheticSource::new("stub://io");
            let err = BufferPool::initialize(source, method, 4).err().unwrap();
            assert!(matches!(err, Error::Unsupported(m) if m == method));
        }
    }

    #[test]
    fn acquire_and_release_transfer_ownership() {
        let mut pool = pool(3);
        let acquired = ready(&mut pool);
        assert_eq!(acquired.index(), 0);
        assert_eq!(pool.owner(0), Some(Owner::Application));
        assert_eq!(pool.data(&acquired).len(), acquired.len());
        assert_eq!(&pool.data(&acquired)[..2], &[0xFF, 0xD8]);
        assert_exclusive(&pool);

        pool.release(acquired).unwrap();
        assert_eq!(pool.owner(0), Some(Owner::Source));
        assert_eq!(pool.source().queued(), vec![1, 2, 0]);
        assert_exclusive(&pool);
    }

    #[test]
    fn overreported_length_is_clamped() {
        let spec = crate::synthetic::FrameSpec::default();
        let source = SyntheticSource::new("stub://liar")
            .with_capacity(8192)
            .with_script([Event::Overreport(spec, 4096), Event::Frame(spec)]);
        let mut pool = BufferPool::initialize(source, IoMethod::Mmap, 2).unwrap();

        let acquired = ready(&mut pool);
        assert_eq!(acquired.len(), 8192);
        assert_eq!(pool.buffers()[0].valid_length, 8192);
        let data = pool.data(&acquired);
        assert_eq!(data.len(), 8192);
        assert_eq!(data.as_ptr(), pool.source().region(0).unwrap().as_ptr());
        pool.release(acquired).unwrap();

        // an honest fill afterwards is not affected
        let acquired = ready(&mut pool);
        assert_eq!(acquired.len(), crate::synthetic::frame(&spec).len());
        assert!(acquired.len() <= pool.buffers()[1].capacity);
    }

    #[test]
    fn not_ready_is_retry() {
        let source = SyntheticSource::new("stub://retry").with_script([Event::NotReady]);
        let mut pool = BufferPool::initialize(source, IoMethod::Mmap, 2).unwrap();
        assert!(matches!(pool.acquire_ready().unwrap(), Acquire::Retry));
        assert!(matches!(pool.acquire_ready().unwrap(), Acquire::Ready(_)));
    }

    #[test]
    fn source_errors_are_fatal() {
        let source = SyntheticSource::new("stub://eio").with_script([Event::Fail(libc::EIO)]);
        let mut pool = BufferPool::initialize(source, IoMethod::Mmap, 2).unwrap();
        let err = pool.acquire_ready().unwrap_err();
        assert!(matches!(err, Error::Io { op: "VIDIOC_DQBUF", .. }));
    }

    #[test]
    fn releasing_a_source_owned_buffer_is_rejected() {
        let mut pool = pool(2);
        let forged = Acquired {
            index: 1,
            valid_length: 0,
            sequence: 0,
            timestamp: Timestamp::new(0, 0),
        };
        assert!(matches!(pool.release(forged), Err(Error::Protocol(_))));
        assert_exclusive(&pool);
    }

    #[test]
    fn ownership_stays_exclusive() {
        let mut pool = pool(4);
        let mut held = Vec::new();
        let mut state = 0x2545_f491u32;
        for _ in 0..200 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let acquire = held.is_empty() || (state % 3 != 0 && held.len() < pool.len());
            if acquire {
                held.push(ready(&mut pool));
            } else {
                let at = state as usize % held.len();
                let acquired = held.swap_remove(at);
                pool.release(acquired).unwrap();
            }
            assert_exclusive(&pool);
        }
    }

    #[test]
    fn teardown_is_idempotent_and_ignores_owner() {
        let mut pool = pool(3);
        let acquired = ready(&mut pool);
        pool.teardown().unwrap();
        assert!(pool.is_torn_down());
        assert!(pool.is_empty());
        assert!(!pool.source().is_streaming());
        assert_eq!(pool.source().mapped(), 0);
        assert!(pool.data(&acquired).is_empty());

        pool.teardown().unwrap();
        pool.release(acquired).unwrap();
        assert!(matches!(pool.acquire_ready(), Err(Error::Protocol(_))));
    }
}
