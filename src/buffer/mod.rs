// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Bounded sample storage: the per-capability ring histories and the
//! lock-free packet queue that carries decoded frames from the transport
//! notification threads to the service tick.

mod queue;
mod ring;

pub use queue::PacketQueue;
pub use ring::{RingBuffer, RingIter};
