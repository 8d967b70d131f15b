// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! A small async execution framework.
//!
//! Five pieces, leaves first:
//!
//! ```text
//!   AsyncSocket  --suspends on-->  Reactor  --wakes-->  Task  --driven by-->  Executor
//!                                                          \
//!                                                           `-- Generator (its own stack)
//! ```
//!
//! [`task::Task`] is a lazy unit of work; composing tasks is ordinary `.await`, with no extra
//! native stack frame per nesting level. [`executor::Executor`] is a fixed worker pool that
//! drives tasks submitted to it. [`reactor::Reactor`] is a single-threaded readiness multiplexer
//! that wakes task continuations when a socket becomes ready or a timer fires.
//! [`socket::AsyncSocket`] is the nonblocking socket facade built on top of it.
//! [`generator::Generator`] is unrelated to the other four except by family resemblance: it's a
//! genuinely stackful coroutine, used where a yielded value needs to be a reference into its
//! producer's own stack frame rather than a copy.
//!
//! ```
//! use reedux::task::{sync_wait, Task};
//!
//! let task: Task<i32> = Task::new(async { Ok(1 + 1) });
//! assert_eq!(sync_wait(task).unwrap(), 2);
//! ```

pub mod error;
pub mod executor;
pub mod fs;
pub mod generator;
pub mod reactor;
pub mod socket;
pub mod task;

pub use error::{Error, Result};
pub use executor::{Executor, JoinHandle};
pub use generator::Generator;
pub use reactor::Reactor;
pub use socket::AsyncSocket;
pub use task::{sync_wait, Task};
