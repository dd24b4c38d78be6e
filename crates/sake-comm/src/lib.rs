//! # sake-comm
//!
//! Collective communication for data-parallel training.
//!
//! Every backend implements [`Communicator`], whose core operation is an
//! in-place `all_reduce_sum` over an `f32` buffer. Backends:
//!
//! - [`SingleProcess`]: world of one, all collectives are no-ops
//! - [`LocalGroup`]: thread-per-rank ring over in-process channels
//! - [`TcpRing`]: process-per-rank ring over TCP sockets
//!
//! ```rust,no_run
//! use sake_comm::{Communicator, LocalGroup};
//!
//! let handles: Vec<_> = LocalGroup::new(2)
//!     .into_iter()
//!     .map(|mut comm| {
//!         std::thread::spawn(move || {
//!             let mut grads = vec![comm.rank() as f32; 4];
//!             comm.all_reduce_mean(&mut grads).unwrap();
//!             grads
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     assert_eq!(h.join().unwrap(), vec![0.5; 4]);
//! }
//! ```

pub mod backend;
pub mod error;
pub mod local;
pub mod ring;
pub mod tcp;

pub use backend::{Communicator, SingleProcess};
pub use error::{CommError, CommResult};
pub use local::LocalGroup;
pub use ring::{ring_all_reduce, RingLink};
pub use tcp::TcpRing;
