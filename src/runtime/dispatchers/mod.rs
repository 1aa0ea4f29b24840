//! Dispatch loops of a [`Runtime`](super::Runtime).
//!
//! - `orchestration`: fetches instances with due messages and runs replay turns
//! - `worker`: executes activities, honouring session affinity and cancellation

mod orchestration;
mod worker;
